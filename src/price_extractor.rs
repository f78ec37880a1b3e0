// src/price_extractor.rs
//! Category price ladder and per-line corrections (C4).
//!
//! Each of the four cabin categories is resolved independently through a
//! fallback ladder (spec §4.4): direct top-level fields, then
//! `cheapest.prices`, then `cheapest.combined`, then a derived minimum over
//! the detailed `prices` rate/cabin/occupancy table. `cheapest.cachedprices`
//! is never read here; it is audit-only and stays in `rawData`.

use crate::types::ExtractedPrices;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

/// Riviera Travel's historical anomaly: prices are stored ×1000.
const LINE_329: i32 = 329;

/// Per-line category price corrections, a table lookup per spec §4.4,
/// extensible by adding match arms.
fn correction_for(line_id: i32) -> Option<fn(Decimal) -> Decimal> {
    match line_id {
        LINE_329 => Some(|price| price / Decimal::from(1000)),
        _ => None,
    }
}

/// Extracts `{interior,oceanview,balcony,suite,cheapest,cheapestCabinType}`
/// from a canonical record's raw JSON, applying the line-329 correction.
pub fn extract(raw: &Value, line_id: i32) -> ExtractedPrices {
    let correction = correction_for(line_id);

    let mut prices = ExtractedPrices {
        interior: resolve_category(raw, "inside"),
        oceanview: resolve_category(raw, "outside"),
        balcony: resolve_category(raw, "balcony"),
        suite: resolve_category(raw, "suite"),
        cheapest: None,
        cheapest_cabin_type: None,
    };

    if let Some(correct) = correction {
        prices.interior = prices.interior.map(correct);
        prices.oceanview = prices.oceanview.map(correct);
        prices.balcony = prices.balcony.map(correct);
        prices.suite = prices.suite.map(correct);
    }

    prices.with_derived_cheapest()
}

/// Resolves one cabin category through the fallback ladder. `tag` is the
/// provider's field-name fragment for the category: `inside`, `outside`,
/// `balcony`, `suite`.
fn resolve_category(raw: &Value, tag: &str) -> Option<Decimal> {
    direct_field(raw, tag)
        .or_else(|| nested_field(raw, &["cheapest", "prices"], tag))
        .or_else(|| nested_field(raw, &["cheapest", "combined"], tag))
        .or_else(|| derived_minimum(raw, tag))
}

fn direct_field(raw: &Value, tag: &str) -> Option<Decimal> {
    let key = format!("cheapest{}", tag);
    decimal_at(raw.get(&key))
}

fn nested_field(raw: &Value, path: &[&str], tag: &str) -> Option<Decimal> {
    let mut cursor = raw;
    for segment in path {
        cursor = cursor.get(segment)?;
    }
    decimal_at(cursor.get(tag))
}

/// Derives the minimum price for `tag` over the detailed
/// `prices{rate -> cabin -> occupancy -> price}` object, classifying each
/// cabin code to a category by its leading letter, the provider's loose
/// convention (`I*` interior, `O*` oceanview, `B*` balcony, `S*`/`Q*` suite).
fn derived_minimum(raw: &Value, tag: &str) -> Option<Decimal> {
    let prices = raw.get("prices")?.as_object()?;
    let mut best: Option<Decimal> = None;

    for rate in prices.values() {
        let Some(cabins) = rate.as_object() else { continue };
        for (cabin_code, occupancies) in cabins {
            if category_for_cabin_code(cabin_code) != Some(tag) {
                continue;
            }
            let Some(occupancies) = occupancies.as_object() else { continue };
            for price_value in occupancies.values() {
                if let Some(p) = decimal_value(price_value) {
                    if p > Decimal::ZERO {
                        best = Some(match best {
                            Some(b) if b <= p => b,
                            _ => p,
                        });
                    }
                }
            }
        }
    }

    best
}

fn category_for_cabin_code(code: &str) -> Option<&'static str> {
    match code.chars().next()?.to_ascii_uppercase() {
        'I' => Some("inside"),
        'O' => Some("outside"),
        'B' => Some("balcony"),
        'S' | 'Q' => Some("suite"),
        _ => None,
    }
}

fn decimal_at(value: Option<&Value>) -> Option<Decimal> {
    value.and_then(decimal_value)
}

fn decimal_value(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(|f| Decimal::from_str(&f.to_string()).ok()),
        Value::String(s) => Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn direct_fields_take_priority() {
        let raw = json!({
            "cheapestinside": 899.00,
            "cheapestoutside": 999.00,
            "cheapestbalcony": 1199.00,
            "cheapestsuite": 1599.00,
        });
        let prices = extract(&raw, 22);
        assert_eq!(prices.interior, Some(Decimal::from_str("899.00").unwrap()));
        assert_eq!(prices.cheapest, Some(Decimal::from_str("899.00").unwrap()));
        assert_eq!(prices.cheapest_cabin_type.as_deref(), Some("interior"));
    }

    #[test]
    fn falls_back_to_combined_when_direct_fields_missing() {
        let raw = json!({
            "cheapest": {
                "combined": {
                    "inside": 700.0,
                    "outside": 800.0,
                    "balcony": 900.0,
                    "suite": 1500.0,
                }
            }
        });
        let prices = extract(&raw, 22);
        assert_eq!(prices.interior, Some(Decimal::from_str("700").unwrap()));
        assert_eq!(prices.cheapest_cabin_type.as_deref(), Some("interior"));
    }

    #[test]
    fn falls_back_to_derived_minimum_over_detailed_prices() {
        let raw = json!({
            "prices": {
                "rate1": {
                    "I2": {"1": 650.0, "2": 620.0},
                    "O1": {"1": 720.0},
                },
                "rate2": {
                    "I2": {"1": 610.0},
                }
            }
        });
        let prices = extract(&raw, 22);
        assert_eq!(prices.interior, Some(Decimal::from_str("610").unwrap()));
        assert_eq!(prices.oceanview, Some(Decimal::from_str("720").unwrap()));
    }

    #[test]
    fn cachedprices_are_never_used() {
        let raw = json!({
            "cheapest": {
                "cachedprices": {"inside": 1.0}
            }
        });
        let prices = extract(&raw, 22);
        assert_eq!(prices.interior, None);
        assert_eq!(prices.cheapest, None);
    }

    #[test]
    fn line_329_correction_divides_by_1000() {
        let raw = json!({"cheapestinside": 120000.0});
        let prices = extract(&raw, 329);
        assert_eq!(prices.interior, Some(Decimal::from_str("120").unwrap()));
        assert_eq!(prices.cheapest, Some(Decimal::from_str("120").unwrap()));
    }

    #[test]
    fn all_null_or_zero_yields_no_cheapest() {
        let raw = json!({"cheapestinside": 0.0, "cheapestoutside": null});
        let prices = extract(&raw, 22);
        assert_eq!(prices.cheapest, None);
        assert_eq!(prices.cheapest_cabin_type, None);
    }
}
