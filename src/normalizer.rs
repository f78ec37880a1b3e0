// src/normalizer.rs
//! Tolerant JSON normalization (C3).
//!
//! The provider's files arrive in one of three pathological shapes: a proper
//! object, a JSON string that itself decodes to the proper object
//! (double-encoded), or an object keyed by decimal-string indices whose
//! values are single characters (the string form split character-by-character).
//! Detection and reconstruction happen here; everything downstream operates
//! only on [`CanonicalRecord`].

use crate::errors::IngestError;
use crate::types::{CanonicalRecord, ItineraryDayRaw, RawRecord};
use log::warn;
use serde_json::Value;

const RAW_PREFIX_LOG_BYTES: usize = 512;

/// Detects the shape of `bytes` and reconstructs it into a [`RawRecord`].
///
/// Detection order (spec §4.3):
/// 1. Char-indexed object (keys `"0"`, `"1"`, `"2"`, `value["0"]` length 1).
/// 2. A JSON string, re-parsed (applying rule 1 recursively to the result).
/// 3. Otherwise accepted as-is.
pub fn detect_and_reconstruct(path: &str, bytes: &[u8]) -> Result<RawRecord, IngestError> {
    let top: Value = serde_json::from_slice(bytes).map_err(|e| normalization_failed(path, bytes, &e))?;
    reconstruct(path, bytes, top, 0)
}

fn reconstruct(path: &str, raw_bytes: &[u8], value: Value, depth: u32) -> Result<RawRecord, IngestError> {
    // Guard against pathologically deep nested (b)/(c) combinations.
    if depth > 8 {
        return Err(IngestError::NormalizationFailed {
            path: path.to_string(),
            reason: "exceeded maximum normalization recursion depth".to_string(),
        });
    }

    if let Some(reconstructed) = try_char_indexed(&value) {
        let inner: Value = serde_json::from_str(&reconstructed)
            .map_err(|e| normalization_failed(path, raw_bytes, &e))?;
        return Ok(RawRecord::CharIndexed(inner));
    }

    if let Value::String(s) = &value {
        let inner: Value = serde_json::from_str(s).map_err(|e| normalization_failed(path, raw_bytes, &e))?;
        return match reconstruct(path, raw_bytes, inner, depth + 1)? {
            RawRecord::Proper(v) | RawRecord::JsonString(v) | RawRecord::CharIndexed(v) => {
                Ok(RawRecord::JsonString(v))
            }
        };
    }

    Ok(RawRecord::Proper(value))
}

/// Form (c): object keyed by ascending decimal-string indices, each a
/// length-1 string. Reconstructs by concatenating `value["0"]`, `value["1"]`,
/// ... while present.
fn try_char_indexed(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    let first = obj.get("0")?.as_str()?;
    if first.chars().count() != 1 {
        return None;
    }
    if !obj.contains_key("1") || !obj.contains_key("2") {
        return None;
    }

    let mut out = String::with_capacity(obj.len());
    let mut i: u64 = 0;
    loop {
        match obj.get(&i.to_string()).and_then(|v| v.as_str()) {
            Some(ch) => {
                out.push_str(ch);
                i += 1;
            }
            None => break,
        }
    }
    Some(out)
}

fn normalization_failed(path: &str, raw_bytes: &[u8], err: &serde_json::Error) -> IngestError {
    let prefix_len = raw_bytes.len().min(RAW_PREFIX_LOG_BYTES);
    let prefix = String::from_utf8_lossy(&raw_bytes[..prefix_len]);
    warn!(
        "normalization failed for {}: {} (raw prefix: {:?})",
        path, err, prefix
    );
    crate::metrics::increment_normalization_failed();
    IngestError::NormalizationFailed {
        path: path.to_string(),
        reason: err.to_string(),
    }
}

/// Converts a reconstructed [`RawRecord`] into the canonical in-memory
/// record (spec §4.3's output field list).
pub fn canonicalize(record: &RawRecord) -> CanonicalRecord {
    let v = record.value();
    let code_to_cruise_id = field_str(v, "codetocruiseid").unwrap_or_default();
    let line_id = field_i32(v, "lineid").unwrap_or_default();
    let ship_id = field_i32(v, "shipid").unwrap_or_default();

    CanonicalRecord {
        cruise_id: field_i64(v, "cruiseid"),
        code_to_cruise_id,
        line_id,
        ship_id,
        name: field_str(v, "name"),
        sail_date: field_date(v, "saildate"),
        start_date: field_date(v, "startdate"),
        nights: field_i32(v, "nights"),
        start_port_id: field_i32(v, "startportid"),
        end_port_id: field_i32(v, "endportid"),
        port_ids: field_i32_array(v, "portids"),
        region_ids: field_i32_array(v, "regionids"),
        market_id: field_i32(v, "marketid"),
        owner_id: field_i32(v, "ownerid"),
        ship_content: v.get("shipcontent").cloned(),
        line_content: v.get("linecontent").cloned(),
        itinerary: parse_itinerary(v),
        raw: v.clone(),
    }
}

fn parse_itinerary(v: &Value) -> Vec<ItineraryDayRaw> {
    let Some(items) = v.get("itinerary").and_then(|i| i.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .map(|(idx, item)| ItineraryDayRaw {
            day_number: field_i32(item, "daynumber").unwrap_or(idx as i32 + 1),
            port_id: field_i32(item, "portid"),
            arrive_time: field_str(item, "arrivetime"),
            depart_time: field_str(item, "departtime"),
            description: field_str(item, "description"),
        })
        .collect()
}

fn field_str(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|f| f.as_str()).map(|s| s.to_string())
}

fn field_i32(v: &Value, key: &str) -> Option<i32> {
    v.get(key).and_then(|f| {
        f.as_i64()
            .or_else(|| f.as_str().and_then(|s| s.parse().ok()))
            .map(|n| n as i32)
    })
}

fn field_i64(v: &Value, key: &str) -> Option<i64> {
    v.get(key)
        .and_then(|f| f.as_i64().or_else(|| f.as_str().and_then(|s| s.parse().ok())))
}

fn field_i32_array(v: &Value, key: &str) -> Vec<i32> {
    v.get(key)
        .and_then(|f| f.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|x| x.as_i64().or_else(|| x.as_str().and_then(|s| s.parse().ok())))
                .map(|n| n as i32)
                .collect()
        })
        .unwrap_or_default()
}

fn field_date(v: &Value, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    let s = field_str(v, key)?;
    chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
        .ok()
        .map(|d| chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
            d.and_hms_opt(0, 0, 0).unwrap_or_default(),
            chrono::Utc,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_proper_object() {
        let bytes = br#"{"cruiseid":1,"codetocruiseid":"1","lineid":22,"shipid":180}"#;
        let record = detect_and_reconstruct("test.json", bytes).unwrap();
        assert!(matches!(record, RawRecord::Proper(_)));
        let canon = canonicalize(&record);
        assert_eq!(canon.line_id, 22);
        assert_eq!(canon.ship_id, 180);
    }

    #[test]
    fn recovers_double_encoded_string() {
        // Form (b): a JSON string that itself decodes to the proper object.
        let bytes = br#""{\"cruiseid\":1,\"cheapestinside\":100}""#;
        let record = detect_and_reconstruct("test.json", bytes).unwrap();
        assert!(matches!(record, RawRecord::JsonString(_)));
        assert_eq!(record.value().get("cheapestinside").unwrap(), 100);
    }

    #[test]
    fn reconstructs_char_indexed_object() {
        // Form (c): object keyed by ascending decimal-string indices.
        let inner = r#"{"cruiseid":1,"cheapestinside":100}"#;
        let mut obj = serde_json::Map::new();
        for (i, ch) in inner.chars().enumerate() {
            obj.insert(i.to_string(), Value::String(ch.to_string()));
        }
        let bytes = serde_json::to_vec(&Value::Object(obj)).unwrap();

        let record = detect_and_reconstruct("test.json", &bytes).unwrap();
        assert!(matches!(record, RawRecord::CharIndexed(_)));
        assert_eq!(record.value().get("cheapestinside").unwrap(), 100);
    }

    #[test]
    fn reconstructs_large_char_indexed_object() {
        let inner_value: String = (0..2000)
            .map(|i| format!(r#""f{i}":{i}"#))
            .collect::<Vec<_>>()
            .join(",");
        let inner = format!("{{{}}}", inner_value);
        let mut obj = serde_json::Map::new();
        for (i, ch) in inner.chars().enumerate() {
            obj.insert(i.to_string(), Value::String(ch.to_string()));
        }
        let bytes = serde_json::to_vec(&Value::Object(obj)).unwrap();

        let record = detect_and_reconstruct("big.json", &bytes).unwrap();
        assert!(matches!(record, RawRecord::CharIndexed(_)));
        assert_eq!(record.value().get("f0").unwrap(), 0);
        assert_eq!(record.value().get("f1999").unwrap(), 1999);
    }

    #[test]
    fn rejects_garbage_bytes() {
        let bytes = b"not json at all {{{";
        let err = detect_and_reconstruct("bad.json", bytes).unwrap_err();
        assert!(matches!(err, IngestError::NormalizationFailed { .. }));
    }
}
