// src/discovery.rs
//! File discovery over the provider's `/YYYY/MM/<lineId>/<shipId>/<codeToCruiseId>.json`
//! layout (C2).

use crate::ftp_pool::FtpPool;
use crate::types::FileRef;
use chrono::{Datelike, Utc};
use log::warn;
use std::sync::Arc;

/// Enumerates all JSON files for `line_id` across `[window_start, window_end]`
/// months. Inaccessible subdirectories are skipped without failing the
/// overall enumeration, per spec §4.2.
pub async fn discover(
    pool: &Arc<FtpPool>,
    line_id: i32,
    window_months: u32,
) -> Vec<FileRef> {
    let now = Utc::now();
    let mut refs = Vec::new();

    for offset in 0..window_months {
        let (year, month) = add_months(now.year(), now.month(), offset);
        let line_path = format!("/{:04}/{:02}/{}", year, month, line_id);

        let ship_entries = pool.list(&line_path).await.unwrap_or_default();
        if ship_entries.is_empty() {
            continue;
        }

        for ship_entry in ship_entries.iter().filter(|e| e.is_dir) {
            let ship_id: i32 = match ship_entry.name.parse() {
                Ok(id) => id,
                Err(_) => {
                    warn!("discovery: unexpected ship directory name {:?}", ship_entry.name);
                    continue;
                }
            };

            let ship_path = format!("{}/{}", line_path, ship_entry.name);
            let file_entries = pool.list(&ship_path).await.unwrap_or_default();

            for file_entry in file_entries
                .iter()
                .filter(|e| !e.is_dir && e.name.ends_with(".json"))
            {
                let code_to_cruise_id = file_entry.name.trim_end_matches(".json").to_string();
                refs.push(FileRef {
                    path: format!("{}/{}", ship_path, file_entry.name),
                    year: year as u16,
                    month: month as u8,
                    line_id,
                    ship_id,
                    code_to_cruise_id,
                    size: file_entry.size,
                    last_modified: now,
                });
            }
        }
    }

    refs
}

fn add_months(year: i32, month: u32, offset: u32) -> (i32, u32) {
    let total = (year as i64) * 12 + (month as i64 - 1) + offset as i64;
    let year = (total / 12) as i32;
    let month = (total % 12 + 1) as u32;
    (year, month)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_months_rolls_over_year() {
        assert_eq!(add_months(2025, 11, 2), (2026, 1));
        assert_eq!(add_months(2025, 1, 0), (2025, 1));
        assert_eq!(add_months(2025, 12, 1), (2026, 1));
    }
}
