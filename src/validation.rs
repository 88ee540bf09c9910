use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use crate::config::CollectionConfig;
use crate::enrichment::EnrichedOption;

/// Result of the preventive validation pass over one expiry's rows.
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub rows: Vec<EnrichedOption>,
    pub partial_reasons: BTreeSet<String>,
    pub dropped_rows: usize,
    pub zero_field_rows: usize,
    /// Set when the foreign-expiry salvage heuristic rewrote the batch date.
    pub salvaged_expiry: Option<NaiveDate>,
}

/// Preventive row validation. Bad rows are dropped or repaired and the
/// expiry is tagged with `partial_reason` tokens; nothing here aborts the
/// index.
pub fn validate_rows(
    rows: Vec<EnrichedOption>,
    expected_expiry: NaiveDate,
    cfg: &CollectionConfig,
) -> ValidationOutcome {
    if cfg.validation_bypass {
        let mut partial_reasons = BTreeSet::new();
        partial_reasons.insert("bypassed".to_string());
        return ValidationOutcome {
            rows,
            partial_reasons,
            dropped_rows: 0,
            zero_field_rows: 0,
            salvaged_expiry: None,
        };
    }

    let mut partial_reasons = BTreeSet::new();
    let total_in = rows.len();

    // Foreign-expiry handling first: prune rows off the canonical date, or
    // salvage the batch when every row agrees on a single other date.
    let (rows, salvaged_expiry) = prune_foreign_expiry(rows, expected_expiry, cfg, &mut partial_reasons);

    let mut kept = Vec::with_capacity(rows.len());
    let mut zero_field_rows = 0usize;
    for mut row in rows {
        if row.last_price < 0.0 || row.bid < 0.0 || row.ask < 0.0 {
            partial_reasons.insert("negative_price".to_string());
            continue;
        }
        if let Some(iv) = row.iv {
            if !(0.0..=5.0).contains(&iv) {
                debug!("clearing implausible iv {} on {}", iv, row.symbol);
                row.iv = None;
                row.delta = None;
                partial_reasons.insert("implausible_iv".to_string());
            }
        }
        let field_sum = row.volume as f64 + row.oi as f64 + row.avg_price.unwrap_or(0.0);
        if field_sum <= 0.0 && !row.interpolated {
            zero_field_rows += 1;
            partial_reasons.insert("zero_rows".to_string());
        }
        kept.push(row);
    }

    let dropped_rows = total_in - kept.len();
    if dropped_rows > 0 {
        warn!(
            "validation dropped {}/{} rows for expiry {}",
            dropped_rows, total_in, expected_expiry
        );
    }

    ValidationOutcome {
        rows: kept,
        partial_reasons,
        dropped_rows,
        zero_field_rows,
        salvaged_expiry,
    }
}

fn prune_foreign_expiry(
    rows: Vec<EnrichedOption>,
    expected: NaiveDate,
    cfg: &CollectionConfig,
    partial_reasons: &mut BTreeSet<String>,
) -> (Vec<EnrichedOption>, Option<NaiveDate>) {
    let mut dates: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for row in &rows {
        *dates.entry(row.expiry_date).or_default() += 1;
    }

    if dates.len() == 1 {
        if let Some((&only, _)) = dates.iter().next() {
            if only == expected {
                return (rows, None);
            }
            // Whole batch on one foreign date: salvage rewrites the
            // canonical date, otherwise everything prunes.
            if cfg.foreign_expiry_salvage {
                warn!("salvaging batch expiry {} -> {}", expected, only);
                partial_reasons.insert("salvaged_expiry".to_string());
                return (rows, Some(only));
            }
        }
    }

    let before = rows.len();
    let kept: Vec<EnrichedOption> = rows
        .into_iter()
        .filter(|r| r.expiry_date == expected)
        .collect();
    if kept.len() < before {
        partial_reasons.insert("foreign_expiry".to_string());
    }
    (kept, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::OptionType;
    use chrono::Utc;

    fn row(strike: f64, expiry: NaiveDate) -> EnrichedOption {
        EnrichedOption {
            symbol: format!("NIFTY{}CE", strike as i64),
            index: "NIFTY".to_string(),
            expiry_date: expiry,
            strike,
            option_type: OptionType::CE,
            last_price: 100.0,
            volume: 10,
            oi: 10,
            bid: 99.0,
            ask: 101.0,
            avg_price: Some(100.0),
            iv: Some(0.2),
            delta: Some(0.5),
            quote_ts: Utc::now(),
            interpolated: false,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn bypass_tags_and_keeps_everything() {
        let expected = date(2025, 8, 7);
        let cfg = CollectionConfig {
            validation_bypass: true,
            ..CollectionConfig::default()
        };
        let mut bad = row(24_000.0, expected);
        bad.last_price = -5.0;
        let out = validate_rows(vec![bad], expected, &cfg);
        assert_eq!(out.rows.len(), 1);
        assert!(out.partial_reasons.contains("bypassed"));
    }

    #[test]
    fn negative_price_rows_dropped() {
        let expected = date(2025, 8, 7);
        let mut bad = row(24_000.0, expected);
        bad.bid = -1.0;
        let out = validate_rows(
            vec![row(23_950.0, expected), bad],
            expected,
            &CollectionConfig::default(),
        );
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.dropped_rows, 1);
        assert!(out.partial_reasons.contains("negative_price"));
    }

    #[test]
    fn implausible_iv_cleared_not_dropped() {
        let expected = date(2025, 8, 7);
        let mut odd = row(24_000.0, expected);
        odd.iv = Some(9.5);
        let out = validate_rows(vec![odd], expected, &CollectionConfig::default());
        assert_eq!(out.rows.len(), 1);
        assert!(out.rows[0].iv.is_none());
        assert!(out.partial_reasons.contains("implausible_iv"));
    }

    #[test]
    fn foreign_expiry_rows_pruned() {
        let expected = date(2025, 8, 7);
        let foreign = date(2025, 8, 14);
        let out = validate_rows(
            vec![row(24_000.0, expected), row(24_050.0, foreign)],
            expected,
            &CollectionConfig::default(),
        );
        assert_eq!(out.rows.len(), 1);
        assert!(out.partial_reasons.contains("foreign_expiry"));
        assert!(out.salvaged_expiry.is_none());
    }

    #[test]
    fn uniform_foreign_batch_salvaged_when_enabled() {
        let expected = date(2025, 8, 7);
        let foreign = date(2025, 8, 14);
        let cfg = CollectionConfig {
            foreign_expiry_salvage: true,
            ..CollectionConfig::default()
        };
        let out = validate_rows(
            vec![row(24_000.0, foreign), row(24_050.0, foreign)],
            expected,
            &cfg,
        );
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.salvaged_expiry, Some(foreign));
        assert!(out.partial_reasons.contains("salvaged_expiry"));
    }

    #[test]
    fn mixed_foreign_batch_always_prunes() {
        let expected = date(2025, 8, 7);
        let foreign = date(2025, 8, 14);
        let cfg = CollectionConfig {
            foreign_expiry_salvage: true,
            ..CollectionConfig::default()
        };
        let out = validate_rows(
            vec![row(24_000.0, expected), row(24_050.0, foreign)],
            expected,
            &cfg,
        );
        assert_eq!(out.rows.len(), 1);
        assert!(out.salvaged_expiry.is_none());
    }

    #[test]
    fn zero_field_rows_flagged_but_kept() {
        let expected = date(2025, 8, 7);
        let mut dead = row(24_000.0, expected);
        dead.volume = 0;
        dead.oi = 0;
        dead.avg_price = None;
        let out = validate_rows(vec![dead], expected, &CollectionConfig::default());
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.zero_field_rows, 1);
        assert!(out.partial_reasons.contains("zero_rows"));
    }
}
