use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::CoverageConfig;
use crate::enrichment::EnrichedOption;

/// Expiry collection outcome classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExpiryStatus {
    Ok,
    Partial,
    Empty,
}

impl ExpiryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Partial => "PARTIAL",
            Self::Empty => "EMPTY",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoverageReport {
    pub strike_coverage: f64,
    pub field_coverage: f64,
    pub interpolated_fraction: f64,
    pub status: ExpiryStatus,
    /// `strike_coverage * (1 - interpolated_fraction)`.
    pub quality_score: f64,
}

/// Classify one expiry from its realized rows against the requested strike
/// universe. `forced_partial` carries upstream stage failures so a clean
/// coverage number cannot mask them.
pub fn classify(
    requested_strikes: &[f64],
    rows: &[EnrichedOption],
    cfg: &CoverageConfig,
    forced_partial: bool,
) -> CoverageReport {
    if rows.is_empty() {
        return CoverageReport {
            strike_coverage: 0.0,
            field_coverage: 0.0,
            interpolated_fraction: 0.0,
            status: ExpiryStatus::Empty,
            quality_score: 0.0,
        };
    }

    let strike_coverage = if requested_strikes.is_empty() {
        0.0
    } else {
        let realized: BTreeSet<i64> = rows.iter().map(|r| r.strike.round() as i64).collect();
        let requested: BTreeSet<i64> =
            requested_strikes.iter().map(|s| s.round() as i64).collect();
        realized.intersection(&requested).count() as f64 / requested.len() as f64
    };

    let with_fields = rows
        .iter()
        .filter(|r| r.volume as f64 + r.oi as f64 + r.avg_price.unwrap_or(0.0) > 0.0)
        .count();
    let field_coverage = with_fields as f64 / rows.len() as f64;

    let interpolated = rows.iter().filter(|r| r.interpolated).count();
    let interpolated_fraction = interpolated as f64 / rows.len() as f64;

    let healthy = strike_coverage >= cfg.strike_coverage_ok
        && field_coverage >= cfg.field_coverage_ok
        && !forced_partial;
    let status = if healthy {
        ExpiryStatus::Ok
    } else {
        ExpiryStatus::Partial
    };

    CoverageReport {
        strike_coverage,
        field_coverage,
        interpolated_fraction,
        status,
        quality_score: strike_coverage * (1.0 - interpolated_fraction),
    }
}
