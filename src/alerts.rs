use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

use crate::config::AlertConfig;
use crate::coverage::ExpiryStatus;
use crate::pipeline::IndexCycleOutcome;

/// Closed alert taxonomy. Variants are declared alphabetically so the
/// derived ordering doubles as the deterministic processing order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    BucketUtilLow,
    ExpiryEmpty,
    IndexFailure,
    InternalError,
    InterpolationHigh,
    LiquidityLow,
    LowBothCoverage,
    LowFieldCoverage,
    LowStrikeCoverage,
    RiskDeltaDrift,
    StaleQuote,
    WideSpread,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BucketUtilLow => "bucket_util_low",
            Self::ExpiryEmpty => "expiry_empty",
            Self::IndexFailure => "index_failure",
            Self::InternalError => "internal_error",
            Self::InterpolationHigh => "interpolation_high",
            Self::LiquidityLow => "liquidity_low",
            Self::LowBothCoverage => "low_both_coverage",
            Self::LowFieldCoverage => "low_field_coverage",
            Self::LowStrikeCoverage => "low_strike_coverage",
            Self::RiskDeltaDrift => "risk_delta_drift",
            Self::StaleQuote => "stale_quote",
            Self::WideSpread => "wide_spread",
        }
    }
}

/// One alert trigger observed this cycle. `ratio` is observed/threshold
/// pressure (>= 1.0 means triggered); the severity machine grades on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_type: AlertType,
    pub index: Option<String>,
    pub expiry: Option<String>,
    pub message: String,
    pub ratio: f64,
}

impl AlertEvent {
    /// Severity scope key: one state machine instance per (type, scope).
    pub fn scope(&self) -> String {
        match (&self.index, &self.expiry) {
            (Some(i), Some(e)) => format!("{i}:{e}"),
            (Some(i), None) => i.clone(),
            _ => "global".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct DriftWindow {
    samples: VecDeque<(f64, usize)>,
}

/// Derives alert events from per-index cycle outcomes. Keeps the small
/// rolling state (streaks, drift windows) that multi-cycle triggers need.
pub struct AlertAggregator {
    cfg: AlertConfig,
    interp_streaks: HashMap<String, u32>,
    bucket_util_streaks: HashMap<String, u32>,
    drift_windows: HashMap<String, DriftWindow>,
}

impl AlertAggregator {
    pub fn new(cfg: AlertConfig) -> Self {
        Self {
            cfg,
            interp_streaks: HashMap::new(),
            bucket_util_streaks: HashMap::new(),
            drift_windows: HashMap::new(),
        }
    }

    pub fn evaluate(&mut self, outcomes: &[IndexCycleOutcome]) -> Vec<AlertEvent> {
        let mut events = Vec::new();
        for outcome in outcomes {
            self.evaluate_index(outcome, &mut events);
        }
        // Deterministic ordering for downstream consumers.
        events.sort_by(|a, b| {
            (a.alert_type, a.scope()).cmp(&(b.alert_type, b.scope()))
        });
        if !events.is_empty() {
            debug!("alert aggregator raised {} events", events.len());
        }
        events
    }

    /// Report a caught internal bug; repeated hits escalate via severity.
    pub fn internal_error(&self, context: &str) -> AlertEvent {
        AlertEvent {
            alert_type: AlertType::InternalError,
            index: None,
            expiry: None,
            message: format!("internal error: {context}"),
            ratio: 1.0,
        }
    }

    fn evaluate_index(&mut self, outcome: &IndexCycleOutcome, events: &mut Vec<AlertEvent>) {
        let index = outcome.index.clone();

        let all_unresolved =
            outcome.snapshots.is_empty() && !outcome.unresolved_tags.is_empty();
        if outcome.failure.is_some() || all_unresolved {
            events.push(AlertEvent {
                alert_type: AlertType::IndexFailure,
                index: Some(index.clone()),
                expiry: None,
                message: outcome
                    .failure
                    .clone()
                    .unwrap_or_else(|| "all expiry tags unresolved".to_string()),
                ratio: 1.0,
            });
        }

        // Index-level bucket utilization across expiries.
        let requested: usize = outcome.snapshots.iter().map(|s| s.requested_strikes).sum();
        if requested > 0 {
            let populated: usize = outcome
                .snapshots
                .iter()
                .map(|s| (s.strike_coverage * s.requested_strikes as f64).round() as usize)
                .sum();
            let util = populated as f64 / requested as f64;
            let streak = self.bucket_util_streaks.entry(index.clone()).or_default();
            if util < self.cfg.bucket_util_min {
                *streak += 1;
                if *streak >= self.cfg.bucket_util_streak {
                    events.push(AlertEvent {
                        alert_type: AlertType::BucketUtilLow,
                        index: Some(index.clone()),
                        expiry: None,
                        message: format!("bucket utilization {util:.2} for {} cycles", streak),
                        ratio: ratio_below(util, self.cfg.bucket_util_min),
                    });
                }
            } else {
                *streak = 0;
            }
        }

        for snap in &outcome.snapshots {
            let tag = snap.tag.as_str().to_string();
            let scope_key = format!("{index}:{tag}");

            if snap.status == ExpiryStatus::Empty {
                events.push(AlertEvent {
                    alert_type: AlertType::ExpiryEmpty,
                    index: Some(index.clone()),
                    expiry: Some(tag.clone()),
                    message: format!("no options realized ({:?})", snap.partial_reasons),
                    ratio: 1.0,
                });
                continue;
            }

            let low_strike = snap.strike_coverage < self.cfg.strike_cov_min;
            let low_field = snap.field_coverage < self.cfg.field_cov_min;
            match (low_strike, low_field) {
                (true, true) => events.push(AlertEvent {
                    alert_type: AlertType::LowBothCoverage,
                    index: Some(index.clone()),
                    expiry: Some(tag.clone()),
                    message: format!(
                        "strike {:.2} and field {:.2} coverage both low",
                        snap.strike_coverage, snap.field_coverage
                    ),
                    ratio: ratio_below(snap.strike_coverage, self.cfg.strike_cov_min)
                        .max(ratio_below(snap.field_coverage, self.cfg.field_cov_min)),
                }),
                (true, false) => events.push(AlertEvent {
                    alert_type: AlertType::LowStrikeCoverage,
                    index: Some(index.clone()),
                    expiry: Some(tag.clone()),
                    message: format!("strike coverage {:.2}", snap.strike_coverage),
                    ratio: ratio_below(snap.strike_coverage, self.cfg.strike_cov_min),
                }),
                (false, true) => events.push(AlertEvent {
                    alert_type: AlertType::LowFieldCoverage,
                    index: Some(index.clone()),
                    expiry: Some(tag.clone()),
                    message: format!("field coverage {:.2}", snap.field_coverage),
                    ratio: ratio_below(snap.field_coverage, self.cfg.field_cov_min),
                }),
                (false, false) => {}
            }

            // Interpolated fraction with consecutive-cycle gating.
            let interp_streak = self.interp_streaks.entry(scope_key.clone()).or_default();
            if snap.interpolated_fraction > self.cfg.interp_max_fraction {
                *interp_streak += 1;
                if *interp_streak >= self.cfg.interp_consec {
                    events.push(AlertEvent {
                        alert_type: AlertType::InterpolationHigh,
                        index: Some(index.clone()),
                        expiry: Some(tag.clone()),
                        message: format!(
                            "interpolated fraction {:.2} for {} cycles",
                            snap.interpolated_fraction, interp_streak
                        ),
                        ratio: snap.interpolated_fraction
                            / self.cfg.interp_max_fraction.max(f64::EPSILON),
                    });
                }
            } else {
                *interp_streak = 0;
            }

            self.check_drift(&scope_key, &index, &tag, snap.delta_notional(), snap.options.len(), events);
            self.check_per_option_heuristics(&index, &tag, snap, events);
        }
    }

    /// |delta-notional drift| over the rolling window, only while the row
    /// count is stable (±10%) so thin batches don't fake a drift.
    fn check_drift(
        &mut self,
        scope_key: &str,
        index: &str,
        tag: &str,
        delta_notional: f64,
        rows: usize,
        events: &mut Vec<AlertEvent>,
    ) {
        let window = self
            .drift_windows
            .entry(scope_key.to_string())
            .or_default();
        window.samples.push_back((delta_notional, rows));
        while window.samples.len() > self.cfg.risk_delta_drift_window.max(2) {
            window.samples.pop_front();
        }
        let (Some(&(first_dn, first_rows)), Some(&(last_dn, last_rows))) =
            (window.samples.front(), window.samples.back())
        else {
            return;
        };
        if window.samples.len() < 2 {
            return;
        }
        let rows_stable = {
            let (lo, hi) = (first_rows.min(last_rows) as f64, first_rows.max(last_rows) as f64);
            lo > 0.0 && (hi - lo) / hi <= 0.1
        };
        if !rows_stable || first_dn.abs() < f64::EPSILON {
            return;
        }
        let drift = (last_dn - first_dn).abs() / first_dn.abs();
        if drift >= self.cfg.risk_delta_drift_pct {
            events.push(AlertEvent {
                alert_type: AlertType::RiskDeltaDrift,
                index: Some(index.to_string()),
                expiry: Some(tag.to_string()),
                message: format!("delta-notional drift {:.1}% over window", drift * 100.0),
                ratio: drift / self.cfg.risk_delta_drift_pct.max(f64::EPSILON),
            });
        }
    }

    fn check_per_option_heuristics(
        &self,
        index: &str,
        tag: &str,
        snap: &crate::pipeline::ExpirySnapshot,
        events: &mut Vec<AlertEvent>,
    ) {
        let rows = &snap.options;
        if rows.is_empty() {
            return;
        }

        let liquid = rows.iter().filter(|r| r.volume > 0 || r.oi > 0).count() as f64
            / rows.len() as f64;
        if liquid < self.cfg.liquidity_min_fraction {
            events.push(AlertEvent {
                alert_type: AlertType::LiquidityLow,
                index: Some(index.to_string()),
                expiry: Some(tag.to_string()),
                message: format!("only {:.0}% of rows liquid", liquid * 100.0),
                ratio: ratio_below(liquid, self.cfg.liquidity_min_fraction),
            });
        }

        let avg_spread =
            rows.iter().map(|r| r.relative_spread()).sum::<f64>() / rows.len() as f64;
        if avg_spread > self.cfg.wide_spread_max {
            events.push(AlertEvent {
                alert_type: AlertType::WideSpread,
                index: Some(index.to_string()),
                expiry: Some(tag.to_string()),
                message: format!("average relative spread {:.3}", avg_spread),
                ratio: avg_spread / self.cfg.wide_spread_max.max(f64::EPSILON),
            });
        }

        let now = Utc::now();
        let stale = rows
            .iter()
            .filter(|r| (now - r.quote_ts).num_seconds() > self.cfg.stale_quote_seconds)
            .count();
        if stale > 0 {
            let fraction = stale as f64 / rows.len() as f64;
            events.push(AlertEvent {
                alert_type: AlertType::StaleQuote,
                index: Some(index.to_string()),
                expiry: Some(tag.to_string()),
                message: format!("{stale} quotes older than {}s", self.cfg.stale_quote_seconds),
                ratio: 1.0 + fraction,
            });
        }
    }

    /// Per-cycle totals for the panels layer.
    pub fn totals(events: &[AlertEvent]) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for ev in events {
            *totals.entry(ev.alert_type.as_str().to_string()).or_default() += 1;
        }
        totals
    }
}

/// Pressure ratio for a metric that triggered by falling below `min`:
/// 1.0 at the threshold, growing as the value sinks.
fn ratio_below(value: f64, min: f64) -> f64 {
    if value <= 0.0 {
        2.0
    } else {
        (min / value).max(1.0)
    }
}
