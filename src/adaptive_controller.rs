use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::alerts::AlertType;
use crate::config::AdaptiveConfig;
use crate::severity::Severity;

/// Per-option metric emission granularity. Lower is richer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetailMode {
    Full,
    Band,
    Agg,
}

impl DetailMode {
    pub fn level(&self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Band => 1,
            Self::Agg => 2,
        }
    }

    pub fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Full,
            1 => Self::Band,
            _ => Self::Agg,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Band => "band",
            Self::Agg => "agg",
        }
    }
}

/// Cross-cutting pressure signals sampled once per cycle.
#[derive(Debug, Clone, Default)]
pub struct ControllerInputs {
    pub sla_breach_streak: u32,
    pub memory_tier: u8,
    pub cardinality_guard_active: bool,
    pub severity_by_type: BTreeMap<AlertType, Severity>,
}

/// One detail-mode change, for the audit trail and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveAction {
    pub index: String,
    pub cycle: u64,
    pub from: DetailMode,
    pub to: DetailMode,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct IndexState {
    mode: DetailMode,
    last_demote_cycle: Option<u64>,
    last_promote_cycle: Option<u64>,
    healthy_streak: u32,
    depth_scale: f64,
    low_coverage_streak: u32,
    healthy_coverage_streak: u32,
}

impl IndexState {
    fn new(initial_mode: DetailMode) -> Self {
        Self {
            mode: initial_mode,
            last_demote_cycle: None,
            last_promote_cycle: None,
            healthy_streak: 0,
            depth_scale: 1.0,
            low_coverage_streak: 0,
            healthy_coverage_streak: 0,
        }
    }
}

/// Drives per-index detail mode and strike-depth scaling from SLA, memory,
/// cardinality and severity pressure. Owns all long-lived per-index
/// adaptive state; updates are serialized behind one lock.
pub struct AdaptiveController {
    cfg: AdaptiveConfig,
    indices: Mutex<HashMap<String, IndexState>>,
}

impl AdaptiveController {
    pub fn new(cfg: AdaptiveConfig, index_symbols: &[String]) -> Self {
        let initial = DetailMode::from_level(cfg.min_detail_mode);
        let indices = index_symbols
            .iter()
            .map(|s| (s.clone(), IndexState::new(initial)))
            .collect();
        Self {
            cfg,
            indices: Mutex::new(indices),
        }
    }

    pub fn detail_mode(&self, index: &str) -> DetailMode {
        self.indices
            .lock()
            .get(index)
            .map(|s| s.mode)
            .unwrap_or(DetailMode::Full)
    }

    pub fn depth_scale(&self, index: &str) -> f64 {
        self.indices
            .lock()
            .get(index)
            .map(|s| s.depth_scale)
            .unwrap_or(1.0)
    }

    pub fn modes(&self) -> BTreeMap<String, DetailMode> {
        self.indices
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.mode))
            .collect()
    }

    pub fn depth_scales(&self) -> BTreeMap<String, f64> {
        self.indices
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.depth_scale))
            .collect()
    }

    /// Evaluate demote/promote rules for every index. Mutates state and
    /// returns the actions taken, in index order.
    pub fn plan_cycle(&self, cycle: u64, inputs: &ControllerInputs) -> Vec<AdaptiveAction> {
        let mut actions = Vec::new();
        let mut indices = self.indices.lock();
        let mut symbols: Vec<String> = indices.keys().cloned().collect();
        symbols.sort();

        let demote_reason = self.demote_reason(inputs);
        let warn_blocked = self.cfg.severity_feedback
            && inputs.severity_by_type.iter().any(|(ty, sev)| {
                *sev >= Severity::Warn && self.severity_type_configured(ty)
            });

        for symbol in symbols {
            let state = indices.get_mut(&symbol).expect("index registered");

            if let Some(reason) = &demote_reason {
                state.healthy_streak = 0;
                let cooled = state
                    .last_demote_cycle
                    .map(|c| cycle.saturating_sub(c) >= self.cfg.demote_cooldown as u64)
                    .unwrap_or(true);
                if cooled && state.mode.level() < self.cfg.max_detail_mode {
                    let from = state.mode;
                    state.mode = DetailMode::from_level(state.mode.level() + 1);
                    state.last_demote_cycle = Some(cycle);
                    info!(
                        "📉 detail mode {} {} -> {} ({})",
                        symbol,
                        from.as_str(),
                        state.mode.as_str(),
                        reason
                    );
                    actions.push(AdaptiveAction {
                        index: symbol.clone(),
                        cycle,
                        from,
                        to: state.mode,
                        reason: reason.clone(),
                    });
                }
                continue;
            }

            // All pressures clear: accrue health, maybe promote.
            state.healthy_streak += 1;
            if warn_blocked {
                debug!("promotion blocked for {} by active warn severity", symbol);
                continue;
            }
            if state.mode.level() <= self.cfg.min_detail_mode {
                continue;
            }
            if state.healthy_streak < self.cfg.min_health_cycles {
                continue;
            }
            let cooled = state
                .last_promote_cycle
                .map(|c| cycle.saturating_sub(c) >= self.cfg.promote_cooldown as u64)
                .unwrap_or(true);
            if !cooled {
                continue;
            }

            let levels = if self.cfg.healthy_recovery_multi {
                (state.healthy_streak / self.cfg.min_health_cycles.max(1)).max(1)
            } else {
                1
            };
            let from = state.mode;
            let target = state
                .mode
                .level()
                .saturating_sub(levels.min(u32::from(u8::MAX)) as u8)
                .max(self.cfg.min_detail_mode);
            state.mode = DetailMode::from_level(target);
            state.last_promote_cycle = Some(cycle);
            state.healthy_streak = 0;
            info!(
                "📈 detail mode {} {} -> {} (healthy recovery)",
                symbol,
                from.as_str(),
                state.mode.as_str()
            );
            actions.push(AdaptiveAction {
                index: symbol.clone(),
                cycle,
                from,
                to: state.mode,
                reason: "healthy_recovery".to_string(),
            });
        }
        actions
    }

    fn demote_reason(&self, inputs: &ControllerInputs) -> Option<String> {
        if inputs.sla_breach_streak >= self.cfg.max_sla_breach_streak {
            return Some(format!("sla_breach_streak={}", inputs.sla_breach_streak));
        }
        if inputs.memory_tier >= 2 {
            return Some(format!("memory_tier={}", inputs.memory_tier));
        }
        if inputs.cardinality_guard_active {
            return Some("cardinality_guard".to_string());
        }
        if self.cfg.severity_feedback {
            for (ty, sev) in &inputs.severity_by_type {
                if *sev == Severity::Critical && self.severity_type_configured(ty) {
                    return Some(format!("severity_critical={}", ty.as_str()));
                }
            }
        }
        None
    }

    fn severity_type_configured(&self, ty: &AlertType) -> bool {
        self.cfg.severity_feedback_types.is_empty()
            || self
                .cfg
                .severity_feedback_types
                .iter()
                .any(|t| t == ty.as_str())
    }

    /// Strike-depth scaling (orthogonal to detail mode): shrink after a run
    /// of low-coverage cycles, restore one step after a healthy run.
    /// Returns the new scale when it changed.
    pub fn record_strike_coverage(
        &self,
        index: &str,
        coverage: f64,
        coverage_ok: f64,
    ) -> Option<f64> {
        let mut indices = self.indices.lock();
        let state = indices.get_mut(index)?;

        if coverage < coverage_ok {
            state.healthy_coverage_streak = 0;
            state.low_coverage_streak += 1;
            if state.low_coverage_streak >= self.cfg.strike_breach_threshold {
                state.low_coverage_streak = 0;
                let next =
                    (state.depth_scale * self.cfg.strike_reduction).max(self.cfg.strike_scale_floor);
                if (next - state.depth_scale).abs() > f64::EPSILON {
                    state.depth_scale = next;
                    info!("📏 strike depth {} scaled down to {:.2}", index, next);
                    return Some(next);
                }
            }
            None
        } else {
            state.low_coverage_streak = 0;
            state.healthy_coverage_streak += 1;
            if state.healthy_coverage_streak >= self.cfg.strike_restore_healthy
                && state.depth_scale < 1.0
            {
                state.healthy_coverage_streak = 0;
                let next = (state.depth_scale / self.cfg.strike_reduction).min(1.0);
                state.depth_scale = next;
                info!("📏 strike depth {} restored to {:.2}", index, next);
                return Some(next);
            }
            None
        }
    }
}
