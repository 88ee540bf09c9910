use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::alerts::{AlertEvent, AlertType};
use crate::config::SeverityConfig;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Critical => "critical",
        }
    }

    fn level(&self) -> u8 {
        match self {
            Self::Info => 0,
            Self::Warn => 1,
            Self::Critical => 2,
        }
    }

    fn from_level(level: u8) -> Self {
        match level {
            0 => Self::Info,
            1 => Self::Warn,
            _ => Self::Critical,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Severity state for one (alert type, scope) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityState {
    pub current: Severity,
    pub streak: u32,
    pub idle_cycles: u32,
    pub last_change_cycle: u64,
    pub active_since_cycle: u64,
    pub smoothed_ratio: f64,
    pub last_ratio: f64,
}

impl Default for SeverityState {
    fn default() -> Self {
        Self {
            current: Severity::Info,
            streak: 0,
            idle_cycles: 0,
            last_change_cycle: 0,
            active_since_cycle: 0,
            smoothed_ratio: 0.0,
            last_ratio: 0.0,
        }
    }
}

/// A severity level change emitted this cycle. `resolved` is true exactly
/// once per elevated episode, on the decay transition that lands on info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityTransition {
    pub alert_type: AlertType,
    pub scope: String,
    pub from: Severity,
    pub to: Severity,
    pub cycle: u64,
    pub resolved: bool,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedSeverity {
    states: BTreeMap<String, SeverityState>,
}

/// Streak/decay severity state machine over alert events. Promotions need
/// a minimum streak plus the metric crossing the level's threshold ratio;
/// quiet cycles decay one level per `decay_cycles` (multi-step when long
/// idle); all transitions respect their cooldowns.
pub struct SeverityStateMachine {
    cfg: SeverityConfig,
    states: BTreeMap<(AlertType, String), SeverityState>,
    state_path: Option<PathBuf>,
}

impl SeverityStateMachine {
    pub fn new(cfg: SeverityConfig, alerts_state_dir: Option<&Path>) -> Self {
        let state_path = alerts_state_dir.map(|d| d.join("severity_state.json"));
        let mut machine = Self {
            cfg,
            states: BTreeMap::new(),
            state_path,
        };
        machine.load_persisted();
        machine
    }

    fn floor(&self) -> Severity {
        self.cfg
            .force_floor
            .as_deref()
            .and_then(Severity::parse)
            .unwrap_or(Severity::Info)
    }

    /// Feed one cycle of alert events; returns the transitions that fired.
    /// Events are processed in (type, scope) order for determinism.
    pub fn apply_cycle(&mut self, cycle: u64, events: &[AlertEvent]) -> Vec<SeverityTransition> {
        let mut triggered: BTreeMap<(AlertType, String), f64> = BTreeMap::new();
        for ev in events {
            let key = (ev.alert_type, ev.scope());
            let slot = triggered.entry(key).or_insert(0.0);
            *slot = slot.max(ev.ratio);
        }

        let mut transitions = Vec::new();
        let floor = self.floor();

        // Triggered keys: bump streaks and consider promotion.
        for (key, ratio) in &triggered {
            let state = self.states.entry(key.clone()).or_default();
            state.streak += 1;
            state.idle_cycles = 0;
            state.last_ratio = *ratio;
            state.smoothed_ratio = if self.cfg.trend_smooth > 0.0 {
                state.smoothed_ratio * (1.0 - self.cfg.trend_smooth)
                    + ratio * self.cfg.trend_smooth
            } else {
                *ratio
            };

            let effective = state.last_ratio.max(if self.cfg.trend_smooth > 0.0 {
                state.smoothed_ratio
            } else {
                0.0
            });

            let promote_to = match state.current {
                Severity::Info
                    if state.streak >= self.cfg.min_streak
                        && (effective >= self.cfg.warn_ratio
                            || (self.cfg.trend_smooth > 0.0
                                && state.smoothed_ratio >= self.cfg.trend_warn_ratio)) =>
                {
                    Some(Severity::Warn)
                }
                Severity::Warn
                    if state.streak >= self.cfg.min_streak
                        && (effective >= self.cfg.critical_ratio
                            || (self.cfg.trend_smooth > 0.0
                                && state.smoothed_ratio >= self.cfg.trend_critical_ratio)) =>
                {
                    Some(Severity::Critical)
                }
                _ => None,
            };

            if let Some(to) = promote_to {
                if cycle.saturating_sub(state.last_change_cycle) >= self.cfg.promote_cooldown as u64
                    || state.last_change_cycle == 0
                {
                    let from = state.current;
                    state.current = to;
                    state.last_change_cycle = cycle;
                    if from == Severity::Info {
                        state.active_since_cycle = cycle;
                    }
                    info!(
                        "⬆️  severity {}:{} {} -> {}",
                        key.0.as_str(),
                        key.1,
                        from.as_str(),
                        to.as_str()
                    );
                    transitions.push(SeverityTransition {
                        alert_type: key.0,
                        scope: key.1.clone(),
                        from,
                        to,
                        cycle,
                        resolved: false,
                        reason: format!("streak {} ratio {:.2}", state.streak, effective),
                    });
                } else {
                    debug!(
                        "promotion of {}:{} suppressed by cooldown",
                        key.0.as_str(),
                        key.1
                    );
                }
            }
        }

        // Quiet keys: idle accounting and decay.
        let keys: Vec<(AlertType, String)> = self.states.keys().cloned().collect();
        for key in keys {
            if triggered.contains_key(&key) {
                continue;
            }
            let decay_cfg = self.cfg.clone();
            let state = self.states.get_mut(&key).expect("state exists");
            state.streak = 0;
            state.idle_cycles += 1;
            state.last_ratio = 0.0;
            if decay_cfg.trend_smooth > 0.0 {
                state.smoothed_ratio *= 1.0 - decay_cfg.trend_smooth;
            } else {
                state.smoothed_ratio = 0.0;
            }

            if decay_cfg.decay_cycles == 0 || state.current == Severity::Info {
                continue;
            }
            if state.idle_cycles < decay_cfg.decay_cycles {
                continue;
            }
            if cycle.saturating_sub(state.last_change_cycle) < decay_cfg.demote_cooldown as u64 {
                continue;
            }

            let bypass = state.current == Severity::Critical
                && decay_cfg
                    .critical_demote_types
                    .iter()
                    .any(|t| t == key.0.as_str())
                && state.smoothed_ratio < decay_cfg.resolved_ratio;

            let steps = if bypass {
                state.current.level()
            } else {
                (state.idle_cycles / decay_cfg.decay_cycles).max(1) as u8
            };
            let target_level = state.current.level().saturating_sub(steps);
            let to = Severity::from_level(target_level.max(floor.level()));
            if to == state.current {
                continue;
            }

            let from = state.current;
            state.current = to;
            state.last_change_cycle = cycle;
            state.idle_cycles = 0;
            let resolved = to == Severity::Info && from > Severity::Info;
            info!(
                "⬇️  severity {}:{} {} -> {}{}",
                key.0.as_str(),
                key.1,
                from.as_str(),
                to.as_str(),
                if resolved { " (resolved)" } else { "" }
            );
            transitions.push(SeverityTransition {
                alert_type: key.0,
                scope: key.1.clone(),
                from,
                to,
                cycle,
                resolved,
                reason: if bypass {
                    "critical demote bypass".to_string()
                } else {
                    format!("idle decay x{steps}")
                },
            });
        }

        self.persist();
        transitions
    }

    pub fn state_of(&self, alert_type: AlertType, scope: &str) -> Severity {
        self.states
            .get(&(alert_type, scope.to_string()))
            .map(|s| s.current)
            .unwrap_or(Severity::Info)
    }

    /// Worst current severity per alert type, feeding the adaptive
    /// controller and the alerts panel.
    pub fn worst_by_type(&self) -> BTreeMap<AlertType, Severity> {
        let mut worst = BTreeMap::new();
        for ((ty, _), state) in &self.states {
            let entry = worst.entry(*ty).or_insert(Severity::Info);
            if state.current > *entry {
                *entry = state.current;
            }
        }
        worst
    }

    pub fn snapshot(&self) -> BTreeMap<String, SeverityState> {
        self.states
            .iter()
            .map(|((ty, scope), st)| (format!("{}|{}", ty.as_str(), scope), st.clone()))
            .collect()
    }

    fn persist(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let persisted = PersistedSeverity {
            states: self.snapshot(),
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(bytes) = serde_json::to_vec(&persisted) {
            if let Err(e) = std::fs::write(path, bytes) {
                warn!("failed to persist severity state: {}", e);
            }
        }
    }

    fn load_persisted(&mut self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<PersistedSeverity>(&raw) {
            Ok(persisted) => {
                for (key, state) in persisted.states {
                    let Some((ty_str, scope)) = key.split_once('|') else {
                        continue;
                    };
                    let Some(ty) = alert_type_from_str(ty_str) else {
                        continue;
                    };
                    self.states.insert((ty, scope.to_string()), state);
                }
                debug!("severity state restored: {} entries", self.states.len());
            }
            Err(e) => warn!("discarding unreadable severity state: {}", e),
        }
    }
}

fn alert_type_from_str(s: &str) -> Option<AlertType> {
    use AlertType::*;
    match s {
        "bucket_util_low" => Some(BucketUtilLow),
        "expiry_empty" => Some(ExpiryEmpty),
        "index_failure" => Some(IndexFailure),
        "internal_error" => Some(InternalError),
        "interpolation_high" => Some(InterpolationHigh),
        "liquidity_low" => Some(LiquidityLow),
        "low_both_coverage" => Some(LowBothCoverage),
        "low_field_coverage" => Some(LowFieldCoverage),
        "low_strike_coverage" => Some(LowStrikeCoverage),
        "risk_delta_drift" => Some(RiskDeltaDrift),
        "stale_quote" => Some(StaleQuote),
        "wide_spread" => Some(WideSpread),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(ratio: f64) -> AlertEvent {
        AlertEvent {
            alert_type: AlertType::InterpolationHigh,
            index: Some("NIFTY".to_string()),
            expiry: Some("this_week".to_string()),
            message: "test".to_string(),
            ratio,
        }
    }

    fn machine(cfg: SeverityConfig) -> SeverityStateMachine {
        SeverityStateMachine::new(cfg, None)
    }

    fn cfg() -> SeverityConfig {
        SeverityConfig {
            min_streak: 2,
            decay_cycles: 3,
            promote_cooldown: 1,
            demote_cooldown: 1,
            ..SeverityConfig::default()
        }
    }

    #[test]
    fn promotes_after_min_streak() {
        let mut m = machine(cfg());
        assert!(m.apply_cycle(1, &[event(1.2)]).is_empty());
        let t = m.apply_cycle(2, &[event(1.2)]);
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].to, Severity::Warn);
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Warn
        );
    }

    #[test]
    fn escalates_to_critical_on_high_ratio() {
        let mut m = machine(cfg());
        let mut transitions = Vec::new();
        for c in 1..=4 {
            transitions.extend(m.apply_cycle(c, &[event(2.0)]));
        }
        assert!(transitions.iter().any(|t| t.to == Severity::Warn));
        assert!(transitions.iter().any(|t| t.to == Severity::Critical));
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Critical
        );
    }

    #[test]
    fn decay_emits_resolved_once() {
        let mut m = machine(cfg());
        for c in 1..=5 {
            m.apply_cycle(c, &[event(1.2)]);
        }
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Warn
        );
        // Three quiet cycles trigger the decay back to info.
        let mut resolved_count = 0;
        for c in 6..=12 {
            for t in m.apply_cycle(c, &[]) {
                if t.resolved {
                    resolved_count += 1;
                }
            }
        }
        assert_eq!(resolved_count, 1);
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Info
        );
    }

    #[test]
    fn force_floor_blocks_decay() {
        let mut c = cfg();
        c.force_floor = Some("warn".to_string());
        let mut m = machine(c);
        for cyc in 1..=3 {
            m.apply_cycle(cyc, &[event(1.5)]);
        }
        for cyc in 4..=20 {
            m.apply_cycle(cyc, &[]);
        }
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Warn
        );
    }

    #[test]
    fn critical_demote_bypass_skips_warn() {
        let mut c = cfg();
        c.critical_demote_types = vec!["interpolation_high".to_string()];
        let mut m = machine(c);
        for cyc in 1..=6 {
            m.apply_cycle(cyc, &[event(2.5)]);
        }
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Critical
        );
        let mut saw_direct = false;
        for cyc in 7..=12 {
            for t in m.apply_cycle(cyc, &[]) {
                if t.from == Severity::Critical && t.to == Severity::Info {
                    saw_direct = true;
                    assert!(t.resolved);
                }
            }
        }
        assert!(saw_direct);
    }

    #[test]
    fn promote_cooldown_spaces_transitions() {
        let mut c = cfg();
        c.min_streak = 1;
        c.promote_cooldown = 3;
        let mut m = machine(c);
        let t1 = m.apply_cycle(1, &[event(5.0)]);
        assert_eq!(t1.len(), 1); // info -> warn
        let t2 = m.apply_cycle(2, &[event(5.0)]);
        assert!(t2.is_empty()); // warn -> critical held by cooldown
        m.apply_cycle(3, &[event(5.0)]);
        let t4 = m.apply_cycle(4, &[event(5.0)]);
        assert!(t4.iter().any(|t| t.to == Severity::Critical));
    }

    #[test]
    fn state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut m = SeverityStateMachine::new(cfg(), Some(dir.path()));
            m.apply_cycle(1, &[event(1.5)]);
            m.apply_cycle(2, &[event(1.5)]);
        }
        let m = SeverityStateMachine::new(cfg(), Some(dir.path()));
        assert_eq!(
            m.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
            Severity::Warn
        );
    }
}
