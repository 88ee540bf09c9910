use anyhow::Result;
use parking_lot::Mutex;
use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::MetricsConfig;

/// Metric group names used for gated registration.
pub mod groups {
    pub const CORE: &str = "core";
    pub const COLLECTION: &str = "collection";
    pub const ANALYTICS_VOL_SURFACE: &str = "analytics_vol_surface";
    pub const OPTION_DETAIL: &str = "option_detail";
    pub const PROVIDER: &str = "provider";
    pub const CACHE: &str = "cache";
    pub const ALERTS: &str = "alerts";
    pub const ADAPTIVE_CONTROLLER: &str = "adaptive_controller";
    pub const PANELS_INTEGRITY: &str = "panels_integrity";
    pub const SSE_INGEST: &str = "sse_ingest";
    pub const CARDINALITY: &str = "cardinality";
}

#[derive(Debug, Clone, Default)]
struct CardinalityGuard {
    active: bool,
    activated_at: Option<Instant>,
    activations: u64,
}

/// Process-wide Prometheus registry wrapper: `g6_`-prefixed families,
/// group-gated registration (disable wins on overlap within the enable
/// allow-list), and the cardinality guard that floors per-option emission
/// when the series count runs away.
pub struct MetricsRegistry {
    registry: Registry,
    cfg: MetricsConfig,
    guard: Mutex<CardinalityGuard>,

    // core scheduler/executor
    pub cycles_total: IntCounter,
    pub missing_cycles_total: IntCounter,
    pub cycle_sla_breach_total: IntCounter,
    pub cycle_budget_skips_total: IntCounter,
    pub parallel_index_timeouts_total: IntCounterVec,
    pub cycle_duration_seconds: Histogram,
    pub last_success_cycle_unixtime: Gauge,
    pub data_gap_seconds: Gauge,
    pub market_open: IntGauge,
    pub internal_errors_total: IntCounter,

    // collection
    pub index_options_collected: IntGaugeVec,
    pub index_strike_coverage: GaugeVec,
    pub index_field_coverage: GaugeVec,
    pub partial_reason_total: IntCounterVec,
    pub vol_surface_quality_score: GaugeVec,

    // per-option detail (guarded)
    pub option_last_price: GaugeVec,
    pub option_oi: GaugeVec,

    // provider resilience
    pub provider_failover_total: IntCounterVec,
    pub rate_limited_total: IntCounterVec,
    pub circuit_state: IntGaugeVec,

    // cache
    pub quote_cache_hit_ratio: Gauge,
    pub strike_cache_hit_ratio: Gauge,

    // alerts / severity
    pub alerts_total: IntCounterVec,
    pub severity_transitions_total: IntCounterVec,

    // adaptive controller
    pub adaptive_actions_total: IntCounterVec,
    pub detail_mode: IntGaugeVec,
    pub strike_depth_scale: GaugeVec,
    pub memory_tier: IntGauge,

    // panels
    pub panel_writes_total: IntCounterVec,
    pub panel_diff_emitted_total: IntCounter,
    pub panel_full_emitted_total: IntCounter,

    // events / SSE
    pub events_published_total: IntCounterVec,
    pub events_dropped_total: IntCounterVec,
    pub events_forced_full_total: IntCounterVec,
    pub sse_events_sent_total: IntCounter,
    pub sse_clients: IntGauge,

    // cardinality guard
    pub metric_series_active: IntGauge,
    pub cardinality_guard_active: IntGauge,
    pub cardinality_guard_trips_total: IntCounter,
}

impl MetricsRegistry {
    pub fn new(cfg: MetricsConfig) -> Result<Self> {
        let registry = Registry::new();

        let cycles_total = IntCounter::new("g6_cycles_total", "Completed collection cycles")?;
        let missing_cycles_total =
            IntCounter::new("g6_missing_cycles_total", "Cycles started late beyond the missing-cycle factor")?;
        let cycle_sla_breach_total =
            IntCounter::new("g6_cycle_sla_breach_total", "Cycles exceeding the SLA fraction of the interval")?;
        let cycle_budget_skips_total = IntCounter::new(
            "g6_cycle_budget_skips_total",
            "Index dispatches skipped because the cycle budget was exhausted",
        )?;
        let parallel_index_timeouts_total = IntCounterVec::new(
            Opts::new(
                "g6_parallel_index_timeouts_total",
                "Per-index soft timeout hits",
            ),
            &["index"],
        )?;
        let cycle_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("g6_cycle_duration_seconds", "Wall time per cycle")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 45.0, 60.0]),
        )?;
        let last_success_cycle_unixtime = Gauge::new(
            "g6_last_success_cycle_unixtime",
            "Unix time of the last error-free cycle",
        )?;
        let data_gap_seconds =
            Gauge::new("g6_data_gap_seconds", "Seconds since the last error-free cycle")?;
        let market_open = IntGauge::new("g6_market_open", "1 while the market gate is open")?;
        let internal_errors_total =
            IntCounter::new("g6_internal_errors_total", "Caught internal errors")?;

        let index_options_collected = IntGaugeVec::new(
            Opts::new("g6_index_options_collected", "Option rows collected this cycle"),
            &["index"],
        )?;
        let index_strike_coverage = GaugeVec::new(
            Opts::new("g6_index_strike_coverage", "Realized strike coverage fraction"),
            &["index", "expiry"],
        )?;
        let index_field_coverage = GaugeVec::new(
            Opts::new("g6_index_field_coverage", "Realized field coverage fraction"),
            &["index", "expiry"],
        )?;
        let partial_reason_total = IntCounterVec::new(
            Opts::new("g6_partial_reason_total", "Partial reason occurrences"),
            &["reason"],
        )?;
        let vol_surface_quality_score = GaugeVec::new(
            Opts::new(
                "g6_vol_surface_quality_score",
                "strike_coverage * (1 - interpolated_fraction)",
            ),
            &["index", "expiry"],
        )?;

        let option_last_price = GaugeVec::new(
            Opts::new("g6_option_last_price", "Per-option last traded price"),
            &["index", "expiry", "strike", "type"],
        )?;
        let option_oi = GaugeVec::new(
            Opts::new("g6_option_oi", "Per-option open interest"),
            &["index", "expiry", "strike", "type"],
        )?;

        let provider_failover_total = IntCounterVec::new(
            Opts::new("g6_provider_failover_total", "Provider failover hops"),
            &["from", "to"],
        )?;
        let rate_limited_total = IntCounterVec::new(
            Opts::new("g6_rate_limited_total", "Rate-limited call outcomes"),
            &["provider"],
        )?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "g6_circuit_state",
                "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            ),
            &["provider"],
        )?;

        let quote_cache_hit_ratio =
            Gauge::new("g6_quote_cache_hit_ratio", "Quote cache lifetime hit ratio")?;
        let strike_cache_hit_ratio =
            Gauge::new("g6_strike_cache_hit_ratio", "Strike universe cache hit ratio")?;

        let alerts_total = IntCounterVec::new(
            Opts::new("g6_alerts_total", "Alert events raised"),
            &["type"],
        )?;
        let severity_transitions_total = IntCounterVec::new(
            Opts::new("g6_severity_transitions_total", "Severity level transitions"),
            &["type", "to"],
        )?;

        let adaptive_actions_total = IntCounterVec::new(
            Opts::new("g6_adaptive_actions_total", "Detail-mode transitions"),
            &["index", "direction", "reason"],
        )?;
        let detail_mode = IntGaugeVec::new(
            Opts::new("g6_detail_mode", "Detail mode (0 full, 1 band, 2 agg)"),
            &["index"],
        )?;
        let strike_depth_scale = GaugeVec::new(
            Opts::new("g6_strike_depth_scale", "Adaptive strike depth scale factor"),
            &["index"],
        )?;
        let memory_tier = IntGauge::new("g6_memory_tier", "Process memory pressure tier 0-3")?;

        let panel_writes_total = IntCounterVec::new(
            Opts::new("g6_panel_writes_total", "Panel file writes"),
            &["panel"],
        )?;
        let panel_diff_emitted_total =
            IntCounter::new("g6_panel_diff_emitted_total", "panel_diff events emitted")?;
        let panel_full_emitted_total =
            IntCounter::new("g6_panel_full_emitted_total", "panel_full events emitted")?;

        let events_published_total = IntCounterVec::new(
            Opts::new("g6_events_published_total", "Events published to the bus"),
            &["type"],
        )?;
        let events_dropped_total = IntCounterVec::new(
            Opts::new("g6_events_dropped_total", "Events dropped from the backlog"),
            &["reason"],
        )?;
        let events_forced_full_total = IntCounterVec::new(
            Opts::new("g6_events_forced_full_total", "Forced full snapshots"),
            &["reason"],
        )?;
        let sse_events_sent_total =
            IntCounter::new("g6_sse_events_sent_total", "Events written to SSE connections")?;
        let sse_clients = IntGauge::new("g6_sse_clients", "Connected SSE clients")?;

        let metric_series_active =
            IntGauge::new("g6_metric_series_active", "Sampled active series count")?;
        let cardinality_guard_active = IntGauge::new(
            "g6_cardinality_guard_active",
            "1 while the cardinality guard suppresses per-option metrics",
        )?;
        let cardinality_guard_trips_total = IntCounter::new(
            "g6_cardinality_guard_trips_total",
            "Cardinality guard activations",
        )?;

        let m = Self {
            registry,
            cfg,
            guard: Mutex::new(CardinalityGuard::default()),
            cycles_total,
            missing_cycles_total,
            cycle_sla_breach_total,
            cycle_budget_skips_total,
            parallel_index_timeouts_total,
            cycle_duration_seconds,
            last_success_cycle_unixtime,
            data_gap_seconds,
            market_open,
            internal_errors_total,
            index_options_collected,
            index_strike_coverage,
            index_field_coverage,
            partial_reason_total,
            vol_surface_quality_score,
            option_last_price,
            option_oi,
            provider_failover_total,
            rate_limited_total,
            circuit_state,
            quote_cache_hit_ratio,
            strike_cache_hit_ratio,
            alerts_total,
            severity_transitions_total,
            adaptive_actions_total,
            detail_mode,
            strike_depth_scale,
            memory_tier,
            panel_writes_total,
            panel_diff_emitted_total,
            panel_full_emitted_total,
            events_published_total,
            events_dropped_total,
            events_forced_full_total,
            sse_events_sent_total,
            sse_clients,
            metric_series_active,
            cardinality_guard_active,
            cardinality_guard_trips_total,
        };
        m.register_groups()?;
        Ok(m)
    }

    /// Enable allow-list first, then the disable list; a group named in
    /// both stays disabled.
    pub fn group_enabled(&self, group: &str) -> bool {
        if !self.cfg.enable_groups.is_empty()
            && !self.cfg.enable_groups.iter().any(|g| g == group)
        {
            return false;
        }
        !self.cfg.disable_groups.iter().any(|g| g == group)
    }

    fn register_groups(&self) -> Result<()> {
        use groups::*;
        let reg = |group: &str, collectors: Vec<Box<dyn prometheus::core::Collector>>| -> Result<()> {
            if !self.group_enabled(group) {
                info!("metric group '{}' disabled", group);
                return Ok(());
            }
            for c in collectors {
                self.registry.register(c)?;
            }
            Ok(())
        };

        reg(
            CORE,
            vec![
                Box::new(self.cycles_total.clone()),
                Box::new(self.missing_cycles_total.clone()),
                Box::new(self.cycle_sla_breach_total.clone()),
                Box::new(self.cycle_budget_skips_total.clone()),
                Box::new(self.parallel_index_timeouts_total.clone()),
                Box::new(self.cycle_duration_seconds.clone()),
                Box::new(self.last_success_cycle_unixtime.clone()),
                Box::new(self.data_gap_seconds.clone()),
                Box::new(self.market_open.clone()),
                Box::new(self.internal_errors_total.clone()),
            ],
        )?;
        reg(
            COLLECTION,
            vec![
                Box::new(self.index_options_collected.clone()),
                Box::new(self.index_strike_coverage.clone()),
                Box::new(self.index_field_coverage.clone()),
                Box::new(self.partial_reason_total.clone()),
            ],
        )?;
        reg(
            ANALYTICS_VOL_SURFACE,
            vec![Box::new(self.vol_surface_quality_score.clone())],
        )?;
        reg(
            OPTION_DETAIL,
            vec![
                Box::new(self.option_last_price.clone()),
                Box::new(self.option_oi.clone()),
            ],
        )?;
        reg(
            PROVIDER,
            vec![
                Box::new(self.provider_failover_total.clone()),
                Box::new(self.rate_limited_total.clone()),
                Box::new(self.circuit_state.clone()),
            ],
        )?;
        reg(
            CACHE,
            vec![
                Box::new(self.quote_cache_hit_ratio.clone()),
                Box::new(self.strike_cache_hit_ratio.clone()),
            ],
        )?;
        reg(
            ALERTS,
            vec![
                Box::new(self.alerts_total.clone()),
                Box::new(self.severity_transitions_total.clone()),
            ],
        )?;
        reg(
            ADAPTIVE_CONTROLLER,
            vec![
                Box::new(self.adaptive_actions_total.clone()),
                Box::new(self.detail_mode.clone()),
                Box::new(self.strike_depth_scale.clone()),
                Box::new(self.memory_tier.clone()),
            ],
        )?;
        reg(
            PANELS_INTEGRITY,
            vec![
                Box::new(self.panel_writes_total.clone()),
                Box::new(self.panel_diff_emitted_total.clone()),
                Box::new(self.panel_full_emitted_total.clone()),
            ],
        )?;
        reg(
            SSE_INGEST,
            vec![
                Box::new(self.events_published_total.clone()),
                Box::new(self.events_dropped_total.clone()),
                Box::new(self.events_forced_full_total.clone()),
                Box::new(self.sse_events_sent_total.clone()),
                Box::new(self.sse_clients.clone()),
            ],
        )?;
        reg(
            CARDINALITY,
            vec![
                Box::new(self.metric_series_active.clone()),
                Box::new(self.cardinality_guard_active.clone()),
                Box::new(self.cardinality_guard_trips_total.clone()),
            ],
        )?;
        Ok(())
    }

    /// Count active series across the registry. Called once per cycle.
    pub fn sample_series_count(&self) -> usize {
        self.registry
            .gather()
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }

    /// Run the guard over the sampled series count. Returns whether the
    /// guard is active after the update.
    pub fn update_cardinality_guard(&self) -> bool {
        let series = self.sample_series_count();
        self.metric_series_active.set(series as i64);

        let mut guard = self.guard.lock();
        if guard.active {
            let held_long_enough = guard
                .activated_at
                .map(|t| t.elapsed() >= Duration::from_secs(self.cfg.cardinality_min_disable_seconds))
                .unwrap_or(true);
            let below_reenable = (series as f64)
                < self.cfg.cardinality_reenable_fraction * self.cfg.cardinality_max_series as f64;
            if held_long_enough && below_reenable {
                guard.active = false;
                guard.activated_at = None;
                self.cardinality_guard_active.set(0);
                info!("cardinality guard released at {} series", series);
            }
        } else if series > self.cfg.cardinality_max_series {
            guard.active = true;
            guard.activated_at = Some(Instant::now());
            guard.activations += 1;
            self.cardinality_guard_active.set(1);
            self.cardinality_guard_trips_total.inc();
            warn!(
                "🛑 cardinality guard tripped: {} series > {}",
                series, self.cfg.cardinality_max_series
            );
        }
        guard.active
    }

    pub fn cardinality_guard_is_active(&self) -> bool {
        self.guard.lock().active
    }

    /// Prometheus text exposition of every registered family.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_groups_all_enabled() {
        let m = MetricsRegistry::new(MetricsConfig::default()).unwrap();
        assert!(m.group_enabled(groups::CORE));
        assert!(m.group_enabled(groups::OPTION_DETAIL));
        m.cycles_total.inc();
        let text = m.encode().unwrap();
        assert!(text.contains("g6_cycles_total"));
    }

    #[test]
    fn disable_wins_on_overlap() {
        let cfg = MetricsConfig {
            enable_groups: vec!["core".to_string(), "cache".to_string()],
            disable_groups: vec!["cache".to_string()],
            ..MetricsConfig::default()
        };
        let m = MetricsRegistry::new(cfg).unwrap();
        assert!(m.group_enabled(groups::CORE));
        assert!(!m.group_enabled(groups::CACHE));
        assert!(!m.group_enabled(groups::SSE_INGEST)); // not in allow-list
        let text = m.encode().unwrap();
        assert!(!text.contains("g6_quote_cache_hit_ratio"));
    }

    #[test]
    fn disabled_group_metrics_still_usable() {
        let cfg = MetricsConfig {
            disable_groups: vec!["option_detail".to_string()],
            ..MetricsConfig::default()
        };
        let m = MetricsRegistry::new(cfg).unwrap();
        // Incrementing an unregistered family must not panic.
        m.option_last_price
            .with_label_values(&["NIFTY", "this_week", "24000", "CE"])
            .set(120.5);
        assert!(!m.encode().unwrap().contains("g6_option_last_price"));
    }

    #[test]
    fn cardinality_guard_trips_and_releases() {
        // Only the collection group is registered, so the labeled
        // partial_reason expansion is the whole series population.
        let cfg = MetricsConfig {
            enable_groups: vec!["collection".to_string()],
            cardinality_max_series: 5,
            cardinality_min_disable_seconds: 0,
            cardinality_reenable_fraction: 0.8,
            ..MetricsConfig::default()
        };
        let m = MetricsRegistry::new(cfg).unwrap();
        for i in 0..10 {
            m.partial_reason_total
                .with_label_values(&[&format!("reason_{i}")])
                .inc();
        }
        assert!(m.update_cardinality_guard());
        assert!(m.cardinality_guard_is_active());

        // Drop the series count below the re-enable fraction.
        m.registry
            .unregister(Box::new(m.partial_reason_total.clone()))
            .unwrap();
        assert!(!m.update_cardinality_guard());
    }
}
