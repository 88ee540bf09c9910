use anyhow::Result;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::adaptive_controller::{ControllerInputs, DetailMode};
use crate::alerts::AlertAggregator;
use crate::canonical::float_value;
use crate::context::AppContext;
use crate::coverage::ExpiryStatus;
use crate::event_bus::EventKind;
use crate::pipeline::{self, IndexCycleOutcome};
use crate::severity::SeverityTransition;
use crate::sse_server::SnapshotGuard;

/// Fixed-interval scheduler plus the per-cycle executor: market gating,
/// parallel index dispatch under the cycle budget, soft timeouts with a
/// bounded serial retry, SLA/missing-cycle accounting, and the panel/event
/// emission tail. No failure in here is allowed to end the loop.
pub struct CycleExecutor {
    ctx: Arc<AppContext>,
    snapshot_guard: SnapshotGuard,
    sla_breach_streak: u32,
    diffs_since_full: u64,
    sent_initial_full: bool,
    last_cycle_start: Option<Instant>,
    last_rate_rejected: HashMap<String, u64>,
}

impl CycleExecutor {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        let guard = SnapshotGuard::new(
            ctx.cfg.events.snapshot_gap_max,
            ctx.cfg.events.force_full_retry_seconds,
        );
        Self {
            ctx,
            snapshot_guard: guard,
            sla_breach_streak: 0,
            diffs_since_full: 0,
            sent_initial_full: false,
            last_cycle_start: None,
            last_rate_rejected: HashMap::new(),
        }
    }

    /// Scheduler loop. Runs until shutdown flips, `max_cycles` is reached,
    /// or run-once completes.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let schedule = self.ctx.cfg.schedule.clone();
        let interval = schedule.interval();
        let mut cycle: u64 = 0;
        info!(
            "⏱️  scheduler starting: interval={}s, workers={}, budget={:.0}%",
            schedule.interval_secs,
            schedule.parallel_index_workers,
            schedule.cycle_budget_fraction * 100.0
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            cycle += 1;
            let start = Instant::now();

            if let Some(prev) = self.last_cycle_start {
                let since = start.duration_since(prev);
                if since.as_secs_f64()
                    >= schedule.missing_cycle_factor * interval.as_secs_f64()
                {
                    self.ctx.metrics.missing_cycles_total.inc();
                    warn!(
                        "⏰ missing cycle detected: {:.1}s since previous start",
                        since.as_secs_f64()
                    );
                }
            }
            self.last_cycle_start = Some(start);

            self.run_cycle(cycle, start).await;

            if schedule.run_once {
                info!("run-once complete after cycle {}", cycle);
                break;
            }
            if let Some(max) = schedule.max_cycles {
                if cycle >= max {
                    info!("max cycles ({}) reached", max);
                    break;
                }
            }

            let sleep_for = interval.saturating_sub(start.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.publish(EventKind::Bye, json!({"reason": "shutdown"}), None);
        info!("scheduler stopped after {} cycles", cycle);
        Ok(())
    }

    async fn run_cycle(&mut self, cycle: u64, start: Instant) {
        let ctx = self.ctx.clone();
        ctx.status.cycle.store(cycle, Ordering::Relaxed);

        let market_open = ctx.calendar.is_open_now();
        ctx.status.market_open.store(market_open, Ordering::Relaxed);
        ctx.metrics.market_open.set(market_open as i64);

        if !market_open {
            debug!("cycle {}: market closed, zero-work cycle", cycle);
            self.write_panels(cycle, &[], &[], &BTreeMap::new(), false);
            self.publish(
                EventKind::CycleEnd,
                json!({"cycle": cycle, "market_open": false, "elapsed_ms": 0}),
                None,
            );
            ctx.metrics.cycles_total.inc();
            self.finish_cycle_metrics(cycle, start, true, false);
            return;
        }

        let outcomes = self.dispatch_indices(start).await;

        // Strike-depth feedback: conservative, keyed off the worst expiry.
        for outcome in &outcomes {
            if let Some(min_cov) = outcome
                .snapshots
                .iter()
                .map(|s| s.strike_coverage)
                .min_by(|a, b| a.total_cmp(b))
            {
                ctx.adaptive.record_strike_coverage(
                    &outcome.index,
                    min_cov,
                    ctx.cfg.coverage.strike_coverage_ok,
                );
            }
        }

        // Alert aggregation and severity grading.
        let events = {
            let mut aggregator = ctx.alerts.lock();
            aggregator.evaluate(&outcomes)
        };
        let transitions = {
            let mut severity = ctx.severity.lock();
            severity.apply_cycle(cycle, &events)
        };

        // Adaptive control from the cross-cutting pressure signals.
        let inputs = ControllerInputs {
            sla_breach_streak: self.sla_breach_streak,
            memory_tier: ctx.memory.tier(),
            cardinality_guard_active: ctx.metrics.update_cardinality_guard(),
            severity_by_type: ctx.severity.lock().worst_by_type(),
        };
        ctx.metrics.memory_tier.set(inputs.memory_tier as i64);
        let actions = ctx.adaptive.plan_cycle(cycle, &inputs);

        self.emit_metrics(&outcomes, &events, &transitions, &actions, &inputs);
        self.persist_snapshots(&outcomes);

        let alert_totals = AlertAggregator::totals(&events);
        self.write_panels(cycle, &outcomes, &transitions, &alert_totals, true);

        let had_errors = outcomes.iter().any(|o| o.had_errors()) || outcomes.is_empty();
        let options_total: usize = outcomes.iter().map(|o| o.options_total).sum();
        self.publish(
            EventKind::CycleEnd,
            json!({
                "cycle": cycle,
                "market_open": true,
                "elapsed_ms": start.elapsed().as_millis() as u64,
                "options_total": options_total,
                "indices": outcomes.len(),
                "alerts": events.len(),
            }),
            None,
        );

        ctx.metrics.cycles_total.inc();
        ctx.quote_cache.sweep();
        self.finish_cycle_metrics(cycle, start, !had_errors, true);
    }

    /// Submit every configured index in parallel, bounded by the worker
    /// pool and the cycle budget; soft-timed-out indices get one bounded
    /// serial retry inside whatever budget remains.
    async fn dispatch_indices(&mut self, cycle_start: Instant) -> Vec<IndexCycleOutcome> {
        let ctx = &self.ctx;
        let schedule = &ctx.cfg.schedule;
        let budget = schedule.cycle_budget();
        let soft_timeout = schedule.index_soft_timeout();
        let semaphore = Arc::new(Semaphore::new(schedule.parallel_index_workers.max(1)));

        let mut handles = Vec::new();
        let mut outcomes = Vec::new();

        for index in ctx.cfg.indices.clone() {
            if cycle_start.elapsed() >= budget {
                ctx.metrics.cycle_budget_skips_total.inc();
                warn!("cycle budget exhausted before dispatching {}", index.symbol);
                outcomes.push(IndexCycleOutcome::failed(&index.symbol, "budget_skipped"));
                continue;
            }
            let shared = ctx.pipeline.clone();
            let depth_scale = ctx.adaptive.depth_scale(&index.symbol);
            let permits = semaphore.clone();
            let symbol = index.symbol.clone();
            handles.push((
                symbol,
                index.clone(),
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    let deadline = Instant::now() + soft_timeout;
                    tokio::time::timeout(
                        soft_timeout,
                        pipeline::run_index(shared, index, depth_scale, deadline),
                    )
                    .await
                }),
            ));
        }

        let mut retry_queue = Vec::new();
        for (symbol, index, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(_elapsed)) => {
                    ctx.metrics
                        .parallel_index_timeouts_total
                        .with_label_values(&[&symbol])
                        .inc();
                    warn!("index {} hit soft timeout", symbol);
                    retry_queue.push((symbol, index));
                }
                Err(join_err) => {
                    error!("index {} task failed: {}", symbol, join_err);
                    ctx.metrics.internal_errors_total.inc();
                    outcomes.push(IndexCycleOutcome::failed(&symbol, "internal_error"));
                }
            }
        }

        // Serial retry within the remaining budget.
        let mut retries_left = schedule.parallel_index_retry;
        for (symbol, index) in retry_queue {
            let remaining = budget.saturating_sub(cycle_start.elapsed());
            if retries_left == 0 || remaining.is_zero() {
                outcomes.push(IndexCycleOutcome::failed(&symbol, "timeout"));
                continue;
            }
            retries_left -= 1;
            let window = soft_timeout.min(remaining);
            let deadline = Instant::now() + window;
            let depth_scale = ctx.adaptive.depth_scale(&symbol);
            match tokio::time::timeout(
                window,
                pipeline::run_index(ctx.pipeline.clone(), index, depth_scale, deadline),
            )
            .await
            {
                Ok(outcome) => {
                    info!("serial retry recovered index {}", symbol);
                    outcomes.push(outcome);
                }
                Err(_) => outcomes.push(IndexCycleOutcome::failed(&symbol, "timeout")),
            }
        }
        outcomes
    }

    fn emit_metrics(
        &mut self,
        outcomes: &[IndexCycleOutcome],
        events: &[crate::alerts::AlertEvent],
        transitions: &[SeverityTransition],
        actions: &[crate::adaptive_controller::AdaptiveAction],
        inputs: &ControllerInputs,
    ) {
        let ctx = self.ctx.clone();
        let m = &ctx.metrics;
        let _ = inputs;

        for outcome in outcomes {
            m.index_options_collected
                .with_label_values(&[&outcome.index])
                .set(outcome.options_total as i64);
            for (reason, count) in &outcome.partial_reason_totals {
                m.partial_reason_total
                    .with_label_values(&[reason])
                    .inc_by(*count);
            }
            let mode = ctx.adaptive.detail_mode(&outcome.index);
            m.detail_mode
                .with_label_values(&[&outcome.index])
                .set(mode.level() as i64);
            m.strike_depth_scale
                .with_label_values(&[&outcome.index])
                .set(ctx.adaptive.depth_scale(&outcome.index));

            for snap in &outcome.snapshots {
                let tag = snap.tag.as_str();
                m.index_strike_coverage
                    .with_label_values(&[&outcome.index, tag])
                    .set(snap.strike_coverage);
                m.index_field_coverage
                    .with_label_values(&[&outcome.index, tag])
                    .set(snap.field_coverage);
                m.vol_surface_quality_score
                    .with_label_values(&[&outcome.index, tag])
                    .set(snap.quality_score);

                self.emit_option_metrics(outcome, snap, mode);
            }
        }

        for hop in ctx.provider.take_failover_events() {
            m.provider_failover_total
                .with_label_values(&[&hop.from, &hop.to])
                .inc();
        }
        for (provider, stats) in ctx.provider.rate_limiter_stats() {
            let prev = self
                .last_rate_rejected
                .insert(provider.clone(), stats.rejected_total)
                .unwrap_or(0);
            let delta = stats.rejected_total.saturating_sub(prev);
            if delta > 0 {
                m.rate_limited_total
                    .with_label_values(&[&provider])
                    .inc_by(delta);
            }
        }
        for (provider, state) in ctx.provider.circuit_states() {
            let level = match state {
                crate::circuit_breaker::CircuitState::Closed => 0,
                crate::circuit_breaker::CircuitState::HalfOpen => 1,
                crate::circuit_breaker::CircuitState::Open => 2,
            };
            m.circuit_state.with_label_values(&[&provider]).set(level);
        }

        m.quote_cache_hit_ratio.set(ctx.quote_cache.hit_ratio());
        let strike_stats = ctx.pipeline.strikes.stats();
        let lookups = strike_stats.hits + strike_stats.misses;
        if lookups > 0 {
            m.strike_cache_hit_ratio
                .set(strike_stats.hits as f64 / lookups as f64);
        }

        for event in events {
            m.alerts_total
                .with_label_values(&[event.alert_type.as_str()])
                .inc();
        }
        for t in transitions {
            m.severity_transitions_total
                .with_label_values(&[t.alert_type.as_str(), t.to.as_str()])
                .inc();
        }
        for action in actions {
            let direction = if action.to.level() > action.from.level() {
                "demote"
            } else {
                "promote"
            };
            // Reason class only; the free-form tail would explode labels.
            let reason = action.reason.split('=').next().unwrap_or("unknown");
            m.adaptive_actions_total
                .with_label_values(&[&action.index, direction, reason])
                .inc();
        }

        for (reason, count) in ctx.bus.dropped_totals() {
            // Gauge-like reconciliation through a counter: only increment
            // the delta since the last emission.
            let key = format!("bus:{reason}");
            let prev = self.last_rate_rejected.insert(key, count).unwrap_or(0);
            let delta = count.saturating_sub(prev);
            if delta > 0 {
                m.events_dropped_total
                    .with_label_values(&[&reason])
                    .inc_by(delta);
            }
        }
    }

    /// Per-option gauges honor the detail mode: full emits everything,
    /// band restricts to strikes near ATM, agg suppresses. The cardinality
    /// guard forces agg regardless of mode.
    fn emit_option_metrics(
        &self,
        outcome: &IndexCycleOutcome,
        snap: &crate::pipeline::ExpirySnapshot,
        mode: DetailMode,
    ) {
        let ctx = &self.ctx;
        if !ctx.metrics.group_enabled(crate::metrics::groups::OPTION_DETAIL) {
            return;
        }
        let effective = if ctx.metrics.cardinality_guard_is_active() {
            DetailMode::Agg
        } else {
            mode
        };
        if effective == DetailMode::Agg {
            return;
        }
        let (atm, step) = match (
            outcome.spot,
            ctx.cfg.index(&outcome.index).map(|i| i.strike_step),
        ) {
            (Some(spot), Some(step)) => ((spot / step).round() * step, step),
            _ => return,
        };
        let band = ctx.cfg.adaptive.band_atm_window as f64 * step;

        for row in &snap.options {
            if effective == DetailMode::Band && (row.strike - atm).abs() > band {
                continue;
            }
            let strike = format!("{}", row.strike as i64);
            let labels = [
                outcome.index.as_str(),
                snap.tag.as_str(),
                strike.as_str(),
                row.option_type.as_str(),
            ];
            ctx.metrics
                .option_last_price
                .with_label_values(&labels)
                .set(row.last_price);
            ctx.metrics
                .option_oi
                .with_label_values(&labels)
                .set(row.oi as f64);
        }
    }

    fn persist_snapshots(&self, outcomes: &[IndexCycleOutcome]) {
        for outcome in outcomes {
            for snap in &outcome.snapshots {
                if snap.status == ExpiryStatus::Empty {
                    continue;
                }
                for sink in &self.ctx.sinks {
                    if let Err(e) = sink.append(snap) {
                        warn!(
                            "sink {} failed for {} {}: {}",
                            sink.name(),
                            snap.index,
                            snap.tag.as_str(),
                            e
                        );
                        self.ctx.metrics.internal_errors_total.inc();
                    }
                }
            }
        }
    }

    /// Build every registered panel, hash, persist changed ones, and emit
    /// diff/full events per the cadence and the snapshot guard.
    fn write_panels(
        &mut self,
        cycle: u64,
        outcomes: &[IndexCycleOutcome],
        transitions: &[SeverityTransition],
        alert_totals: &BTreeMap<String, u64>,
        market_open: bool,
    ) {
        let ctx = self.ctx.clone();
        let panels: Vec<(&str, Value)> = vec![
            ("indices", self.indices_panel(outcomes, market_open)),
            ("adaptive_alerts", self.alerts_panel(transitions, alert_totals)),
            ("adaptive", self.adaptive_panel()),
            ("provider", self.provider_panel()),
            ("system", self.system_panel(market_open)),
        ];

        let mut changed: BTreeMap<String, Value> = BTreeMap::new();
        for (name, data) in panels {
            ctx.status.diff_considered.fetch_add(1, Ordering::Relaxed);
            match ctx.panels.write_panel(name, data.clone()) {
                Ok(outcome) if outcome.changed => {
                    ctx.metrics
                        .panel_writes_total
                        .with_label_values(&[name])
                        .inc();
                    changed.insert(
                        name.to_string(),
                        json!({"hash": outcome.hash, "data": data}),
                    );
                }
                Ok(_) => {
                    ctx.status.diff_unchanged.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!("panel write {} failed: {}", name, e);
                    ctx.metrics.internal_errors_total.inc();
                }
            }
        }
        ctx.status
            .panel_updates_last
            .store(changed.len() as u64, Ordering::Relaxed);

        if !changed.is_empty() {
            self.publish(
                EventKind::PanelDiff,
                json!({"cycle": cycle, "panels": changed}),
                None,
            );
            ctx.metrics.panel_diff_emitted_total.inc();
            self.diffs_since_full += 1;
        }

        let forced_reason = self
            .snapshot_guard
            .should_force_full(ctx.bus.snapshot_gap());
        let cadence_due = self.diffs_since_full >= ctx.cfg.panels.diff_full_interval.max(1);
        if !self.sent_initial_full || cadence_due || forced_reason.is_some() {
            if let Some(reason) = forced_reason {
                ctx.metrics
                    .events_forced_full_total
                    .with_label_values(&[reason])
                    .inc();
                info!("snapshot guard forcing panel_full ({})", reason);
            }
            self.publish(
                EventKind::PanelFull,
                json!({"cycle": cycle, "panels": ctx.panels.envelopes()}),
                Some("panels".to_string()),
            );
            ctx.metrics.panel_full_emitted_total.inc();
            self.sent_initial_full = true;
            self.diffs_since_full = 0;
        }
    }

    fn indices_panel(&self, outcomes: &[IndexCycleOutcome], market_open: bool) -> Value {
        let indices: Vec<Value> = outcomes
            .iter()
            .map(|o| {
                let expiries: Vec<Value> = o
                    .snapshots
                    .iter()
                    .map(|s| {
                        json!({
                            "tag": s.tag.as_str(),
                            "date": s.expiry_date.to_string(),
                            "status": s.status.as_str(),
                            "strike_coverage": float_value(s.strike_coverage),
                            "field_coverage": float_value(s.field_coverage),
                            "quality_score": float_value(s.quality_score),
                            "options": s.options.len(),
                            "partial_reasons": s.partial_reasons,
                            "clamped": s.clamped,
                        })
                    })
                    .collect();
                json!({
                    "symbol": o.index,
                    "spot": o.spot.map(float_value),
                    "failure": o.failure,
                    "unresolved_tags": o.unresolved_tags.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
                    "expiries": expiries,
                })
            })
            .collect();
        json!({"market_open": market_open, "indices": indices})
    }

    fn alerts_panel(
        &self,
        transitions: &[SeverityTransition],
        totals: &BTreeMap<String, u64>,
    ) -> Value {
        let severity_states: BTreeMap<String, Value> = self
            .ctx
            .severity
            .lock()
            .snapshot()
            .into_iter()
            .map(|(key, st)| {
                (
                    key,
                    json!({
                        "severity": st.current.as_str(),
                        "streak": st.streak,
                        "active_since_cycle": st.active_since_cycle,
                    }),
                )
            })
            .collect();
        let transitions: Vec<Value> = transitions
            .iter()
            .map(|t| {
                json!({
                    "type": t.alert_type.as_str(),
                    "scope": t.scope,
                    "from": t.from.as_str(),
                    "to": t.to.as_str(),
                    "resolved": t.resolved,
                })
            })
            .collect();
        json!({
            "totals": totals,
            "states": severity_states,
            "transitions": transitions,
        })
    }

    fn adaptive_panel(&self) -> Value {
        let modes: BTreeMap<String, &'static str> = self
            .ctx
            .adaptive
            .modes()
            .into_iter()
            .map(|(k, v)| (k, v.as_str()))
            .collect();
        let scales: BTreeMap<String, Value> = self
            .ctx
            .adaptive
            .depth_scales()
            .into_iter()
            .map(|(k, v)| (k, float_value(v)))
            .collect();
        json!({"detail_modes": modes, "strike_depth_scale_factor": scales})
    }

    fn provider_panel(&self) -> Value {
        let circuits: BTreeMap<String, &'static str> = self
            .ctx
            .provider
            .circuit_states()
            .into_iter()
            .map(|(k, v)| (k, v.as_str()))
            .collect();
        let limiters: BTreeMap<String, Value> = self
            .ctx
            .provider
            .rate_limiter_stats()
            .into_iter()
            .map(|(k, v)| {
                (
                    k,
                    json!({
                        "consecutive_429": v.consecutive_429,
                        "in_cooldown": v.cooldown_remaining.is_some(),
                    }),
                )
            })
            .collect();
        json!({"circuits": circuits, "rate_limiters": limiters})
    }

    fn system_panel(&self, market_open: bool) -> Value {
        json!({
            "market_closed": !market_open,
            "indices": self
                .ctx
                .cfg
                .indices
                .iter()
                .map(|i| i.symbol.clone())
                .collect::<Vec<_>>(),
            "providers": self.ctx.provider.provider_names(),
            "interval_seconds": self.ctx.cfg.schedule.interval_secs,
            "schema": crate::panels::PANEL_SCHEMA_VERSION,
        })
    }

    fn publish(&self, kind: EventKind, payload: Value, coalesce_key: Option<String>) {
        self.ctx.bus.publish(kind, payload, coalesce_key);
        self.ctx
            .metrics
            .events_published_total
            .with_label_values(&[kind.as_str()])
            .inc();
    }

    fn finish_cycle_metrics(
        &mut self,
        cycle: u64,
        start: Instant,
        success: bool,
        collected: bool,
    ) {
        let ctx = self.ctx.clone();
        let elapsed = start.elapsed();
        ctx.metrics.cycle_duration_seconds.observe(elapsed.as_secs_f64());
        ctx.status
            .last_cycle_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);

        // Zero-work (market closed) cycles never count against the SLA.
        if collected {
            let sla = Duration::from_secs_f64(
                ctx.cfg.schedule.interval_secs as f64 * ctx.cfg.schedule.cycle_sla_fraction,
            );
            if elapsed > sla {
                ctx.metrics.cycle_sla_breach_total.inc();
                self.sla_breach_streak += 1;
                warn!(
                    "🐢 cycle {} breached SLA: {:.2}s > {:.2}s (streak {})",
                    cycle,
                    elapsed.as_secs_f64(),
                    sla.as_secs_f64(),
                    self.sla_breach_streak
                );
            } else {
                self.sla_breach_streak = 0;
            }
        }

        let now_unix = Utc::now().timestamp() as u64;
        if collected && success {
            ctx.status.last_success_unix.store(now_unix, Ordering::Relaxed);
            ctx.metrics.last_success_cycle_unixtime.set(now_unix as f64);
        }
        let last_success = ctx.status.last_success_unix.load(Ordering::Relaxed);
        let gap = if last_success == 0 {
            0
        } else {
            now_unix.saturating_sub(last_success)
        };
        ctx.metrics.data_gap_seconds.set(gap as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::provider::{MarketProvider, MockProvider};
    use chrono::{Datelike, NaiveDate};
    use std::sync::Arc;

    fn upcoming_thursday() -> NaiveDate {
        let mut d = crate::market_calendar::ist_now().date_naive();
        while d.weekday() != chrono::Weekday::Thu {
            d = d.succ_opt().unwrap();
        }
        d
    }

    fn test_ctx(force_open: bool) -> Arc<AppContext> {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.indices.truncate(1);
        cfg.schedule.interval_secs = 60;
        cfg.schedule.run_once = true;
        cfg.market.force_open = force_open;
        if !force_open {
            // Make the closed-market path deterministic regardless of when
            // the test runs.
            cfg.market.holidays = vec![crate::market_calendar::ist_now().date_naive()];
        }
        cfg.paths.state_dir = dir.path().join("state");
        cfg.paths.csv_dir = dir.path().join("csv");
        cfg.panels.panels_dir = dir.path().join("panels");
        cfg.validate().unwrap();
        // Leak the tempdir so files survive the test body.
        std::mem::forget(dir);

        let mock = Arc::new(MockProvider::new("primary", vec![upcoming_thursday()]));
        AppContext::bootstrap(
            cfg,
            vec![("primary".to_string(), mock as Arc<dyn MarketProvider>)],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn run_once_healthy_cycle_emits_full_then_stable() {
        let ctx = test_ctx(true);
        let mut executor = CycleExecutor::new(ctx.clone());
        let (_tx, rx) = watch::channel(false);
        executor.run(rx).await.unwrap();

        assert_eq!(ctx.metrics.cycle_sla_breach_total.get(), 0);
        assert_eq!(ctx.metrics.cycles_total.get(), 1);
        assert!(ctx.bus.last_panel_full_id().is_some());
        let hashes = ctx.panels.hashes();
        assert!(hashes.contains_key("indices"));
        assert!(hashes.contains_key("system"));

        // A second executor pass with identical data keeps hashes stable.
        let before = hashes.clone();
        let mut executor2 = CycleExecutor::new(ctx.clone());
        let (_tx2, rx2) = watch::channel(false);
        executor2.run(rx2).await.unwrap();
        let after = ctx.panels.hashes();
        assert_eq!(before.get("indices"), after.get("indices"));
    }

    #[tokio::test]
    async fn market_closed_cycle_does_no_collection_work() {
        let ctx = test_ctx(false); // today is configured as a holiday
        assert!(!ctx.calendar.is_open_now());
        let mut executor = CycleExecutor::new(ctx.clone());
        let (_tx, rx) = watch::channel(false);
        executor.run(rx).await.unwrap();

        assert_eq!(ctx.metrics.cycle_sla_breach_total.get(), 0);
        let envelopes = ctx.panels.envelopes();
        assert_eq!(
            envelopes["system"].data["market_closed"],
            serde_json::json!(true)
        );
        // last_success stays untouched on zero-work cycles.
        assert_eq!(ctx.status.last_success_unix.load(Ordering::Relaxed), 0);
    }
}
