//! Integration tests for the G6 collection platform.
//!
//! These exercise the cross-component paths: scheduler + pipeline +
//! providers, alert/severity grading, adaptive depth scaling, and the
//! panel/event push fabric. Run with `cargo test --test integration_tests`.

use chrono::{Datelike, NaiveDate, Weekday};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use g6_platform::{
    classify_error_message, run_index, AlertAggregator, AlertEvent, AlertType, AppConfig,
    AppContext, CycleExecutor, EventKind, ExpiryStatus, IndexConfig, MarketProvider, MockProvider,
    PanelWriter, ProviderError, Severity, SeverityStateMachine, SimulatedProvider, SnapshotGuard,
};

fn next_weekday(anchor: Weekday) -> NaiveDate {
    let mut d = g6_platform::ist_now().date_naive();
    while d.weekday() != anchor {
        d = d.succ_opt().unwrap();
    }
    d
}

fn test_config(dir: &std::path::Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.schedule.interval_secs = 60;
    cfg.schedule.run_once = true;
    cfg.market.force_open = true;
    cfg.paths.state_dir = dir.join("state");
    cfg.paths.csv_dir = dir.join("csv");
    cfg.panels.panels_dir = dir.join("panels");
    cfg
}

fn bootstrap(cfg: AppConfig, mock: Arc<MockProvider>) -> Arc<AppContext> {
    AppContext::bootstrap(
        cfg,
        vec![("primary".to_string(), mock as Arc<dyn MarketProvider>)],
    )
    .unwrap()
}

#[tokio::test]
async fn healthy_cycle_two_indices_collects_everything() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.indices = vec![
        IndexConfig::new("NIFTY", 50.0, 2, 2),
        IndexConfig::new("BANKNIFTY", 100.0, 2, 2),
    ];
    cfg.validate().unwrap();

    // Instrument chains for both weekly anchors.
    let expiries = vec![next_weekday(Weekday::Thu), next_weekday(Weekday::Wed)];
    let mock = Arc::new(MockProvider::new("primary", expiries));
    let ctx = bootstrap(cfg, mock);

    let mut executor = CycleExecutor::new(ctx.clone());
    let (_tx, rx) = watch::channel(false);
    executor.run(rx).await.unwrap();

    // 2 ITM + ATM + 2 OTM strikes, CE and PE, for each index.
    assert_eq!(ctx.metrics.cycle_sla_breach_total.get(), 0);
    let envelopes = ctx.panels.envelopes();
    let indices = envelopes["indices"].data["indices"].as_array().unwrap().clone();
    assert_eq!(indices.len(), 2);
    for entry in &indices {
        let expiries = entry["expiries"].as_array().unwrap();
        assert_eq!(expiries.len(), 1);
        assert_eq!(expiries[0]["status"], json!("OK"));
        assert_eq!(expiries[0]["options"], json!(10));
    }
    // Healthy cycle: success time recorded, data gap zeroed.
    assert!(ctx.status.last_success_unix.load(Ordering::Relaxed) > 0);
    // First cycle pushed a full baseline.
    assert!(ctx.bus.last_panel_full_id().is_some());
}

#[tokio::test]
async fn rate_limit_storm_opens_cooldown_and_downgrades_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.indices = vec![IndexConfig::new("NIFTY", 50.0, 2, 2)];
    cfg.provider.rate_limit.qps = 3;
    cfg.provider.rate_limit.consecutive_threshold = 2;
    cfg.provider.rate_limit.cooldown_seconds = 5;
    cfg.provider.retry.enabled = false;
    cfg.validate().unwrap();

    let expiry = next_weekday(Weekday::Thu);
    let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
    // Every quote call answers 429 for a while.
    mock.queue_quote_errors(
        (0..10)
            .map(|_| ProviderError::RateLimited("429 Too Many Requests".to_string()))
            .collect(),
    );
    let ctx = bootstrap(cfg, mock.clone());

    // Two consecutive 429s on the quote path trip the cooldown.
    let symbols = vec!["NIFTY_PROBE".to_string()];
    for _ in 0..2 {
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = ctx
            .provider
            .get_quotes(symbols.clone(), deadline)
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }
    let stats = &ctx.provider.rate_limiter_stats()["primary"];
    assert_eq!(stats.cooldowns_opened, 1);
    assert!(stats.cooldown_remaining.is_some());

    // While the cooldown is open the limiter rejects before the provider
    // is consulted: the index degrades with a rate_limited reason, no
    // upstream call is made, and the process keeps running.
    let spot_calls_before = *mock.spot_calls.lock();
    let deadline = Instant::now() + Duration::from_secs(5);
    let outcome = run_index(
        ctx.pipeline.clone(),
        ctx.cfg.indices[0].clone(),
        1.0,
        deadline,
    )
    .await;
    assert_eq!(outcome.failure.as_deref(), Some("rate_limited"));
    assert_eq!(*mock.spot_calls.lock(), spot_calls_before);
}

#[tokio::test]
async fn strike_coverage_shortfall_scales_depth_down_then_restores() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.indices = vec![IndexConfig::new("NIFTY", 50.0, 6, 6)];
    cfg.adaptive.strike_breach_threshold = 3;
    cfg.adaptive.strike_restore_healthy = 2;
    cfg.validate().unwrap();

    let expiry = next_weekday(Weekday::Thu);
    // Provider only carries 3 strikes per side: coverage 7/13 < 0.75.
    let thin = SimulatedProvider::new(vec![expiry]).with_strike_span(3);
    let ctx = AppContext::bootstrap(
        cfg,
        vec![("primary".to_string(), Arc::new(thin) as Arc<dyn MarketProvider>)],
    )
    .unwrap();

    let coverage_ok = ctx.cfg.coverage.strike_coverage_ok;
    let mut scaled = None;
    for cycle in 0..3 {
        let deadline = Instant::now() + Duration::from_secs(5);
        let outcome = run_index(
            ctx.pipeline.clone(),
            ctx.cfg.indices[0].clone(),
            ctx.adaptive.depth_scale("NIFTY"),
            deadline,
        )
        .await;
        let snap = &outcome.snapshots[0];
        assert_eq!(snap.status, ExpiryStatus::Partial, "cycle {cycle} partial");
        assert!(snap.strike_coverage < coverage_ok);
        scaled = ctx
            .adaptive
            .record_strike_coverage("NIFTY", snap.strike_coverage, coverage_ok);
    }
    // Third consecutive breach multiplied depth by the reduction factor.
    assert_eq!(scaled, Some(0.8));
    assert!((ctx.adaptive.depth_scale("NIFTY") - 0.8).abs() < 1e-9);

    // Healthy coverage for the restore window brings one step back.
    ctx.adaptive.record_strike_coverage("NIFTY", 0.95, coverage_ok);
    let restored = ctx
        .adaptive
        .record_strike_coverage("NIFTY", 0.95, coverage_ok)
        .unwrap();
    assert!((restored - 1.0).abs() < 1e-9);
}

#[test]
fn severity_decays_to_info_with_single_resolved_flag() {
    let mut sev_cfg = g6_platform::config::SeverityConfig::default();
    sev_cfg.min_streak = 2;
    sev_cfg.decay_cycles = 3;
    let mut machine = SeverityStateMachine::new(sev_cfg, None);

    let event = AlertEvent {
        alert_type: AlertType::InterpolationHigh,
        index: Some("NIFTY".to_string()),
        expiry: Some("this_week".to_string()),
        message: "interpolated fraction high".to_string(),
        ratio: 1.3,
    };

    // Triggered for five cycles: warn from cycle 2 onwards.
    for cycle in 1..=5 {
        machine.apply_cycle(cycle, std::slice::from_ref(&event));
    }
    assert_eq!(
        machine.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
        Severity::Warn
    );

    // Cleared: decays back to info after decay_cycles, resolved exactly once.
    let mut resolved = 0;
    for cycle in 6..=14 {
        for t in machine.apply_cycle(cycle, &[]) {
            if t.resolved {
                resolved += 1;
            }
        }
    }
    assert_eq!(resolved, 1);
    assert_eq!(
        machine.state_of(AlertType::InterpolationHigh, "NIFTY:this_week"),
        Severity::Info
    );
}

#[test]
fn sse_gap_beyond_max_forces_full_snapshot() {
    let bus = g6_platform::EventBus::new(4_096);
    let guard = SnapshotGuard::new(500, 1);

    bus.publish(EventKind::PanelFull, json!({"baseline": true}), Some("panels".to_string()));
    assert_eq!(guard.should_force_full(bus.snapshot_gap()), None);

    for i in 0..600 {
        bus.publish(EventKind::PanelDiff, json!({ "i": i }), None);
    }
    assert_eq!(
        guard.should_force_full(bus.snapshot_gap()),
        Some("gap_exceeded")
    );

    // The forced full resets the gap; ids stay strictly increasing for any
    // replay cursor.
    let full_id = bus.publish(EventKind::PanelFull, json!({"baseline": 2}), Some("panels".to_string()));
    assert_eq!(bus.snapshot_gap(), 0);
    let replay = bus.events_after(full_id - 50, 1_000);
    let mut prev = 0;
    for event in &replay {
        assert!(event.id > prev);
        prev = event.id;
    }
    assert!(replay.iter().any(|e| e.id == full_id));
}

#[tokio::test]
async fn holiday_skips_collection_but_keeps_serving() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.indices = vec![IndexConfig::new("NIFTY", 50.0, 2, 2)];
    cfg.market.force_open = false;
    cfg.market.holidays = vec![g6_platform::ist_now().date_naive()];
    cfg.validate().unwrap();

    let expiry = next_weekday(Weekday::Thu);
    let mock = Arc::new(MockProvider::new("primary", vec![expiry]));
    let ctx = bootstrap(cfg, mock.clone());

    let mut executor = CycleExecutor::new(ctx.clone());
    let (_tx, rx) = watch::channel(false);
    executor.run(rx).await.unwrap();

    // No provider traffic at all on the holiday.
    assert_eq!(*mock.spot_calls.lock(), 0);
    assert_eq!(ctx.metrics.cycle_sla_breach_total.get(), 0);
    assert_eq!(ctx.status.last_success_unix.load(Ordering::Relaxed), 0);
    // Panels still serve, flagging the closed market.
    let envelopes = ctx.panels.envelopes();
    assert_eq!(envelopes["system"].data["market_closed"], json!(true));
    // Metrics endpoint content remains available.
    assert!(ctx.metrics.encode().unwrap().contains("g6_market_open 0"));
}

#[test]
fn panel_write_read_round_trip_preserves_hash() {
    let dir = tempfile::tempdir().unwrap();
    let writer = PanelWriter::new(dir.path(), 8, false).unwrap();
    let data = json!({
        "indices": [
            {"symbol": "NIFTY", "spot": 24000.0, "status": "OK"},
            {"symbol": "BANKNIFTY", "spot": 51000.0, "status": "OK"},
        ]
    });
    let written = writer.write_panel("indices", data.clone()).unwrap();
    let read = PanelWriter::read_panel(dir.path(), "indices").unwrap();
    assert_eq!(read.data, data);
    assert_eq!(read.meta.hash, written.hash);

    // Re-hashing the data read back yields the identical hash.
    let rehash = g6_platform::canonical::panel_hash(&read.data, 8);
    assert_eq!(rehash, written.hash);
}

#[test]
fn error_classification_feeds_alert_taxonomy() {
    // Auth bubbles as index_failure without retry eligibility.
    let err = classify_error_message("401 Unauthorized: token expired");
    assert!(matches!(err, ProviderError::Auth(_)));
    assert!(!err.is_retryable());
    assert_eq!(err.partial_reason(), "auth_failed");

    let mut aggregator = AlertAggregator::new(g6_platform::config::AlertConfig::default());
    let events = aggregator.evaluate(&[g6_platform::IndexCycleOutcome::failed(
        "NIFTY",
        err.partial_reason(),
    )]);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].alert_type, AlertType::IndexFailure);
}
