use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::adaptive_controller::AdaptiveController;
use crate::alerts::AlertAggregator;
use crate::composite_provider::CompositeProvider;
use crate::config::AppConfig;
use crate::enrichment::{Enricher, QuoteBatcher};
use crate::event_bus::EventBus;
use crate::expiry_resolver::ExpiryResolver;
use crate::market_calendar::MarketCalendar;
use crate::memory_monitor::{MemoryMonitor, MemoryTierThresholds};
use crate::metrics::MetricsRegistry;
use crate::panels::PanelWriter;
use crate::pipeline::PipelineShared;
use crate::provider::MarketProvider;
use crate::quote_cache::QuoteCache;
use crate::severity::SeverityStateMachine;
use crate::sinks::{CsvSink, SnapshotSink};
use crate::strike_universe::StrikeUniverseCache;

/// Live counters shared between the executor and the HTTP surface.
pub struct RuntimeStatus {
    pub started_at: Instant,
    pub cycle: AtomicU64,
    pub last_cycle_ms: AtomicU64,
    pub market_open: AtomicBool,
    pub panel_updates_last: AtomicU64,
    pub diff_considered: AtomicU64,
    pub diff_unchanged: AtomicU64,
    pub sse_events_sent: AtomicU64,
    pub sse_clients: AtomicUsize,
    pub last_success_unix: AtomicU64,
}

impl RuntimeStatus {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            cycle: AtomicU64::new(0),
            last_cycle_ms: AtomicU64::new(0),
            market_open: AtomicBool::new(false),
            panel_updates_last: AtomicU64::new(0),
            diff_considered: AtomicU64::new(0),
            diff_unchanged: AtomicU64::new(0),
            sse_events_sent: AtomicU64::new(0),
            sse_clients: AtomicUsize::new(0),
            last_success_unix: AtomicU64::new(0),
        }
    }

    /// Fraction of panel hash checks that were unchanged (diff suppressed).
    pub fn diff_hit_ratio(&self) -> f64 {
        let considered = self.diff_considered.load(Ordering::Relaxed);
        if considered == 0 {
            0.0
        } else {
            self.diff_unchanged.load(Ordering::Relaxed) as f64 / considered as f64
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// The single process-wide context handed down to every component. The
/// metrics registry, event bus and caches inside it are the only
/// sanctioned singletons, all created here at bootstrap.
pub struct AppContext {
    pub cfg: AppConfig,
    pub metrics: Arc<MetricsRegistry>,
    pub bus: Arc<EventBus>,
    pub panels: Arc<PanelWriter>,
    pub provider: Arc<CompositeProvider>,
    pub quote_cache: Arc<QuoteCache>,
    pub pipeline: Arc<PipelineShared>,
    pub adaptive: Arc<AdaptiveController>,
    pub severity: Mutex<SeverityStateMachine>,
    pub alerts: Mutex<AlertAggregator>,
    pub memory: MemoryMonitor,
    pub calendar: Arc<MarketCalendar>,
    pub status: Arc<RuntimeStatus>,
    pub sinks: Vec<Arc<dyn SnapshotSink>>,
}

impl AppContext {
    pub fn bootstrap(
        cfg: AppConfig,
        providers: Vec<(String, Arc<dyn MarketProvider>)>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&cfg.paths.state_dir)
            .with_context(|| format!("creating state dir {}", cfg.paths.state_dir.display()))?;

        let metrics = Arc::new(MetricsRegistry::new(cfg.metrics.clone())?);
        let bus = Arc::new(EventBus::new(cfg.events.max_backlog));
        let panels = Arc::new(PanelWriter::new(
            &cfg.panels.panels_dir,
            cfg.panels.diff_nest_depth,
            cfg.panels.legacy_compat,
        )?);

        let provider = Arc::new(CompositeProvider::new(
            cfg.provider.clone(),
            providers,
            Some(cfg.paths.state_dir.as_path()),
        ));
        let quote_cache = Arc::new(QuoteCache::new(Duration::from_millis(
            cfg.collection.quote_cache_ttl_ms,
        )));
        let batcher = if cfg.collection.async_enrichment {
            Some(Arc::new(QuoteBatcher::new(
                provider.clone(),
                Duration::from_millis(cfg.collection.batch_window_ms),
            )))
        } else {
            None
        };
        let enricher = Enricher::new(quote_cache.clone(), provider.clone(), batcher);

        let calendar = Arc::new(MarketCalendar::new(&cfg.market));
        let pipeline = Arc::new(PipelineShared {
            cfg: cfg.clone(),
            provider: provider.clone(),
            enricher,
            strikes: StrikeUniverseCache::new(256),
            resolver: ExpiryResolver::new(calendar.clone()),
        });

        let index_symbols: Vec<String> = cfg.indices.iter().map(|i| i.symbol.clone()).collect();
        let adaptive = Arc::new(AdaptiveController::new(cfg.adaptive.clone(), &index_symbols));
        let severity = Mutex::new(SeverityStateMachine::new(
            cfg.severity.clone(),
            cfg.paths.alerts_state_dir.as_deref(),
        ));
        let alerts = Mutex::new(AlertAggregator::new(cfg.alerts.clone()));
        let memory = MemoryMonitor::new(MemoryTierThresholds::default());
        let sinks: Vec<Arc<dyn SnapshotSink>> =
            vec![Arc::new(CsvSink::new(&cfg.paths.csv_dir)?)];

        info!(
            "🚀 G6 bootstrap complete: {} indices, providers [{}]",
            cfg.indices.len(),
            provider.provider_names().join(", ")
        );

        Ok(Arc::new(Self {
            cfg,
            metrics,
            bus,
            panels,
            provider,
            quote_cache,
            pipeline,
            adaptive,
            severity,
            alerts,
            memory,
            calendar,
            status: Arc::new(RuntimeStatus::new()),
            sinks,
        }))
    }
}
