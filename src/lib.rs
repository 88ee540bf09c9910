//! G6 - options-market data collection and observability platform
//!
//! This library provides:
//! - A fixed-interval cycle scheduler with budget and SLA enforcement
//! - The staged per-index collection pipeline (expiries, strikes, quotes,
//!   validation, coverage)
//! - Provider resilience: rate limiting, quote caching, circuit breaking
//!   and ordered failover
//! - Adaptive detail-mode control and the alert severity state machine
//! - Panels with canonical hashing, the event bus and the SSE push fabric
//! - Group-gated Prometheus metrics with a cardinality guard

pub mod adaptive_controller;
pub mod alerts;
pub mod canonical;
pub mod circuit_breaker;
pub mod composite_provider;
pub mod config;
pub mod context;
pub mod coverage;
pub mod cycle;
pub mod enrichment;
pub mod event_bus;
pub mod expiry_resolver;
pub mod market_calendar;
pub mod memory_monitor;
pub mod metrics;
pub mod panels;
pub mod pipeline;
pub mod provider;
pub mod quote_cache;
pub mod rate_limiter;
pub mod severity;
pub mod sinks;
pub mod sse_server;
pub mod strike_universe;
pub mod validation;

// Re-export main types for convenience
pub use adaptive_controller::{AdaptiveAction, AdaptiveController, ControllerInputs, DetailMode};
pub use alerts::{AlertAggregator, AlertEvent, AlertType};
pub use circuit_breaker::{CircuitBreaker, CircuitState, PersistedCircuitState};
pub use composite_provider::{CompositeProvider, FailoverEvent};
pub use config::{AppConfig, ConfigError, ExpiryTag, IndexConfig};
pub use context::{AppContext, RuntimeStatus};
pub use coverage::{classify, CoverageReport, ExpiryStatus};
pub use cycle::CycleExecutor;
pub use enrichment::{EnrichedOption, Enricher, QuoteBatcher};
pub use event_bus::{Event, EventBus, EventKind};
pub use expiry_resolver::{ExpiryResolution, ExpiryResolver};
pub use market_calendar::{ist_now, ist_rfc3339, MarketCalendar};
pub use memory_monitor::{MemoryMonitor, MemoryTierThresholds};
pub use metrics::MetricsRegistry;
pub use panels::{PanelEnvelope, PanelWriter, PANEL_SCHEMA_VERSION};
pub use pipeline::{run_index, ExpirySnapshot, IndexCycleOutcome, PipelineShared};
pub use provider::{
    classify_error_message, option_symbol, Instrument, MarketProvider, MockProvider, OptionType,
    ProviderError, Quote, SimulatedProvider, SpotPrice,
};
pub use quote_cache::QuoteCache;
pub use rate_limiter::ProviderRateLimiter;
pub use severity::{Severity, SeverityStateMachine, SeverityTransition};
pub use sinks::{CsvSink, NullSink, SnapshotSink};
pub use sse_server::SnapshotGuard;
pub use strike_universe::{StrikeUniverse, StrikeUniverseCache, UniverseSource};
pub use validation::{validate_rows, ValidationOutcome};
