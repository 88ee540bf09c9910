use anyhow::Result;
use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Configuration assembly error. Maps to process exit code 2.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("unknown environment variable {0} (strict mode)")]
    UnknownEnv(String),
    #[error("deprecated key {old} rejected in strict mode, use {new}")]
    Deprecated { old: String, new: String },
    #[error("failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}

/// Logical expiry tag resolved to a concrete date each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryTag {
    ThisWeek,
    NextWeek,
    ThisMonth,
    NextMonth,
}

impl ExpiryTag {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "this_week" => Some(Self::ThisWeek),
            "next_week" => Some(Self::NextWeek),
            "this_month" => Some(Self::ThisMonth),
            "next_month" => Some(Self::NextMonth),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThisWeek => "this_week",
            Self::NextWeek => "next_week",
            Self::ThisMonth => "this_month",
            Self::NextMonth => "next_month",
        }
    }
}

/// Per-underlying collection settings. Immutable for the life of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    pub symbol: String,
    pub strike_step: f64,
    pub expiry_tags: Vec<ExpiryTag>,
    pub strikes_itm: u32,
    pub strikes_otm: u32,
    /// Weekly expiry anchor weekday. Defaults per exchange convention.
    #[serde(default)]
    pub expiry_weekday: Option<String>,
    /// When present, every resolved expiry must land in this set.
    #[serde(default)]
    pub allowed_expiry_dates: Option<Vec<NaiveDate>>,
}

impl IndexConfig {
    pub fn new(symbol: &str, strike_step: f64, itm: u32, otm: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            strike_step,
            expiry_tags: vec![ExpiryTag::ThisWeek],
            strikes_itm: itm,
            strikes_otm: otm,
            expiry_weekday: None,
            allowed_expiry_dates: None,
        }
    }

    /// Anchor weekday for weekly expiries: explicit config wins, then the
    /// exchange convention for known symbols, then Thursday.
    pub fn anchor_weekday(&self) -> Weekday {
        if let Some(name) = &self.expiry_weekday {
            if let Some(d) = parse_weekday(name) {
                return d;
            }
        }
        match self.symbol.as_str() {
            "BANKNIFTY" => Weekday::Wed,
            "FINNIFTY" => Weekday::Tue,
            "MIDCPNIFTY" => Weekday::Mon,
            "SENSEX" => Weekday::Fri,
            _ => Weekday::Thu,
        }
    }
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    match s.to_ascii_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    pub max_cycles: Option<u64>,
    pub run_once: bool,
    pub parallel_index_workers: usize,
    pub parallel_index_retry: u32,
    pub cycle_budget_fraction: f64,
    pub cycle_sla_fraction: f64,
    pub missing_cycle_factor: f64,
    pub index_soft_timeout_fraction: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_cycles: None,
            run_once: false,
            parallel_index_workers: 4,
            parallel_index_retry: 1,
            cycle_budget_fraction: 0.9,
            cycle_sla_fraction: 0.85,
            missing_cycle_factor: 2.0,
            index_soft_timeout_fraction: 0.25, // of the cycle interval
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs as f64 * self.cycle_budget_fraction)
    }

    pub fn index_soft_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs as f64 * self.index_soft_timeout_fraction)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub qps: u32,
    /// Bucket capacity. Defaults to 2x QPS when zero.
    pub max_burst: u32,
    pub consecutive_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            qps: 8,
            max_burst: 0,
            consecutive_threshold: 5,
            cooldown_seconds: 20,
        }
    }
}

impl RateLimitConfig {
    pub fn effective_burst(&self) -> u32 {
        if self.max_burst == 0 {
            self.qps.saturating_mul(2).max(1)
        } else {
            self.max_burst
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub base_backoff_ms: u64,
    pub max_reset_ms: u64,
    pub jitter_fraction: f64,
    pub half_open_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_backoff_ms: 2_000,
            max_reset_ms: 120_000,
            jitter_fraction: 0.2,
            half_open_successes: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub max_seconds: f64,
    pub backoff_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            max_seconds: 10.0,
            backoff_ms: 250,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub timeout_ms: u64,
    pub fail_fast: bool,
    pub validate_capabilities: bool,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            fail_fast: false,
            validate_capabilities: false,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    pub prefilter_max_instruments: usize,
    pub prefilter_strict: bool,
    pub quote_cache_ttl_ms: u64,
    pub batch_window_ms: u64,
    pub async_enrichment: bool,
    pub validation_bypass: bool,
    pub foreign_expiry_salvage: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            prefilter_max_instruments: 2_500, // floor 50 enforced in validate()
            prefilter_strict: false,
            quote_cache_ttl_ms: 1_000,
            batch_window_ms: 15,
            async_enrichment: false,
            validation_bypass: false,
            foreign_expiry_salvage: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoverageConfig {
    pub strike_coverage_ok: f64,
    pub field_coverage_ok: f64,
}

impl Default for CoverageConfig {
    fn default() -> Self {
        Self {
            strike_coverage_ok: 0.75,
            field_coverage_ok: 0.55,
        }
    }
}

/// Trigger thresholds for the alert aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub strike_cov_min: f64,
    pub field_cov_min: f64,
    pub interp_max_fraction: f64,
    pub interp_consec: u32,
    pub risk_delta_drift_pct: f64,
    pub risk_delta_drift_window: usize,
    pub bucket_util_min: f64,
    pub bucket_util_streak: u32,
    pub liquidity_min_fraction: f64,
    pub wide_spread_max: f64,
    pub stale_quote_seconds: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            strike_cov_min: 0.6,
            field_cov_min: 0.4,
            interp_max_fraction: 0.3,
            interp_consec: 3,
            risk_delta_drift_pct: 0.25,
            risk_delta_drift_window: 5,
            bucket_util_min: 0.5,
            bucket_util_streak: 3,
            liquidity_min_fraction: 0.5,
            wide_spread_max: 0.08,
            stale_quote_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub min_streak: u32,
    pub decay_cycles: u32,
    pub promote_cooldown: u32,
    pub demote_cooldown: u32,
    /// Minimum severity floor: "info" (no floor), "warn" or "critical".
    pub force_floor: Option<String>,
    /// Alert types allowed to drop critical -> info directly on strong recovery.
    pub critical_demote_types: Vec<String>,
    /// Exponential smoothing factor; 0 disables the trend extension.
    pub trend_smooth: f64,
    pub trend_warn_ratio: f64,
    pub trend_critical_ratio: f64,
    pub warn_ratio: f64,
    pub critical_ratio: f64,
    /// Ratio under which recovery counts as "strong" for the bypass list.
    pub resolved_ratio: f64,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            min_streak: 2,
            decay_cycles: 3,
            promote_cooldown: 1,
            demote_cooldown: 1,
            force_floor: None,
            critical_demote_types: Vec::new(),
            trend_smooth: 0.0,
            trend_warn_ratio: 1.0,
            trend_critical_ratio: 1.5,
            warn_ratio: 1.0,
            critical_ratio: 1.5,
            resolved_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub max_sla_breach_streak: u32,
    pub min_health_cycles: u32,
    pub demote_cooldown: u32,
    pub promote_cooldown: u32,
    pub min_detail_mode: u8,
    pub max_detail_mode: u8,
    pub band_atm_window: u32,
    /// Promote through multiple levels after a long healthy run.
    pub healthy_recovery_multi: bool,
    /// Let critical severities force a demotion.
    pub severity_feedback: bool,
    pub severity_feedback_types: Vec<String>,
    pub strike_breach_threshold: u32,
    pub strike_reduction: f64,
    pub strike_min: u32,
    pub strike_restore_healthy: u32,
    pub strike_scale_floor: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_sla_breach_streak: 3,
            min_health_cycles: 5,
            demote_cooldown: 2,
            promote_cooldown: 5,
            min_detail_mode: 0,
            max_detail_mode: 2,
            band_atm_window: 3,
            healthy_recovery_multi: false,
            severity_feedback: false,
            severity_feedback_types: Vec::new(),
            strike_breach_threshold: 3,
            strike_reduction: 0.8,
            strike_min: 2, // strikes per side, never reduced below this
            strike_restore_healthy: 5,
            strike_scale_floor: 0.4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelsConfig {
    pub panels_dir: PathBuf,
    pub auto_snapshots: bool,
    pub diff_full_interval: u64,
    pub diff_nest_depth: usize,
    pub legacy_compat: bool,
}

impl Default for PanelsConfig {
    fn default() -> Self {
        Self {
            panels_dir: PathBuf::from("data/panels"),
            auto_snapshots: true,
            diff_full_interval: 10,
            diff_nest_depth: 8,
            legacy_compat: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub max_backlog: usize,
    pub snapshot_gap_max: u64,
    pub force_full_retry_seconds: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_backlog: 2_048,
            snapshot_gap_max: 500,
            force_full_retry_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SseConfig {
    pub host: String,
    pub port: u16,
    pub api_token: Option<String>,
    pub ip_allow: Vec<String>,
    pub ua_allow_prefixes: Vec<String>,
    pub max_connections: usize,
    /// Per-IP connect budget, "count/window_seconds".
    pub connect_rate: String,
    pub events_per_sec: u32,
    pub max_event_bytes: usize,
    pub heartbeat_cycles: u32,
    pub retry_ms: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9315,
            api_token: None,
            ip_allow: Vec::new(),
            ua_allow_prefixes: Vec::new(),
            max_connections: 64,
            connect_rate: "6/10".to_string(),
            events_per_sec: 20,
            max_event_bytes: 65_536,
            heartbeat_cycles: 2,
            retry_ms: 3_000,
        }
    }
}

impl SseConfig {
    /// Parse "N/seconds" into (count, window).
    pub fn connect_rate_parts(&self) -> (u32, u64) {
        let mut it = self.connect_rate.splitn(2, '/');
        let n = it.next().and_then(|s| s.parse().ok()).unwrap_or(6);
        let w = it.next().and_then(|s| s.parse().ok()).unwrap_or(10);
        (n, w.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enable_groups: Vec<String>,
    pub disable_groups: Vec<String>,
    pub cardinality_max_series: usize,
    pub cardinality_min_disable_seconds: u64,
    pub cardinality_reenable_fraction: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_groups: Vec::new(), // empty allow-list = all groups
            disable_groups: Vec::new(),
            cardinality_max_series: 20_000,
            cardinality_min_disable_seconds: 300,
            cardinality_reenable_fraction: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub state_dir: PathBuf,
    pub alerts_state_dir: Option<PathBuf>,
    pub analytics_dir: PathBuf,
    pub csv_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("data/state"),
            alerts_state_dir: None,
            analytics_dir: PathBuf::from("data/analytics"),
            csv_dir: PathBuf::from("data/csv"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHoursConfig {
    /// "HH:MM" IST session bounds.
    pub open: String,
    pub close: String,
    pub force_open: bool,
    pub holidays: Vec<NaiveDate>,
}

impl Default for MarketHoursConfig {
    fn default() -> Self {
        Self {
            open: "09:15".to_string(),
            close: "15:30".to_string(),
            force_open: false,
            holidays: Vec::new(),
        }
    }
}

impl MarketHoursConfig {
    pub fn open_time(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.open, "%H:%M").unwrap_or_else(|_| {
            NaiveTime::from_hms_opt(9, 15, 0).unwrap()
        })
    }

    pub fn close_time(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.close, "%H:%M").unwrap_or_else(|_| {
            NaiveTime::from_hms_opt(15, 30, 0).unwrap()
        })
    }
}

/// Full application configuration. Assembled once at bootstrap with
/// precedence CLI > env > file > defaults, then frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub indices: Vec<IndexConfig>,
    pub schedule: ScheduleConfig,
    pub provider: ProviderConfig,
    pub collection: CollectionConfig,
    pub coverage: CoverageConfig,
    pub alerts: AlertConfig,
    pub severity: SeverityConfig,
    pub adaptive: AdaptiveConfig,
    pub panels: PanelsConfig,
    pub events: EventsConfig,
    pub sse: SseConfig,
    pub metrics: MetricsConfig,
    pub paths: PathsConfig,
    pub market: MarketHoursConfig,
    pub log_level: String,
    pub strict: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            indices: vec![
                IndexConfig::new("NIFTY", 50.0, 10, 10),
                IndexConfig::new("BANKNIFTY", 100.0, 10, 10),
            ],
            schedule: ScheduleConfig::default(),
            provider: ProviderConfig::default(),
            collection: CollectionConfig::default(),
            coverage: CoverageConfig::default(),
            alerts: AlertConfig::default(),
            severity: SeverityConfig::default(),
            adaptive: AdaptiveConfig::default(),
            panels: PanelsConfig::default(),
            events: EventsConfig::default(),
            sse: SseConfig::default(),
            metrics: MetricsConfig::default(),
            paths: PathsConfig::default(),
            market: MarketHoursConfig::default(),
            log_level: "info".to_string(),
            strict: false,
        }
    }
}

impl AppConfig {
    /// Load the file layer, then overlay environment variables.
    /// CLI overlay is applied by the caller afterwards.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut cfg = match config_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?;
                serde_json::from_str::<AppConfig>(&raw).map_err(|e| ConfigError::File {
                    path: path.to_string(),
                    reason: e.to_string(),
                })?
            }
            None => AppConfig::default(),
        };
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Overlay every recognized `G6_*` variable. Unknown names warn once
    /// (reject in strict mode); deprecated names are mapped with a warning.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        // Strict mode itself may be switched on from the environment, so
        // resolve it before walking the rest.
        if let Ok(v) = std::env::var("G6_STRICT_CONFIG") {
            self.strict = parse_bool(&v);
        }

        let vars: Vec<(String, String)> = std::env::vars()
            .filter(|(k, _)| k.starts_with("G6_"))
            .collect();

        // Interval precedence: G6_CYCLE_INTERVAL > G6_INTERVAL >
        // G6_COLLECTION_INTERVAL (deprecated alias).
        let has_cycle_interval = vars.iter().any(|(k, _)| k == "G6_CYCLE_INTERVAL");

        for (key, val) in &vars {
            match key.as_str() {
                "G6_STRICT_CONFIG" => {}
                "G6_LOG_LEVEL" => self.log_level = val.clone(),
                "G6_CYCLE_INTERVAL" | "G6_INTERVAL" => {
                    if key == "G6_INTERVAL" && has_cycle_interval {
                        continue;
                    }
                    self.schedule.interval_secs = parse_num(key, val)?;
                }
                "G6_COLLECTION_INTERVAL" => {
                    if self.strict {
                        return Err(ConfigError::Deprecated {
                            old: key.clone(),
                            new: "G6_CYCLE_INTERVAL".to_string(),
                        });
                    }
                    warn!("G6_COLLECTION_INTERVAL is deprecated, use G6_CYCLE_INTERVAL");
                    if !has_cycle_interval && !vars.iter().any(|(k, _)| k == "G6_INTERVAL") {
                        self.schedule.interval_secs = parse_num(key, val)?;
                    }
                }
                "G6_MAX_CYCLES" => self.schedule.max_cycles = Some(parse_num(key, val)?),
                "G6_RUN_ONCE" => self.schedule.run_once = parse_bool(val),
                "G6_PARALLEL_INDEX_WORKERS" => {
                    self.schedule.parallel_index_workers = parse_num(key, val)?
                }
                "G6_PARALLEL_INDEX_RETRY" => {
                    self.schedule.parallel_index_retry = parse_num(key, val)?
                }
                "G6_CYCLE_BUDGET_FRACTION" => {
                    self.schedule.cycle_budget_fraction = parse_num(key, val)?
                }
                "G6_CYCLE_SLA_FRACTION" => self.schedule.cycle_sla_fraction = parse_num(key, val)?,
                "G6_MISSING_CYCLE_FACTOR" => {
                    self.schedule.missing_cycle_factor = parse_num(key, val)?
                }
                "G6_INDEX_SOFT_TIMEOUT_FRACTION" => {
                    self.schedule.index_soft_timeout_fraction = parse_num(key, val)?
                }
                "G6_INDICES" => {
                    let keep: HashSet<String> =
                        val.split(',').map(|s| s.trim().to_string()).collect();
                    self.indices.retain(|i| keep.contains(&i.symbol));
                    for sym in keep {
                        if !self.indices.iter().any(|i| i.symbol == sym) {
                            self.indices.push(IndexConfig::new(&sym, 50.0, 10, 10));
                        }
                    }
                }
                "G6_EXPIRY_TAGS" => {
                    let tags: Vec<ExpiryTag> =
                        val.split(',').filter_map(ExpiryTag::parse).collect();
                    if tags.is_empty() {
                        return Err(ConfigError::Invalid {
                            key: key.clone(),
                            reason: format!("no valid expiry tags in '{val}'"),
                        });
                    }
                    for idx in &mut self.indices {
                        idx.expiry_tags = tags.clone();
                    }
                }
                "G6_FORCE_MARKET_OPEN" => self.market.force_open = parse_bool(val),
                "G6_MARKET_OPEN" => self.market.open = val.clone(),
                "G6_MARKET_CLOSE" => self.market.close = val.clone(),
                "G6_HOLIDAYS" => {
                    self.market.holidays = val
                        .split(',')
                        .filter_map(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                        .collect();
                }
                "G6_PREFILTER_MAX_INSTRUMENTS" => {
                    self.collection.prefilter_max_instruments = parse_num(key, val)?
                }
                "G6_PREFILTER_STRICT" => self.collection.prefilter_strict = parse_bool(val),
                "G6_QUOTE_CACHE_TTL_MS" => self.collection.quote_cache_ttl_ms = parse_num(key, val)?,
                "G6_BATCH_WINDOW_MS" => self.collection.batch_window_ms = parse_num(key, val)?,
                "G6_ASYNC_ENRICHMENT" => self.collection.async_enrichment = parse_bool(val),
                "G6_VALIDATION_BYPASS" => self.collection.validation_bypass = parse_bool(val),
                "G6_FOREIGN_EXPIRY_SALVAGE" => {
                    self.collection.foreign_expiry_salvage = parse_bool(val)
                }
                "G6_STRIKE_COVERAGE_OK" => self.coverage.strike_coverage_ok = parse_num(key, val)?,
                "G6_FIELD_COVERAGE_OK" => self.coverage.field_coverage_ok = parse_num(key, val)?,
                "G6_PROVIDER_QPS" => self.provider.rate_limit.qps = parse_num(key, val)?,
                "G6_PROVIDER_MAX_BURST" => self.provider.rate_limit.max_burst = parse_num(key, val)?,
                "G6_RATE_CONSECUTIVE_THRESHOLD" => {
                    self.provider.rate_limit.consecutive_threshold = parse_num(key, val)?
                }
                "G6_RATE_COOLDOWN_SECONDS" => {
                    self.provider.rate_limit.cooldown_seconds = parse_num(key, val)?
                }
                "G6_PROVIDER_TIMEOUT_MS" => self.provider.timeout_ms = parse_num(key, val)?,
                "G6_PROVIDER_FAIL_FAST" => self.provider.fail_fast = parse_bool(val),
                "G6_VALIDATE_PROVIDER" => self.provider.validate_capabilities = parse_bool(val),
                "G6_CIRCUIT_BREAKER_FAILURE_THRESHOLD" => {
                    self.provider.circuit_breaker.failure_threshold = parse_num(key, val)?
                }
                "G6_CIRCUIT_BREAKER_BASE_BACKOFF_MS" => {
                    self.provider.circuit_breaker.base_backoff_ms = parse_num(key, val)?
                }
                "G6_CIRCUIT_BREAKER_MAX_RESET_MS" => {
                    self.provider.circuit_breaker.max_reset_ms = parse_num(key, val)?
                }
                "G6_CIRCUIT_BREAKER_JITTER_FRACTION" => {
                    self.provider.circuit_breaker.jitter_fraction = parse_num(key, val)?
                }
                "G6_CIRCUIT_BREAKER_HALF_OPEN_SUCCESSES" => {
                    self.provider.circuit_breaker.half_open_successes = parse_num(key, val)?
                }
                "G6_RETRY_ENABLED" => self.provider.retry.enabled = parse_bool(val),
                "G6_RETRY_MAX_ATTEMPTS" => self.provider.retry.max_attempts = parse_num(key, val)?,
                "G6_RETRY_MAX_SECONDS" => self.provider.retry.max_seconds = parse_num(key, val)?,
                "G6_RETRY_BACKOFF_MS" => self.provider.retry.backoff_ms = parse_num(key, val)?,
                "G6_RETRY_JITTER" => self.provider.retry.jitter = parse_num(key, val)?,
                "G6_ALERT_STRIKE_COV_MIN" => self.alerts.strike_cov_min = parse_num(key, val)?,
                "G6_ALERT_FIELD_COV_MIN" => self.alerts.field_cov_min = parse_num(key, val)?,
                "G6_INTERP_MAX_FRACTION" => self.alerts.interp_max_fraction = parse_num(key, val)?,
                "G6_INTERP_CONSEC" => self.alerts.interp_consec = parse_num(key, val)?,
                "G6_RISK_DELTA_DRIFT_PCT" => {
                    self.alerts.risk_delta_drift_pct = parse_num(key, val)?
                }
                "G6_RISK_DELTA_DRIFT_WINDOW" => {
                    self.alerts.risk_delta_drift_window = parse_num(key, val)?
                }
                "G6_BUCKET_UTIL_MIN" => self.alerts.bucket_util_min = parse_num(key, val)?,
                "G6_BUCKET_UTIL_STREAK" => self.alerts.bucket_util_streak = parse_num(key, val)?,
                "G6_LIQUIDITY_MIN_FRACTION" => {
                    self.alerts.liquidity_min_fraction = parse_num(key, val)?
                }
                "G6_WIDE_SPREAD_MAX" => self.alerts.wide_spread_max = parse_num(key, val)?,
                "G6_STALE_QUOTE_SECONDS" => self.alerts.stale_quote_seconds = parse_num(key, val)?,
                "G6_SEVERITY_MIN_STREAK" => self.severity.min_streak = parse_num(key, val)?,
                "G6_SEVERITY_DECAY_CYCLES" => self.severity.decay_cycles = parse_num(key, val)?,
                "G6_SEVERITY_PROMOTE_COOLDOWN" => {
                    self.severity.promote_cooldown = parse_num(key, val)?
                }
                "G6_SEVERITY_DEMOTE_COOLDOWN" => {
                    self.severity.demote_cooldown = parse_num(key, val)?
                }
                "G6_SEVERITY_FORCE" => self.severity.force_floor = Some(val.clone()),
                "G6_SEVERITY_CRITICAL_DEMOTE_TYPES" => {
                    self.severity.critical_demote_types =
                        val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_SEVERITY_TREND_SMOOTH" => self.severity.trend_smooth = parse_num(key, val)?,
                "G6_SEVERITY_TREND_WARN_RATIO" => {
                    self.severity.trend_warn_ratio = parse_num(key, val)?
                }
                "G6_SEVERITY_TREND_CRITICAL_RATIO" => {
                    self.severity.trend_critical_ratio = parse_num(key, val)?
                }
                "G6_ADAPTIVE_ALERT_SEVERITY" => self.adaptive.severity_feedback = parse_bool(val),
                "G6_ADAPTIVE_ALERT_SEVERITY_TYPES" => {
                    self.adaptive.severity_feedback_types =
                        val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_MAX_SLA_BREACH_STREAK" => {
                    self.adaptive.max_sla_breach_streak = parse_num(key, val)?
                }
                "G6_MIN_HEALTH_CYCLES" => self.adaptive.min_health_cycles = parse_num(key, val)?,
                "G6_ADAPTIVE_DEMOTE_COOLDOWN" => {
                    self.adaptive.demote_cooldown = parse_num(key, val)?
                }
                "G6_ADAPTIVE_PROMOTE_COOLDOWN" => {
                    self.adaptive.promote_cooldown = parse_num(key, val)?
                }
                "G6_MIN_DETAIL_MODE" => self.adaptive.min_detail_mode = parse_num(key, val)?,
                "G6_MAX_DETAIL_MODE" => self.adaptive.max_detail_mode = parse_num(key, val)?,
                "G6_BAND_ATM_WINDOW" => self.adaptive.band_atm_window = parse_num(key, val)?,
                "G6_HEALTHY_RECOVERY_MULTI" => {
                    self.adaptive.healthy_recovery_multi = parse_bool(val)
                }
                "G6_STRIKE_BREACH_THRESHOLD" => {
                    self.adaptive.strike_breach_threshold = parse_num(key, val)?
                }
                "G6_STRIKE_REDUCTION" => self.adaptive.strike_reduction = parse_num(key, val)?,
                "G6_STRIKE_MIN" => self.adaptive.strike_min = parse_num(key, val)?,
                "G6_STRIKE_RESTORE_HEALTHY" => {
                    self.adaptive.strike_restore_healthy = parse_num(key, val)?
                }
                "G6_PANELS_DIR" => self.panels.panels_dir = PathBuf::from(val),
                "G6_AUTO_SNAPSHOTS" => self.panels.auto_snapshots = parse_bool(val),
                "G6_PANEL_DIFF_FULL_INTERVAL" => {
                    self.panels.diff_full_interval = parse_num(key, val)?
                }
                "G6_PANEL_DIFF_NEST_DEPTH" => self.panels.diff_nest_depth = parse_num(key, val)?,
                "G6_PANEL_LEGACY_COMPAT" => self.panels.legacy_compat = parse_bool(val),
                "G6_EVENTS_MAX_BACKLOG" => self.events.max_backlog = parse_num(key, val)?,
                "G6_SNAPSHOT_GAP_MAX" => self.events.snapshot_gap_max = parse_num(key, val)?,
                "G6_FORCE_FULL_RETRY_SECONDS" => {
                    self.events.force_full_retry_seconds = parse_num(key, val)?
                }
                "G6_HTTP_HOST" | "G6_SSE_HOST" => self.sse.host = val.clone(),
                "G6_HTTP_PORT" | "G6_SSE_PORT" => self.sse.port = parse_num(key, val)?,
                "G6_SSE_API_TOKEN" => self.sse.api_token = Some(val.clone()),
                "G6_SSE_IP_ALLOW" => {
                    self.sse.ip_allow = val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_SSE_UA_ALLOW" => {
                    self.sse.ua_allow_prefixes =
                        val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_SSE_MAX_CONNECTIONS" => self.sse.max_connections = parse_num(key, val)?,
                "G6_SSE_CONNECT_RATE" => self.sse.connect_rate = val.clone(),
                "G6_SSE_EVENTS_PER_SEC" => self.sse.events_per_sec = parse_num(key, val)?,
                "G6_SSE_MAX_EVENT_BYTES" => self.sse.max_event_bytes = parse_num(key, val)?,
                "G6_SSE_HEARTBEAT_CYCLES" => self.sse.heartbeat_cycles = parse_num(key, val)?,
                "G6_SSE_RETRY_MS" => self.sse.retry_ms = parse_num(key, val)?,
                "G6_ENABLE_METRIC_GROUPS" => {
                    self.metrics.enable_groups =
                        val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_DISABLE_METRIC_GROUPS" => {
                    self.metrics.disable_groups =
                        val.split(',').map(|s| s.trim().to_string()).collect()
                }
                "G6_CARDINALITY_MAX_SERIES" => {
                    self.metrics.cardinality_max_series = parse_num(key, val)?
                }
                "G6_CARDINALITY_MIN_DISABLE_SECONDS" => {
                    self.metrics.cardinality_min_disable_seconds = parse_num(key, val)?
                }
                "G6_CARDINALITY_REENABLE_FRACTION" => {
                    self.metrics.cardinality_reenable_fraction = parse_num(key, val)?
                }
                "G6_STATE_DIR" => self.paths.state_dir = PathBuf::from(val),
                "G6_ALERTS_STATE_DIR" => self.paths.alerts_state_dir = Some(PathBuf::from(val)),
                "G6_ANALYTICS_DIR" => self.paths.analytics_dir = PathBuf::from(val),
                "G6_CSV_DIR" => self.paths.csv_dir = PathBuf::from(val),
                other => {
                    if self.strict {
                        return Err(ConfigError::UnknownEnv(other.to_string()));
                    }
                    warn!("ignoring unrecognized environment variable {}", other);
                }
            }
        }
        Ok(())
    }

    /// Schema validation. Failures are fatal (exit 2) in strict mode and
    /// for structurally unusable values in any mode.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.indices.is_empty() {
            return Err(invalid("indices", "at least one index required"));
        }
        for idx in &self.indices {
            if idx.symbol.is_empty() || !idx.symbol.chars().all(|c| c.is_ascii_uppercase()) {
                return Err(invalid(
                    "indices.symbol",
                    &format!("'{}' must match [A-Z]+", idx.symbol),
                ));
            }
            if idx.strike_step <= 0.0 {
                return Err(invalid(
                    "indices.strike_step",
                    &format!("{} must be positive", idx.strike_step),
                ));
            }
            if idx.expiry_tags.is_empty() {
                return Err(invalid("indices.expiry_tags", "must not be empty"));
            }
        }
        check_unit_open("schedule.cycle_sla_fraction", self.schedule.cycle_sla_fraction)?;
        check_unit_open(
            "schedule.cycle_budget_fraction",
            self.schedule.cycle_budget_fraction,
        )?;
        check_unit_closed("coverage.strike_coverage_ok", self.coverage.strike_coverage_ok)?;
        check_unit_closed("coverage.field_coverage_ok", self.coverage.field_coverage_ok)?;
        check_unit_closed("severity.trend_smooth", self.severity.trend_smooth)?;
        if self.schedule.missing_cycle_factor < 1.0 {
            return Err(invalid("schedule.missing_cycle_factor", "must be >= 1.0"));
        }
        if !(0.0..1.0).contains(&self.adaptive.strike_reduction) {
            return Err(invalid("adaptive.strike_reduction", "must be in (0,1)"));
        }
        if self.adaptive.min_detail_mode > 2 || self.adaptive.max_detail_mode > 2 {
            return Err(invalid("adaptive.detail_mode", "modes are 0..=2"));
        }
        if self.adaptive.min_detail_mode > self.adaptive.max_detail_mode {
            return Err(invalid("adaptive.detail_mode", "min must be <= max"));
        }
        if let Some(f) = &self.severity.force_floor {
            if !matches!(f.as_str(), "info" | "warn" | "critical") {
                return Err(invalid("severity.force_floor", "one of info|warn|critical"));
            }
        }
        if self.provider.rate_limit.qps == 0 {
            return Err(invalid("provider.rate_limit.qps", "must be positive"));
        }
        // Documented floor: prefilter clamps never drop below 50 instruments.
        if self.collection.prefilter_max_instruments < 50 {
            info!(
                "prefilter_max_instruments {} raised to floor 50",
                self.collection.prefilter_max_instruments
            );
            self.collection.prefilter_max_instruments = 50;
        }
        Ok(())
    }

    pub fn index(&self, symbol: &str) -> Option<&IndexConfig> {
        self.indices.iter().find(|i| i.symbol == symbol)
    }
}

fn invalid(key: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn check_unit_open(key: &str, v: f64) -> Result<(), ConfigError> {
    if v > 0.0 && v <= 1.0 {
        Ok(())
    } else {
        Err(invalid(key, &format!("{v} must be in (0,1]")))
    }
}

fn check_unit_closed(key: &str, v: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&v) {
        Ok(())
    } else {
        Err(invalid(key, &format!("{v} must be in [0,1]")))
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_num<T: std::str::FromStr>(key: &str, v: &str) -> Result<T, ConfigError> {
    v.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        reason: format!("cannot parse '{v}'"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.schedule.interval_secs, 60);
        assert_eq!(cfg.collection.prefilter_max_instruments, 2_500);
    }

    #[test]
    fn bad_symbol_rejected() {
        let mut cfg = AppConfig::default();
        cfg.indices[0].symbol = "nifty50".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn sla_fraction_bounds() {
        let mut cfg = AppConfig::default();
        cfg.schedule.cycle_sla_fraction = 0.0;
        assert!(cfg.validate().is_err());
        cfg.schedule.cycle_sla_fraction = 1.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn prefilter_floor_applied() {
        let mut cfg = AppConfig::default();
        cfg.collection.prefilter_max_instruments = 10;
        cfg.validate().unwrap();
        assert_eq!(cfg.collection.prefilter_max_instruments, 50);
    }

    #[test]
    fn expiry_tag_round_trip() {
        for tag in [
            ExpiryTag::ThisWeek,
            ExpiryTag::NextWeek,
            ExpiryTag::ThisMonth,
            ExpiryTag::NextMonth,
        ] {
            assert_eq!(ExpiryTag::parse(tag.as_str()), Some(tag));
        }
        assert_eq!(ExpiryTag::parse("fortnight"), None);
    }

    #[test]
    fn anchor_weekday_defaults() {
        assert_eq!(
            IndexConfig::new("BANKNIFTY", 100.0, 2, 2).anchor_weekday(),
            Weekday::Wed
        );
        assert_eq!(
            IndexConfig::new("NIFTY", 50.0, 2, 2).anchor_weekday(),
            Weekday::Thu
        );
        let mut custom = IndexConfig::new("NIFTY", 50.0, 2, 2);
        custom.expiry_weekday = Some("friday".to_string());
        assert_eq!(custom.anchor_weekday(), Weekday::Fri);
    }

    #[test]
    fn connect_rate_parses() {
        let sse = SseConfig {
            connect_rate: "3/30".to_string(),
            ..SseConfig::default()
        };
        assert_eq!(sse.connect_rate_parts(), (3, 30));
    }
}
