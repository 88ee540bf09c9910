use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Option leg type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionType {
    CE,
    PE,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CE => "CE",
            Self::PE => "PE",
        }
    }
}

/// Upstream instrument row: one tradeable option contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub index: String,
    pub expiry_date: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
}

/// Per-symbol market quote as returned by the upstream broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub last_price: f64,
    pub volume: u64,
    pub oi: u64,
    pub bid: f64,
    pub ask: f64,
    #[serde(default)]
    pub avg_price: Option<f64>,
    #[serde(default)]
    pub iv: Option<f64>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotPrice {
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// Classified provider failure taxonomy. Retry and failover decisions
/// match on these variants rather than sniffing message strings.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Never retried; surfaces as an index_failure alert.
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Recoverable only after an enforced wait.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Never retried, but failover to the next provider is allowed.
    #[error("fatal provider error: {0}")]
    Fatal(String),
    #[error("recoverable provider error: {0}")]
    Recoverable(String),
}

impl ProviderError {
    /// Retry-eligible within the in-cycle retry loop. RateLimited waits are
    /// enforced by the rate limiter itself, not the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Recoverable(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Counts toward circuit-breaker failure accrual.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, Self::RateLimited(_))
    }

    /// Token recorded into `partial_reasons` when this error ends a stage.
    pub fn partial_reason(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::RateLimited(_) => "rate_limited",
            Self::Fatal(_) => "provider_fatal",
            Self::Recoverable(_) => "provider_error",
        }
    }
}

/// Classify a raw upstream error message. Provider adapters that only have
/// a string to go on funnel it through here.
pub fn classify_error_message(message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    if lower.contains("token") && (lower.contains("expired") || lower.contains("invalid"))
        || lower.contains("unauthorized")
        || lower.contains("forbidden")
        || lower.contains("api key")
    {
        ProviderError::Auth(message.to_string())
    } else if lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("rate limit")
    {
        ProviderError::RateLimited(message.to_string())
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ProviderError::Timeout(Duration::from_secs(0))
    } else if lower.contains("bad request") || lower.contains("not found") {
        ProviderError::Fatal(message.to_string())
    } else {
        ProviderError::Recoverable(message.to_string())
    }
}

/// Canonical option symbol, e.g. `NIFTY2025-08-0724000CE` is avoided in
/// favor of the compact broker convention `NIFTY07AUG2524000CE`.
pub fn option_symbol(index: &str, expiry: NaiveDate, strike: f64, ty: OptionType) -> String {
    const MONTHS: [&str; 12] = [
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ];
    format!(
        "{}{:02}{}{:02}{}{}",
        index,
        expiry.day(),
        MONTHS[expiry.month0() as usize],
        expiry.year() % 100,
        strike as i64,
        ty.as_str()
    )
}

/// Abstract upstream market-data operations. The concrete broker HTTP
/// client lives outside this crate; everything here programs against this
/// seam.
#[async_trait]
pub trait MarketProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_spot(&self, index: &str) -> Result<SpotPrice, ProviderError>;

    async fn get_instruments(&self, index: &str) -> Result<Vec<Instrument>, ProviderError>;

    async fn get_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError>;

    /// Last-traded-price only; defaults to a quote fetch.
    async fn get_ltp(&self, symbols: &[String]) -> Result<HashMap<String, f64>, ProviderError> {
        let quotes = self.get_quotes(symbols).await?;
        Ok(quotes.into_iter().map(|(s, q)| (s, q.last_price)).collect())
    }
}

/// Deterministic synthetic provider. Lets the orchestrator run end-to-end
/// with no broker attached; quotes are a pure function of (symbol, strike,
/// spot) so repeated cycles produce stable panels.
pub struct SimulatedProvider {
    name: String,
    spots: HashMap<String, f64>,
    expiries: Vec<NaiveDate>,
    strike_span: u32,
}

impl SimulatedProvider {
    pub fn new(expiries: Vec<NaiveDate>) -> Self {
        let mut spots = HashMap::new();
        spots.insert("NIFTY".to_string(), 24_000.0);
        spots.insert("BANKNIFTY".to_string(), 51_000.0);
        spots.insert("FINNIFTY".to_string(), 23_200.0);
        Self {
            name: "sim".to_string(),
            spots,
            expiries,
            strike_span: 25,
        }
    }

    pub fn with_spot(mut self, index: &str, price: f64) -> Self {
        self.spots.insert(index.to_string(), price);
        self
    }

    /// Limit generated strikes to +/- `span` steps around ATM.
    pub fn with_strike_span(mut self, span: u32) -> Self {
        self.strike_span = span;
        self
    }

    fn step_for(index: &str) -> f64 {
        match index {
            "BANKNIFTY" => 100.0,
            _ => 50.0,
        }
    }

    fn synthetic_quote(&self, inst: &Instrument, spot: f64) -> Quote {
        let intrinsic = match inst.option_type {
            OptionType::CE => (spot - inst.strike).max(0.0),
            OptionType::PE => (inst.strike - spot).max(0.0),
        };
        let distance = (inst.strike - spot).abs() / spot.max(1.0);
        let time_value = (spot * 0.01 * (-12.0 * distance).exp()).max(0.05);
        let last = intrinsic + time_value;
        let seed = mix(inst.symbol.as_bytes());
        Quote {
            last_price: round2(last),
            volume: 100 + seed % 5_000,
            oi: 1_000 + (seed >> 8) % 50_000,
            bid: round2(last * 0.995),
            ask: round2(last * 1.005),
            avg_price: Some(round2(last * 1.001)),
            iv: Some(0.12 + (distance * 0.8).min(0.9)),
            ts: Utc::now(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// FNV-1a; cheap stable per-symbol noise for the simulator.
fn mix(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

#[async_trait]
impl MarketProvider for SimulatedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_spot(&self, index: &str) -> Result<SpotPrice, ProviderError> {
        let price = self
            .spots
            .get(index)
            .copied()
            .ok_or_else(|| ProviderError::Fatal(format!("unknown index {index}")))?;
        Ok(SpotPrice {
            price,
            ts: Utc::now(),
        })
    }

    async fn get_instruments(&self, index: &str) -> Result<Vec<Instrument>, ProviderError> {
        let spot = self.get_spot(index).await?.price;
        let step = Self::step_for(index);
        let atm = (spot / step).round() * step;
        let mut out = Vec::new();
        for expiry in &self.expiries {
            for k in -(self.strike_span as i64)..=(self.strike_span as i64) {
                let strike = atm + k as f64 * step;
                if strike <= 0.0 {
                    continue;
                }
                for ty in [OptionType::CE, OptionType::PE] {
                    out.push(Instrument {
                        symbol: option_symbol(index, *expiry, strike, ty),
                        index: index.to_string(),
                        expiry_date: *expiry,
                        strike,
                        option_type: ty,
                    });
                }
            }
        }
        Ok(out)
    }

    async fn get_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        // Rebuild instrument metadata from every known index so quotes stay
        // a pure function of the symbol.
        let mut by_symbol = HashMap::new();
        for index in self.spots.keys() {
            let spot = self.spots[index];
            for inst in self.get_instruments(index).await? {
                by_symbol.insert(inst.symbol.clone(), (inst, spot));
            }
        }
        let mut out = HashMap::new();
        for sym in symbols {
            if let Some((inst, spot)) = by_symbol.get(sym) {
                out.insert(sym.clone(), self.synthetic_quote(inst, *spot));
            }
        }
        Ok(out)
    }
}

/// Scripted provider for tests: every operation can be forced to fail with
/// a chosen error, and call counts are recorded.
pub struct MockProvider {
    pub inner: SimulatedProvider,
    name: String,
    fail_spot: Mutex<Option<ProviderError>>,
    fail_instruments: Mutex<Option<ProviderError>>,
    fail_quotes: Mutex<Vec<ProviderError>>,
    pub spot_calls: Mutex<u64>,
    pub instrument_calls: Mutex<u64>,
    pub quote_calls: Mutex<u64>,
}

impl MockProvider {
    pub fn new(name: &str, expiries: Vec<NaiveDate>) -> Self {
        Self {
            inner: SimulatedProvider::new(expiries),
            name: name.to_string(),
            fail_spot: Mutex::new(None),
            fail_instruments: Mutex::new(None),
            fail_quotes: Mutex::new(Vec::new()),
            spot_calls: Mutex::new(0),
            instrument_calls: Mutex::new(0),
            quote_calls: Mutex::new(0),
        }
    }

    pub fn fail_spot_with(&self, err: ProviderError) {
        *self.fail_spot.lock() = Some(err);
    }

    pub fn fail_instruments_with(&self, err: ProviderError) {
        *self.fail_instruments.lock() = Some(err);
    }

    /// Queue errors returned by successive get_quotes calls (drained FIFO).
    pub fn queue_quote_errors(&self, errs: Vec<ProviderError>) {
        self.fail_quotes.lock().extend(errs);
    }
}

#[async_trait]
impl MarketProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_spot(&self, index: &str) -> Result<SpotPrice, ProviderError> {
        *self.spot_calls.lock() += 1;
        if let Some(err) = self.fail_spot.lock().clone() {
            return Err(err);
        }
        self.inner.get_spot(index).await
    }

    async fn get_instruments(&self, index: &str) -> Result<Vec<Instrument>, ProviderError> {
        *self.instrument_calls.lock() += 1;
        if let Some(err) = self.fail_instruments.lock().clone() {
            return Err(err);
        }
        self.inner.get_instruments(index).await
    }

    async fn get_quotes(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        *self.quote_calls.lock() += 1;
        let queued = {
            let mut q = self.fail_quotes.lock();
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        };
        if let Some(err) = queued {
            return Err(err);
        }
        self.inner.get_quotes(symbols).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_auth() {
        assert!(matches!(
            classify_error_message("403 Forbidden: api key invalid"),
            ProviderError::Auth(_)
        ));
    }

    #[test]
    fn classify_rate_limited() {
        assert!(matches!(
            classify_error_message("HTTP 429 Too Many Requests"),
            ProviderError::RateLimited(_)
        ));
    }

    #[test]
    fn classify_timeout_and_default() {
        assert!(matches!(
            classify_error_message("request timed out"),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            classify_error_message("connection reset by peer"),
            ProviderError::Recoverable(_)
        ));
    }

    #[test]
    fn option_symbol_format() {
        let expiry = NaiveDate::from_ymd_opt(2025, 8, 7).unwrap();
        assert_eq!(
            option_symbol("NIFTY", expiry, 24_000.0, OptionType::CE),
            "NIFTY07AUG2524000CE"
        );
    }

    #[tokio::test]
    async fn sim_provider_quotes_are_deterministic() {
        let expiry = NaiveDate::from_ymd_opt(2025, 8, 7).unwrap();
        let sim = SimulatedProvider::new(vec![expiry]);
        let instruments = sim.get_instruments("NIFTY").await.unwrap();
        assert!(!instruments.is_empty());
        let symbols: Vec<String> = instruments.iter().take(4).map(|i| i.symbol.clone()).collect();
        let a = sim.get_quotes(&symbols).await.unwrap();
        let b = sim.get_quotes(&symbols).await.unwrap();
        for s in &symbols {
            assert_eq!(a[s].last_price, b[s].last_price);
            assert_eq!(a[s].volume, b[s].volume);
        }
    }

    #[tokio::test]
    async fn mock_provider_queues_errors() {
        let expiry = NaiveDate::from_ymd_opt(2025, 8, 7).unwrap();
        let mock = MockProvider::new("primary", vec![expiry]);
        mock.queue_quote_errors(vec![ProviderError::RateLimited("429".into())]);
        let symbols = vec!["NIFTY07AUG2524000CE".to_string()];
        assert!(mock.get_quotes(&symbols).await.is_err());
        assert!(mock.get_quotes(&symbols).await.is_ok());
        assert_eq!(*mock.quote_calls.lock(), 2);
    }
}
