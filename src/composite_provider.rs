use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::ProviderConfig;
use crate::provider::{Instrument, MarketProvider, ProviderError, Quote, SpotPrice};
use crate::rate_limiter::ProviderRateLimiter;

/// One upstream provider with its private rate limiter and circuit breaker.
pub struct ProviderEntry {
    pub name: String,
    provider: Arc<dyn MarketProvider>,
    limiter: ProviderRateLimiter,
    breaker: CircuitBreaker,
}

/// A failover hop observed during a call, drained each cycle into the
/// `g6_provider_failover_total{from,to}` counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverEvent {
    pub from: String,
    pub to: String,
}

/// Ordered fan-out across providers: each call walks the list, skipping
/// open circuits, retrying retryable errors within the per-call budget, and
/// failing over on anything else. First success wins.
pub struct CompositeProvider {
    entries: Vec<ProviderEntry>,
    cfg: ProviderConfig,
    failover_events: Mutex<Vec<FailoverEvent>>,
}

impl CompositeProvider {
    pub fn new(
        cfg: ProviderConfig,
        providers: Vec<(String, Arc<dyn MarketProvider>)>,
        state_dir: Option<&Path>,
    ) -> Self {
        let entries = providers
            .into_iter()
            .map(|(name, provider)| ProviderEntry {
                limiter: ProviderRateLimiter::new(&name, cfg.rate_limit.clone()),
                breaker: CircuitBreaker::new(&name, cfg.circuit_breaker.clone(), state_dir),
                name,
                provider,
            })
            .collect();
        Self {
            entries,
            cfg,
            failover_events: Mutex::new(Vec::new()),
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    pub fn circuit_states(&self) -> HashMap<String, CircuitState> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.breaker.state()))
            .collect()
    }

    pub fn rate_limiter_stats(&self) -> HashMap<String, crate::rate_limiter::RateLimiterStats> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.limiter.stats()))
            .collect()
    }

    /// Drain failover hops recorded since the last call.
    pub fn take_failover_events(&self) -> Vec<FailoverEvent> {
        std::mem::take(&mut *self.failover_events.lock())
    }

    pub async fn get_spot(&self, index: &str, deadline: Instant) -> Result<SpotPrice, ProviderError> {
        let index = index.to_string();
        self.call("get_spot", deadline, move |p| {
            let index = index.clone();
            Box::pin(async move { p.get_spot(&index).await })
        })
        .await
    }

    pub async fn get_instruments(
        &self,
        index: &str,
        deadline: Instant,
    ) -> Result<Vec<Instrument>, ProviderError> {
        let index = index.to_string();
        self.call("get_instruments", deadline, move |p| {
            let index = index.clone();
            Box::pin(async move { p.get_instruments(&index).await })
        })
        .await
    }

    pub async fn get_quotes(
        &self,
        symbols: Vec<String>,
        deadline: Instant,
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        self.call("get_quotes", deadline, move |p| {
            let symbols = symbols.clone();
            Box::pin(async move { p.get_quotes(&symbols).await })
        })
        .await
    }

    pub async fn get_ltp(
        &self,
        symbols: Vec<String>,
        deadline: Instant,
    ) -> Result<HashMap<String, f64>, ProviderError> {
        self.call("get_ltp", deadline, move |p| {
            let symbols = symbols.clone();
            Box::pin(async move { p.get_ltp(&symbols).await })
        })
        .await
    }

    /// Startup probe: every configured index must answer a spot request on
    /// at least one provider.
    pub async fn validate_capabilities(&self, indices: &[String]) -> Result<(), ProviderError> {
        for index in indices {
            let deadline = Instant::now() + Duration::from_millis(self.cfg.timeout_ms * 2);
            self.get_spot(index, deadline).await?;
            debug!("capability probe ok for {}", index);
        }
        Ok(())
    }

    async fn call<T, F>(&self, op: &str, deadline: Instant, f: F) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn MarketProvider>) -> BoxFuture<'static, Result<T, ProviderError>>,
    {
        let mut last_err =
            ProviderError::Fatal(format!("{op}: no providers configured"));
        let count = self.entries.len();

        for (pos, entry) in self.entries.iter().enumerate() {
            if !entry.breaker.allow_request() {
                debug!("circuit open for {}, skipping {}", entry.name, op);
                last_err = ProviderError::Recoverable(format!(
                    "{}: circuit open for {}",
                    op, entry.name
                ));
                self.record_failover(pos, count);
                continue;
            }

            match self.call_one(entry, op, deadline, &f).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    last_err = err;
                    self.record_failover(pos, count);
                    if self.cfg.fail_fast {
                        warn!("fail-fast enabled, not trying providers after {}", entry.name);
                        break;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// One provider: bounded retry loop with exponential backoff + jitter.
    /// Auth/Fatal are blacklisted from retry; RateLimited waits are owned by
    /// the limiter, not retried here.
    async fn call_one<T, F>(
        &self,
        entry: &ProviderEntry,
        op: &str,
        deadline: Instant,
        f: &F,
    ) -> Result<T, ProviderError>
    where
        F: Fn(Arc<dyn MarketProvider>) -> BoxFuture<'static, Result<T, ProviderError>>,
    {
        let retry = &self.cfg.retry;
        let started = Instant::now();
        let max_attempts = if retry.enabled { retry.max_attempts.max(1) } else { 1 };
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            entry.limiter.acquire(deadline).await?;

            let call_timeout = Duration::from_millis(self.cfg.timeout_ms)
                .min(deadline.saturating_duration_since(Instant::now()));
            let outcome = match tokio::time::timeout(call_timeout, f(entry.provider.clone())).await
            {
                Ok(res) => res,
                Err(_) => Err(ProviderError::Timeout(call_timeout)),
            };

            match outcome {
                Ok(value) => {
                    entry.limiter.record_success();
                    entry.breaker.record_success();
                    if attempt > 1 {
                        info!("✅ {} on {} succeeded after {} attempts", op, entry.name, attempt);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if err.is_rate_limited() {
                        entry.limiter.record_rate_limited();
                    }
                    if err.trips_breaker() {
                        entry.breaker.record_failure();
                    }

                    let budget_left = started.elapsed().as_secs_f64() < retry.max_seconds
                        && Instant::now() < deadline;
                    if !err.is_retryable() || attempt >= max_attempts || !budget_left {
                        debug!("{} on {} failed ({}): {}", op, entry.name, attempt, err);
                        return Err(err);
                    }

                    let backoff = backoff_with_jitter(retry.backoff_ms, attempt, retry.jitter);
                    warn!(
                        "⚠️  {} on {} failed (attempt {}/{}), retrying in {}ms: {}",
                        op,
                        entry.name,
                        attempt,
                        max_attempts,
                        backoff.as_millis(),
                        err
                    );
                    tokio::time::sleep(backoff.min(deadline.saturating_duration_since(Instant::now())))
                        .await;
                }
            }
        }
    }

    fn record_failover(&self, from_pos: usize, total: usize) {
        let from = self.entries[from_pos].name.clone();
        let to = if from_pos + 1 < total {
            self.entries[from_pos + 1].name.clone()
        } else {
            "exhausted".to_string()
        };
        self.failover_events.lock().push(FailoverEvent { from, to });
    }
}

fn backoff_with_jitter(base_ms: u64, attempt: u32, jitter: f64) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << (attempt - 1).min(16)) as f64;
    let jittered = exp * (1.0 + jitter * (fastrand::f64() * 2.0 - 1.0));
    Duration::from_millis(jittered.max(0.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use chrono::NaiveDate;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 7).unwrap()
    }

    fn composite(
        primary: Arc<MockProvider>,
        secondary: Arc<MockProvider>,
        fail_fast: bool,
    ) -> CompositeProvider {
        let mut cfg = ProviderConfig::default();
        cfg.fail_fast = fail_fast;
        cfg.retry.enabled = false;
        CompositeProvider::new(
            cfg,
            vec![
                ("primary".to_string(), primary as Arc<dyn MarketProvider>),
                ("secondary".to_string(), secondary as Arc<dyn MarketProvider>),
            ],
            None,
        )
    }

    #[tokio::test]
    async fn failover_to_secondary_on_primary_failure() {
        let primary = Arc::new(MockProvider::new("primary", vec![expiry()]));
        let secondary = Arc::new(MockProvider::new("secondary", vec![expiry()]));
        primary.fail_spot_with(ProviderError::Recoverable("boom".into()));

        let cp = composite(primary.clone(), secondary.clone(), false);
        let deadline = Instant::now() + Duration::from_secs(2);
        let spot = cp.get_spot("NIFTY", deadline).await.unwrap();
        assert!(spot.price > 0.0);
        assert_eq!(*secondary.spot_calls.lock(), 1);

        let hops = cp.take_failover_events();
        assert_eq!(
            hops,
            vec![FailoverEvent {
                from: "primary".to_string(),
                to: "secondary".to_string()
            }]
        );
        assert!(cp.take_failover_events().is_empty());
    }

    #[tokio::test]
    async fn fail_fast_stops_after_first_failure() {
        let primary = Arc::new(MockProvider::new("primary", vec![expiry()]));
        let secondary = Arc::new(MockProvider::new("secondary", vec![expiry()]));
        primary.fail_spot_with(ProviderError::Recoverable("boom".into()));

        let cp = composite(primary, secondary.clone(), true);
        let deadline = Instant::now() + Duration::from_secs(2);
        assert!(cp.get_spot("NIFTY", deadline).await.is_err());
        assert_eq!(*secondary.spot_calls.lock(), 0);
    }

    #[tokio::test]
    async fn retry_recovers_transient_quote_failure() {
        let primary = Arc::new(MockProvider::new("primary", vec![expiry()]));
        primary.queue_quote_errors(vec![ProviderError::Recoverable("reset".into())]);

        let mut cfg = ProviderConfig::default();
        cfg.retry.backoff_ms = 1;
        let cp = CompositeProvider::new(
            cfg,
            vec![("primary".to_string(), primary.clone() as Arc<dyn MarketProvider>)],
            None,
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        let quotes = cp
            .get_quotes(vec!["NIFTY07AUG2524000CE".to_string()], deadline)
            .await
            .unwrap();
        assert_eq!(quotes.len(), 1);
        assert_eq!(*primary.quote_calls.lock(), 2);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let primary = Arc::new(MockProvider::new("primary", vec![expiry()]));
        primary.fail_spot_with(ProviderError::Auth("token expired".into()));

        let mut cfg = ProviderConfig::default();
        cfg.retry.backoff_ms = 1;
        let cp = CompositeProvider::new(
            cfg,
            vec![("primary".to_string(), primary.clone() as Arc<dyn MarketProvider>)],
            None,
        );
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = cp.get_spot("NIFTY", deadline).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert_eq!(*primary.spot_calls.lock(), 1);
    }
}
