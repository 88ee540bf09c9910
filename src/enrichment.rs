use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::composite_provider::CompositeProvider;
use crate::provider::{Instrument, OptionType, ProviderError, Quote};
use crate::quote_cache::QuoteCache;

/// Instrument merged with its quote plus derived fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichedOption {
    pub symbol: String,
    pub index: String,
    pub expiry_date: NaiveDate,
    pub strike: f64,
    pub option_type: OptionType,
    pub last_price: f64,
    pub volume: u64,
    pub oi: u64,
    pub bid: f64,
    pub ask: f64,
    pub avg_price: Option<f64>,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub quote_ts: DateTime<Utc>,
    /// Synthesized from neighboring strikes rather than quoted upstream.
    pub interpolated: bool,
}

impl EnrichedOption {
    pub fn from_parts(inst: &Instrument, quote: &Quote, spot: f64) -> Self {
        let delta = quote
            .iv
            .filter(|iv| *iv > 0.0)
            .map(|iv| bs_delta(spot, inst.strike, iv, years_to_expiry(inst.expiry_date, quote.ts), inst.option_type));
        Self {
            symbol: inst.symbol.clone(),
            index: inst.index.clone(),
            expiry_date: inst.expiry_date,
            strike: inst.strike,
            option_type: inst.option_type,
            last_price: quote.last_price,
            volume: quote.volume,
            oi: quote.oi,
            bid: quote.bid,
            ask: quote.ask,
            avg_price: quote.avg_price,
            iv: quote.iv,
            delta,
            quote_ts: quote.ts,
            interpolated: false,
        }
    }

    /// Relative bid/ask spread; 0 when unquotable.
    pub fn relative_spread(&self) -> f64 {
        let mid = (self.bid + self.ask) / 2.0;
        if mid <= 0.0 {
            0.0
        } else {
            (self.ask - self.bid).max(0.0) / mid
        }
    }
}

fn years_to_expiry(expiry: NaiveDate, now: DateTime<Utc>) -> f64 {
    let days = (expiry - now.date_naive()).num_days().max(1) as f64;
    days / 365.0
}

/// Black-Scholes delta with r = 0; enough for drift monitoring.
fn bs_delta(spot: f64, strike: f64, iv: f64, t_years: f64, ty: OptionType) -> f64 {
    if spot <= 0.0 || strike <= 0.0 || t_years <= 0.0 {
        return 0.0;
    }
    let sigma_sqrt_t = iv * t_years.sqrt();
    let d1 = ((spot / strike).ln() + 0.5 * iv * iv * t_years) / sigma_sqrt_t;
    match ty {
        OptionType::CE => norm_cdf(d1),
        OptionType::PE => norm_cdf(d1) - 1.0,
    }
}

/// Abramowitz & Stegun 7.1.26 approximation of the standard normal CDF.
fn norm_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    let pdf = (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let cdf = 1.0 - pdf * poly;
    if x >= 0.0 {
        cdf
    } else {
        1.0 - cdf
    }
}

struct PendingBatch {
    symbols: Vec<String>,
    waiters: Vec<oneshot::Sender<Result<Arc<HashMap<String, Quote>>, ProviderError>>>,
    deadline: Option<Instant>,
    leader_running: bool,
}

/// Consolidates cache-miss symbols from concurrent index pipelines into one
/// provider call per batching window.
pub struct QuoteBatcher {
    provider: Arc<CompositeProvider>,
    window: Duration,
    pending: Mutex<PendingBatch>,
}

impl QuoteBatcher {
    pub fn new(provider: Arc<CompositeProvider>, window: Duration) -> Self {
        Self {
            provider,
            window,
            pending: Mutex::new(PendingBatch {
                symbols: Vec::new(),
                waiters: Vec::new(),
                deadline: None,
                leader_running: false,
            }),
        }
    }

    pub async fn fetch(
        self: &Arc<Self>,
        symbols: Vec<String>,
        deadline: Instant,
    ) -> Result<Arc<HashMap<String, Quote>>, ProviderError> {
        let (tx, rx) = oneshot::channel();
        let spawn_leader = {
            let mut pending = self.pending.lock();
            pending.symbols.extend(symbols);
            pending.waiters.push(tx);
            pending.deadline = Some(match pending.deadline {
                Some(d) => d.min(deadline),
                None => deadline,
            });
            if pending.leader_running {
                false
            } else {
                pending.leader_running = true;
                true
            }
        };

        if spawn_leader {
            let batcher = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(batcher.window).await;
                batcher.flush().await;
            });
        }

        rx.await
            .map_err(|_| ProviderError::Recoverable("quote batch leader dropped".to_string()))?
    }

    async fn flush(self: Arc<Self>) {
        let (mut symbols, waiters, deadline) = {
            let mut pending = self.pending.lock();
            pending.leader_running = false;
            (
                std::mem::take(&mut pending.symbols),
                std::mem::take(&mut pending.waiters),
                pending.deadline.take(),
            )
        };
        symbols.sort();
        symbols.dedup();
        let deadline = deadline.unwrap_or_else(|| Instant::now() + self.window);
        debug!("quote batch flush: {} symbols", symbols.len());
        let result = self
            .provider
            .get_quotes(symbols, deadline)
            .await
            .map(Arc::new);
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EnrichmentStats {
    pub cache_hits: usize,
    pub fetched: usize,
    pub interpolated: usize,
    pub missing: usize,
}

/// Merges quotes onto instruments, serving repeats from the shared quote
/// cache and (optionally) funneling misses through the micro-batcher. The
/// batched path is observationally equivalent to the direct one and falls
/// back to it on error.
pub struct Enricher {
    cache: Arc<QuoteCache>,
    provider: Arc<CompositeProvider>,
    batcher: Option<Arc<QuoteBatcher>>,
}

impl Enricher {
    pub fn new(
        cache: Arc<QuoteCache>,
        provider: Arc<CompositeProvider>,
        batcher: Option<Arc<QuoteBatcher>>,
    ) -> Self {
        Self {
            cache,
            provider,
            batcher,
        }
    }

    pub async fn enrich(
        &self,
        instruments: &[Instrument],
        spot: f64,
        deadline: Instant,
    ) -> Result<(Vec<EnrichedOption>, EnrichmentStats), ProviderError> {
        let symbols: Vec<String> = instruments.iter().map(|i| i.symbol.clone()).collect();
        let (mut quotes, misses) = self.cache.partition(&symbols);
        let mut stats = EnrichmentStats {
            cache_hits: quotes.len(),
            ..EnrichmentStats::default()
        };

        if !misses.is_empty() {
            let fetched = self.fetch_misses(misses, deadline).await?;
            stats.fetched = fetched.len();
            self.cache.insert_many(&fetched);
            quotes.extend(fetched);
        }

        let mut options: Vec<EnrichedOption> = instruments
            .iter()
            .filter_map(|inst| {
                quotes
                    .get(&inst.symbol)
                    .map(|q| EnrichedOption::from_parts(inst, q, spot))
            })
            .collect();

        let interpolated = interpolate_gaps(instruments, &mut options, spot);
        stats.interpolated = interpolated;
        stats.missing = instruments.len() - options.len();
        Ok((options, stats))
    }

    async fn fetch_misses(
        &self,
        misses: Vec<String>,
        deadline: Instant,
    ) -> Result<HashMap<String, Quote>, ProviderError> {
        if let Some(batcher) = &self.batcher {
            match batcher.fetch(misses.clone(), deadline).await {
                Ok(all) => {
                    // The batch may carry other pipelines' symbols; keep ours.
                    return Ok(misses
                        .iter()
                        .filter_map(|s| all.get(s).map(|q| (s.clone(), q.clone())))
                        .collect());
                }
                Err(err) if !err.is_rate_limited() => {
                    warn!("batched quote fetch failed ({}), falling back to direct", err);
                }
                Err(err) => return Err(err),
            }
        }
        self.provider.get_quotes(misses, deadline).await
    }
}

/// Fill single-strike holes between two quoted neighbors of the same type
/// with a midpoint row marked `interpolated`.
fn interpolate_gaps(
    instruments: &[Instrument],
    options: &mut Vec<EnrichedOption>,
    spot: f64,
) -> usize {
    let mut added = 0;
    for ty in [OptionType::CE, OptionType::PE] {
        let mut quoted: Vec<&EnrichedOption> = options
            .iter()
            .filter(|o| o.option_type == ty && !o.interpolated)
            .collect();
        quoted.sort_by(|a, b| a.strike.total_cmp(&b.strike));

        let mut synthesized = Vec::new();
        for inst in instruments.iter().filter(|i| i.option_type == ty) {
            if options.iter().any(|o| o.symbol == inst.symbol) {
                continue;
            }
            let below = quoted.iter().rev().find(|o| o.strike < inst.strike);
            let above = quoted.iter().find(|o| o.strike > inst.strike);
            if let (Some(lo), Some(hi)) = (below, above) {
                let mid = |a: f64, b: f64| (a + b) / 2.0;
                let quote = Quote {
                    last_price: mid(lo.last_price, hi.last_price),
                    volume: 0,
                    oi: 0,
                    bid: mid(lo.bid, hi.bid),
                    ask: mid(lo.ask, hi.ask),
                    avg_price: None,
                    iv: match (lo.iv, hi.iv) {
                        (Some(a), Some(b)) => Some(mid(a, b)),
                        _ => None,
                    },
                    ts: lo.quote_ts.max(hi.quote_ts),
                };
                let mut row = EnrichedOption::from_parts(inst, &quote, spot);
                row.interpolated = true;
                synthesized.push(row);
                added += 1;
            }
        }
        options.extend(synthesized);
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::provider::{MarketProvider, MockProvider, SimulatedProvider};

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 8, 7).unwrap()
    }

    fn composite(mock: Arc<MockProvider>) -> Arc<CompositeProvider> {
        Arc::new(CompositeProvider::new(
            ProviderConfig::default(),
            vec![("primary".to_string(), mock as Arc<dyn MarketProvider>)],
            None,
        ))
    }

    #[tokio::test]
    async fn enrich_merges_quotes_and_uses_cache() {
        let mock = Arc::new(MockProvider::new("primary", vec![expiry()]));
        let provider = composite(mock.clone());
        let cache = Arc::new(QuoteCache::new(Duration::from_secs(5)));
        let enricher = Enricher::new(cache.clone(), provider, None);

        let instruments: Vec<Instrument> = SimulatedProvider::new(vec![expiry()])
            .get_instruments("NIFTY")
            .await
            .unwrap()
            .into_iter()
            .take(10)
            .collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let (rows, stats) = enricher.enrich(&instruments, 24_000.0, deadline).await.unwrap();
        assert_eq!(rows.len(), 10);
        assert_eq!(stats.cache_hits, 0);
        assert_eq!(stats.fetched, 10);

        // Second pass inside the TTL hits the cache, no provider call.
        let calls_before = *mock.quote_calls.lock();
        let (rows2, stats2) = enricher.enrich(&instruments, 24_000.0, deadline).await.unwrap();
        assert_eq!(rows2.len(), 10);
        assert_eq!(stats2.cache_hits, 10);
        assert_eq!(*mock.quote_calls.lock(), calls_before);
    }

    #[tokio::test]
    async fn batcher_coalesces_concurrent_fetches() {
        let mock = Arc::new(MockProvider::new("primary", vec![expiry()]));
        let provider = composite(mock.clone());
        let batcher = Arc::new(QuoteBatcher::new(
            provider.clone(),
            Duration::from_millis(15),
        ));

        let instruments: Vec<Instrument> = SimulatedProvider::new(vec![expiry()])
            .get_instruments("NIFTY")
            .await
            .unwrap();
        let syms_a: Vec<String> = instruments.iter().take(3).map(|i| i.symbol.clone()).collect();
        let syms_b: Vec<String> = instruments.iter().skip(3).take(3).map(|i| i.symbol.clone()).collect();

        let deadline = Instant::now() + Duration::from_secs(5);
        let (ra, rb) = tokio::join!(
            batcher.fetch(syms_a.clone(), deadline),
            batcher.fetch(syms_b.clone(), deadline)
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(syms_a.iter().all(|s| ra.contains_key(s)));
        assert!(syms_b.iter().all(|s| rb.contains_key(s)));
        // Both callers were served by one upstream call.
        assert_eq!(*mock.quote_calls.lock(), 1);
    }

    #[test]
    fn delta_signs_match_option_type() {
        let ce = bs_delta(24_000.0, 23_000.0, 0.2, 0.05, OptionType::CE);
        let pe = bs_delta(24_000.0, 25_000.0, 0.2, 0.05, OptionType::PE);
        assert!(ce > 0.5 && ce <= 1.0);
        assert!(pe < -0.5 && pe >= -1.0);
    }

    #[test]
    fn norm_cdf_symmetry() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((norm_cdf(1.0) + norm_cdf(-1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn interpolation_fills_single_gaps() {
        let insts: Vec<Instrument> = [23_900.0, 23_950.0, 24_000.0]
            .iter()
            .map(|s| Instrument {
                symbol: format!("NIFTY{}CE", *s as i64),
                index: "NIFTY".to_string(),
                expiry_date: expiry(),
                strike: *s,
                option_type: OptionType::CE,
            })
            .collect();
        let quote = |price: f64| Quote {
            last_price: price,
            volume: 10,
            oi: 10,
            bid: price - 1.0,
            ask: price + 1.0,
            avg_price: Some(price),
            iv: Some(0.2),
            ts: Utc::now(),
        };
        let mut options = vec![
            EnrichedOption::from_parts(&insts[0], &quote(150.0), 24_000.0),
            EnrichedOption::from_parts(&insts[2], &quote(100.0), 24_000.0),
        ];
        let added = interpolate_gaps(&insts, &mut options, 24_000.0);
        assert_eq!(added, 1);
        let mid = options.iter().find(|o| o.interpolated).unwrap();
        assert_eq!(mid.strike, 23_950.0);
        assert!((mid.last_price - 125.0).abs() < 1e-9);
        assert_eq!(mid.volume, 0);
    }
}
