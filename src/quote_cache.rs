use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::provider::Quote;

/// Short-TTL per-symbol quote cache shared across every index pipeline in
/// the process. Collapses duplicate quote requests within a cycle.
pub struct QuoteCache {
    entries: RwLock<HashMap<String, CachedQuote>>,
    ttl: Duration,
    stats: RwLock<QuoteCacheStats>,
}

#[derive(Debug, Clone)]
struct CachedQuote {
    quote: Quote,
    fetched_at: Instant,
}

#[derive(Debug, Clone, Default)]
pub struct QuoteCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

impl QuoteCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            stats: RwLock::new(QuoteCacheStats::default()),
        }
    }

    /// Partition `symbols` into cache hits (fresh within TTL) and misses.
    pub fn partition(&self, symbols: &[String]) -> (HashMap<String, Quote>, Vec<String>) {
        let now = Instant::now();
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        {
            let entries = self.entries.read();
            for sym in symbols {
                match entries.get(sym) {
                    Some(entry) if now.duration_since(entry.fetched_at) < self.ttl => {
                        hits.insert(sym.clone(), entry.quote.clone());
                    }
                    _ => misses.push(sym.clone()),
                }
            }
        }
        let mut stats = self.stats.write();
        stats.hits += hits.len() as u64;
        stats.misses += misses.len() as u64;
        if !symbols.is_empty() {
            debug!(
                "quote cache: {} hits / {} misses of {}",
                hits.len(),
                misses.len(),
                symbols.len()
            );
        }
        (hits, misses)
    }

    pub fn insert_many(&self, quotes: &HashMap<String, Quote>) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        for (sym, quote) in quotes {
            entries.insert(
                sym.clone(),
                CachedQuote {
                    quote: quote.clone(),
                    fetched_at: now,
                },
            );
        }
        self.stats.write().inserts += quotes.len() as u64;
    }

    /// Drop entries past TTL. Called opportunistically at cycle end.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| now.duration_since(e.fetched_at) < self.ttl);
        let evicted = before - entries.len();
        if evicted > 0 {
            self.stats.write().evictions += evicted as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> QuoteCacheStats {
        self.stats.read().clone()
    }

    pub fn hit_ratio(&self) -> f64 {
        let stats = self.stats.read();
        let total = stats.hits + stats.misses;
        if total == 0 {
            0.0
        } else {
            stats.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quote(price: f64) -> Quote {
        Quote {
            last_price: price,
            volume: 10,
            oi: 20,
            bid: price - 0.5,
            ask: price + 0.5,
            avg_price: Some(price),
            iv: None,
            ts: Utc::now(),
        }
    }

    #[test]
    fn hit_within_ttl_then_expire() {
        let cache = QuoteCache::new(Duration::from_millis(40));
        let mut quotes = HashMap::new();
        quotes.insert("NIFTY_A".to_string(), quote(100.0));
        cache.insert_many(&quotes);

        let syms = vec!["NIFTY_A".to_string(), "NIFTY_B".to_string()];
        let (hits, misses) = cache.partition(&syms);
        assert_eq!(hits.len(), 1);
        assert_eq!(misses, vec!["NIFTY_B".to_string()]);

        std::thread::sleep(Duration::from_millis(60));
        let (hits, misses) = cache.partition(&syms);
        assert!(hits.is_empty());
        assert_eq!(misses.len(), 2);
    }

    #[test]
    fn sweep_evicts_expired() {
        let cache = QuoteCache::new(Duration::from_millis(10));
        let mut quotes = HashMap::new();
        quotes.insert("X".to_string(), quote(1.0));
        cache.insert_many(&quotes);
        std::thread::sleep(Duration::from_millis(20));
        cache.sweep();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn hit_ratio_tracks() {
        let cache = QuoteCache::new(Duration::from_secs(1));
        let mut quotes = HashMap::new();
        quotes.insert("X".to_string(), quote(1.0));
        cache.insert_many(&quotes);
        let (_h, _m) = cache.partition(&["X".to_string(), "Y".to_string()]);
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
