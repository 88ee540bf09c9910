use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

use crate::config::IndexConfig;

/// Where a strike universe came from this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniverseSource {
    Fresh,
    Cache,
}

/// ATM-centered strike list for one (index, expiry) collection pass.
#[derive(Debug, Clone)]
pub struct StrikeUniverse {
    pub index: String,
    pub atm: f64,
    pub atm_bucket: i64,
    pub step: f64,
    /// Ascending; always contains `atm`.
    pub strikes: Vec<f64>,
    pub source: UniverseSource,
    pub cache_hit: bool,
}

impl StrikeUniverse {
    pub fn contains(&self, strike: f64) -> bool {
        let bucket = (strike / self.step).round() as i64;
        let lo = (self.strikes[0] / self.step).round() as i64;
        let hi = (self.strikes[self.strikes.len() - 1] / self.step).round() as i64;
        bucket >= lo && bucket <= hi
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    index: String,
    atm_bucket: i64,
    itm: u32,
    otm: u32,
}

#[derive(Debug, Clone, Default)]
pub struct StrikeCacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Builds strike universes and memoizes them by (index, atm bucket,
/// effective policy). ATM drifting within one step width reuses the cached
/// list; a new bucket recomputes.
pub struct StrikeUniverseCache {
    cache: Mutex<LruCache<CacheKey, Arc<Vec<f64>>>>,
    stats: Mutex<StrikeCacheStats>,
}

impl StrikeUniverseCache {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).expect("nonzero capacity");
        Self {
            cache: Mutex::new(LruCache::new(cap)),
            stats: Mutex::new(StrikeCacheStats::default()),
        }
    }

    /// Build (or fetch) the universe for `index` at `atm_price`, with the
    /// configured ITM/OTM depth scaled by `depth_scale` and floored at
    /// `depth_floor` strikes per side.
    pub fn build(
        &self,
        index: &IndexConfig,
        atm_price: f64,
        depth_scale: f64,
        depth_floor: u32,
    ) -> StrikeUniverse {
        let step = index.strike_step;
        let atm_bucket = (atm_price / step).round() as i64;
        let atm = atm_bucket as f64 * step;
        let itm = scaled_depth(index.strikes_itm, depth_scale, depth_floor);
        let otm = scaled_depth(index.strikes_otm, depth_scale, depth_floor);

        let key = CacheKey {
            index: index.symbol.clone(),
            atm_bucket,
            itm,
            otm,
        };

        if let Some(strikes) = self.cache.lock().get(&key).cloned() {
            self.stats.lock().hits += 1;
            return StrikeUniverse {
                index: index.symbol.clone(),
                atm,
                atm_bucket,
                step,
                strikes: strikes.as_ref().clone(),
                source: UniverseSource::Cache,
                cache_hit: true,
            };
        }

        let mut strikes = Vec::with_capacity((itm + 1 + otm) as usize);
        for k in -(itm as i64)..=(otm as i64) {
            let strike = (atm_bucket + k) as f64 * step;
            if strike > 0.0 {
                strikes.push(strike);
            }
        }
        debug!(
            "strike universe {} atm={} depth={}+1+{} ({} strikes)",
            index.symbol,
            atm,
            itm,
            otm,
            strikes.len()
        );
        self.cache.lock().put(key, Arc::new(strikes.clone()));
        self.stats.lock().misses += 1;

        StrikeUniverse {
            index: index.symbol.clone(),
            atm,
            atm_bucket,
            step,
            strikes,
            source: UniverseSource::Fresh,
            cache_hit: false,
        }
    }

    pub fn stats(&self) -> StrikeCacheStats {
        self.stats.lock().clone()
    }
}

fn scaled_depth(configured: u32, scale: f64, floor: u32) -> u32 {
    let scaled = (configured as f64 * scale).round() as u32;
    scaled.max(floor.min(configured)).min(configured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nifty() -> IndexConfig {
        IndexConfig::new("NIFTY", 50.0, 2, 2)
    }

    #[test]
    fn universe_has_itm_plus_one_plus_otm() {
        let cache = StrikeUniverseCache::new(16);
        let u = cache.build(&nifty(), 24_012.0, 1.0, 2);
        assert_eq!(u.strikes.len(), 5);
        assert_eq!(u.atm, 24_000.0);
        assert!(u.strikes.contains(&u.atm));
        assert_eq!(
            u.strikes,
            vec![23_900.0, 23_950.0, 24_000.0, 24_050.0, 24_100.0]
        );
    }

    #[test]
    fn same_bucket_hits_cache() {
        let cache = StrikeUniverseCache::new(16);
        let a = cache.build(&nifty(), 24_012.0, 1.0, 2);
        let b = cache.build(&nifty(), 24_018.0, 1.0, 2); // same bucket
        assert!(!a.cache_hit);
        assert!(b.cache_hit);
        assert_eq!(b.source, UniverseSource::Cache);
        assert_eq!(a.strikes, b.strikes);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[test]
    fn new_bucket_recomputes() {
        let cache = StrikeUniverseCache::new(16);
        cache.build(&nifty(), 24_000.0, 1.0, 2);
        let moved = cache.build(&nifty(), 24_060.0, 1.0, 2);
        assert!(!moved.cache_hit);
        assert_eq!(moved.atm, 24_050.0);
    }

    #[test]
    fn depth_scale_floors_per_side() {
        let mut idx = nifty();
        idx.strikes_itm = 10;
        idx.strikes_otm = 10;
        let cache = StrikeUniverseCache::new(16);
        let scaled = cache.build(&idx, 24_000.0, 0.5, 2);
        assert_eq!(scaled.strikes.len(), 11); // 5 + 1 + 5
        let floored = cache.build(&idx, 24_000.0, 0.01, 2);
        assert_eq!(floored.strikes.len(), 5); // floor of 2 per side
    }

    #[test]
    fn contains_uses_bucket_arithmetic() {
        let cache = StrikeUniverseCache::new(16);
        let u = cache.build(&nifty(), 24_000.0, 1.0, 2);
        assert!(u.contains(23_900.0));
        assert!(u.contains(24_100.0));
        assert!(!u.contains(24_150.0));
    }
}
