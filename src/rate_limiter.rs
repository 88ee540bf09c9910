use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use parking_lot::Mutex;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::provider::ProviderError;

/// Token-bucket guard in front of one upstream provider: sustained QPS with
/// a burst allowance, plus a cooldown that opens after a streak of
/// provider-signaled 429s and rejects immediately while it lasts.
pub struct ProviderRateLimiter {
    provider: String,
    limiter: Arc<
        RateLimiter<
            governor::state::NotKeyed,
            governor::state::InMemoryState,
            governor::clock::DefaultClock,
        >,
    >,
    cfg: RateLimitConfig,
    guard: Mutex<CooldownGuard>,
}

#[derive(Debug, Default)]
struct CooldownGuard {
    consecutive_429: u32,
    cooldown_until: Option<Instant>,
    acquired_total: u64,
    rejected_total: u64,
    cooldowns_opened: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimiterStats {
    pub consecutive_429: u32,
    pub cooldown_remaining: Option<Duration>,
    pub acquired_total: u64,
    pub rejected_total: u64,
    pub cooldowns_opened: u64,
}

impl ProviderRateLimiter {
    pub fn new(provider: &str, cfg: RateLimitConfig) -> Self {
        let qps = NonZeroU32::new(cfg.qps).unwrap_or(nonzero!(1u32));
        let burst = NonZeroU32::new(cfg.effective_burst()).unwrap_or(nonzero!(1u32));
        let quota = Quota::per_second(qps).allow_burst(burst);
        Self {
            provider: provider.to_string(),
            limiter: Arc::new(RateLimiter::direct(quota)),
            cfg,
            guard: Mutex::new(CooldownGuard::default()),
        }
    }

    /// Take one token, waiting no later than `deadline`. Returns
    /// `RateLimited` immediately while a 429 cooldown is open, or when the
    /// deadline expires before a token frees up.
    pub async fn acquire(&self, deadline: Instant) -> Result<(), ProviderError> {
        {
            let mut guard = self.guard.lock();
            if let Some(until) = guard.cooldown_until {
                if Instant::now() < until {
                    guard.rejected_total += 1;
                    return Err(ProviderError::RateLimited(format!(
                        "{} cooling down for {:?}",
                        self.provider,
                        until.saturating_duration_since(Instant::now())
                    )));
                }
                guard.cooldown_until = None;
                debug!("rate limiter cooldown cleared for {}", self.provider);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.guard.lock().rejected_total += 1;
            return Err(ProviderError::RateLimited(format!(
                "{} deadline exhausted before token grant",
                self.provider
            )));
        }

        match tokio::time::timeout(remaining, self.limiter.until_ready()).await {
            Ok(()) => {
                self.guard.lock().acquired_total += 1;
                Ok(())
            }
            Err(_) => {
                self.guard.lock().rejected_total += 1;
                Err(ProviderError::RateLimited(format!(
                    "{} token wait exceeded deadline",
                    self.provider
                )))
            }
        }
    }

    /// Record an upstream 429. The spent token is not refunded; a streak at
    /// or above the configured threshold opens the cooldown window.
    pub fn record_rate_limited(&self) {
        let mut guard = self.guard.lock();
        guard.consecutive_429 += 1;
        if guard.consecutive_429 >= self.cfg.consecutive_threshold {
            let cooldown = Duration::from_secs(self.cfg.cooldown_seconds);
            guard.cooldown_until = Some(Instant::now() + cooldown);
            guard.cooldowns_opened += 1;
            warn!(
                "🚦 {} hit {} consecutive 429s, cooling down {}s",
                self.provider, guard.consecutive_429, self.cfg.cooldown_seconds
            );
        }
    }

    pub fn record_success(&self) {
        self.guard.lock().consecutive_429 = 0;
    }

    pub fn in_cooldown(&self) -> bool {
        let guard = self.guard.lock();
        guard
            .cooldown_until
            .map(|t| Instant::now() < t)
            .unwrap_or(false)
    }

    pub fn stats(&self) -> RateLimiterStats {
        let guard = self.guard.lock();
        RateLimiterStats {
            consecutive_429: guard.consecutive_429,
            cooldown_remaining: guard
                .cooldown_until
                .map(|t| t.saturating_duration_since(Instant::now()))
                .filter(|d| !d.is_zero()),
            acquired_total: guard.acquired_total,
            rejected_total: guard.rejected_total,
            cooldowns_opened: guard.cooldowns_opened,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(qps: u32, burst: u32, threshold: u32, cooldown: u64) -> RateLimitConfig {
        RateLimitConfig {
            qps,
            max_burst: burst,
            consecutive_threshold: threshold,
            cooldown_seconds: cooldown,
        }
    }

    #[tokio::test]
    async fn burst_tokens_then_reject_at_deadline() {
        let rl = ProviderRateLimiter::new("kite", cfg(2, 4, 5, 20));
        let near = Instant::now() + Duration::from_millis(20);
        for _ in 0..4 {
            rl.acquire(near).await.expect("burst token");
        }
        // Bucket drained; the next token arrives in ~500ms, past the deadline.
        let res = rl.acquire(Instant::now() + Duration::from_millis(20)).await;
        assert!(matches!(res, Err(ProviderError::RateLimited(_))));
    }

    #[tokio::test]
    async fn consecutive_429s_open_cooldown() {
        let rl = ProviderRateLimiter::new("kite", cfg(50, 100, 2, 20));
        let deadline = Instant::now() + Duration::from_millis(50);
        rl.acquire(deadline).await.unwrap();
        rl.record_rate_limited();
        assert!(!rl.in_cooldown());
        rl.record_rate_limited();
        assert!(rl.in_cooldown());
        let res = rl.acquire(Instant::now() + Duration::from_secs(1)).await;
        assert!(matches!(res, Err(ProviderError::RateLimited(_))));
        assert_eq!(rl.stats().cooldowns_opened, 1);
    }

    #[tokio::test]
    async fn success_resets_streak() {
        let rl = ProviderRateLimiter::new("kite", cfg(50, 100, 3, 20));
        rl.record_rate_limited();
        rl.record_rate_limited();
        rl.record_success();
        rl.record_rate_limited();
        assert!(!rl.in_cooldown());
        assert_eq!(rl.stats().consecutive_429, 1);
    }
}
