use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::HalfOpen => "half_open",
            Self::Open => "open",
        }
    }
}

/// Persisted form, one JSON file per provider under `state_dir`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCircuitState {
    pub provider: String,
    pub state: CircuitState,
    pub failures: u32,
    pub consecutive_opens: u32,
    pub last_failure_unix_ms: Option<u64>,
    pub next_attempt_after_unix_ms: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    consecutive_opens: u32,
    half_open_successes: u32,
    last_failure_unix_ms: Option<u64>,
    next_attempt_after_unix_ms: Option<u64>,
}

/// Per-provider circuit breaker. Open circuits short-circuit provider calls
/// until a jittered, exponentially growing backoff elapses; a half-open
/// probe window then decides between closing and re-opening.
pub struct CircuitBreaker {
    name: String,
    cfg: CircuitBreakerConfig,
    state_path: Option<PathBuf>,
    inner: Mutex<Inner>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl CircuitBreaker {
    pub fn new(name: &str, cfg: CircuitBreakerConfig, state_dir: Option<&Path>) -> Self {
        let state_path = state_dir.map(|d| d.join(format!("{name}_circuit.json")));
        let breaker = Self {
            name: name.to_string(),
            cfg,
            state_path,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                consecutive_opens: 0,
                half_open_successes: 0,
                last_failure_unix_ms: None,
                next_attempt_after_unix_ms: None,
            }),
        };
        breaker.load_persisted();
        breaker
    }

    /// Whether a provider call may proceed. An open circuit whose backoff
    /// has elapsed flips to half-open and admits the probe call.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = inner
                    .next_attempt_after_unix_ms
                    .map(|t| now_ms() >= t)
                    .unwrap_or(true);
                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!("🔁 circuit {} open -> half_open", self.name);
                    self.persist_locked(&inner);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.cfg.half_open_successes {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.consecutive_opens = 0;
                    inner.next_attempt_after_unix_ms = None;
                    info!("✅ circuit {} closed after probe successes", self.name);
                    self.persist_locked(&inner);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_unix_ms = Some(now_ms());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.cfg.failure_threshold {
                    self.open_locked(&mut inner);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during the probe re-opens with doubled backoff.
                self.open_locked(&mut inner);
            }
            CircuitState::Open => {}
        }
    }

    fn open_locked(&self, inner: &mut Inner) {
        let backoff_ms = self.backoff_ms(inner.consecutive_opens);
        inner.state = CircuitState::Open;
        inner.consecutive_opens += 1;
        inner.half_open_successes = 0;
        inner.next_attempt_after_unix_ms = Some(now_ms() + backoff_ms);
        warn!(
            "🚨 circuit {} OPEN after {} failures, retry in {}ms",
            self.name, inner.failures, backoff_ms
        );
        self.persist_locked(inner);
    }

    /// `min(max_reset, base * 2^k)` with symmetric jitter.
    fn backoff_ms(&self, consecutive_opens: u32) -> u64 {
        let exp = self
            .cfg
            .base_backoff_ms
            .saturating_mul(1u64 << consecutive_opens.min(20));
        let capped = exp.min(self.cfg.max_reset_ms) as f64;
        let jitter = capped * self.cfg.jitter_fraction * (fastrand::f64() * 2.0 - 1.0);
        (capped + jitter).max(0.0) as u64
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> PersistedCircuitState {
        let inner = self.inner.lock();
        PersistedCircuitState {
            provider: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            consecutive_opens: inner.consecutive_opens,
            last_failure_unix_ms: inner.last_failure_unix_ms,
            next_attempt_after_unix_ms: inner.next_attempt_after_unix_ms,
        }
    }

    fn persist_locked(&self, inner: &Inner) {
        let Some(path) = &self.state_path else {
            return;
        };
        let persisted = PersistedCircuitState {
            provider: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            consecutive_opens: inner.consecutive_opens,
            last_failure_unix_ms: inner.last_failure_unix_ms,
            next_attempt_after_unix_ms: inner.next_attempt_after_unix_ms,
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&persisted) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    error!("failed to persist circuit state for {}: {}", self.name, e);
                }
            }
            Err(e) => error!("failed to encode circuit state for {}: {}", self.name, e),
        }
    }

    fn load_persisted(&self) {
        let Some(path) = &self.state_path else {
            return;
        };
        let Ok(raw) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<PersistedCircuitState>(&raw) {
            Ok(saved) => {
                let mut inner = self.inner.lock();
                inner.state = saved.state;
                inner.failures = saved.failures;
                inner.consecutive_opens = saved.consecutive_opens;
                inner.last_failure_unix_ms = saved.last_failure_unix_ms;
                // Clamp: a stale future timestamp never extends past its
                // original horizon, and an elapsed one admits calls now.
                inner.next_attempt_after_unix_ms =
                    saved.next_attempt_after_unix_ms.map(|t| t.max(now_ms()).min(
                        now_ms() + self.cfg.max_reset_ms,
                    ));
                debug!(
                    "circuit {} restored from disk in state {}",
                    self.name,
                    inner.state.as_str()
                );
            }
            Err(e) => warn!("discarding unreadable circuit state {}: {}", self.name, e),
        }
    }
}
