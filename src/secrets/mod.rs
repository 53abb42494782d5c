//! Resilience wrapper around an upstream secret-fetch call.
//!
//! The breaker state machine has no direct teacher counterpart; it is built
//! against the spec's transition table, grounded in the teacher's resilience
//! texture elsewhere (`llm/lmstudio.rs`'s `reqwest::Client` + `ApiError`
//! mapping for the upstream call shape, `context/worker.rs`'s
//! retry/backoff arithmetic for the exponential schedule).

mod cache;
mod http_fetcher;

pub use http_fetcher::HttpSecretFetcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::config::defaults::{
    BREAKER_BACKOFF_BASE_MS, BREAKER_BACKOFF_MAX_MS, BREAKER_FAILURE_THRESHOLD, BREAKER_SUCCESS_THRESHOLD,
    BREAKER_TIMEOUT_MS,
};

pub use cache::FallbackCache;

#[async_trait]
pub trait SecretFetcher: Send + Sync {
    async fn fetch_secrets(&self) -> Result<Value, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    successes_in_half_open: u32,
    current_backoff_ms: u64,
    next_attempt_time: Option<Instant>,
    last_error: Option<String>,
    total_calls: u64,
    total_successes: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            successes_in_half_open: 0,
            current_backoff_ms: BREAKER_BACKOFF_BASE_MS,
            next_attempt_time: None,
            last_error: None,
            total_calls: 0,
            total_successes: 0,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SecretHealth {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub last_error: Option<String>,
    pub using_fallback: bool,
    pub wait_time_ms: u64,
}

/// Wraps a [`SecretFetcher`] with a three-state circuit breaker and a
/// file-backed fallback cache for use while the breaker is open.
pub struct SecretResilience {
    fetcher: Arc<dyn SecretFetcher>,
    inner: Mutex<Inner>,
    cache: Mutex<FallbackCache>,
}

impl SecretResilience {
    pub fn new(fetcher: Arc<dyn SecretFetcher>, cache_path: PathBuf) -> Self {
        SecretResilience {
            fetcher,
            inner: Mutex::new(Inner::default()),
            cache: Mutex::new(FallbackCache::new(cache_path)),
        }
    }

    pub async fn get_secrets(&self) -> Value {
        let should_attempt = {
            let mut inner = self.inner.lock().await;
            inner.total_calls += 1;
            match inner.state {
                BreakerState::Closed => true,
                BreakerState::HalfOpen => true,
                BreakerState::Open => {
                    let ready = inner
                        .next_attempt_time
                        .map(|t| Instant::now() >= t)
                        .unwrap_or(false);
                    if ready {
                        inner.state = BreakerState::HalfOpen;
                        info!("secret breaker half-open, attempting upstream");
                        true
                    } else {
                        false
                    }
                }
            }
        };

        if !should_attempt {
            return self.serve_fallback().await;
        }

        match self.fetcher.fetch_secrets().await {
            Ok(secrets) => {
                self.on_success().await;
                self.cache.lock().await.store(&secrets);
                secrets
            }
            Err(err) => {
                self.on_failure(err).await;
                self.serve_fallback().await
            }
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.total_successes += 1;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.successes_in_half_open += 1;
                if inner.successes_in_half_open >= BREAKER_SUCCESS_THRESHOLD {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.current_backoff_ms = BREAKER_BACKOFF_BASE_MS;
                    inner.successes_in_half_open = 0;
                    info!("secret breaker closed after successful half-open probes");
                }
            }
            BreakerState::Closed => {
                inner.consecutive_failures = 0;
                inner.current_backoff_ms = BREAKER_BACKOFF_BASE_MS;
            }
            BreakerState::Open => {}
        }
    }

    async fn on_failure(&self, err: String) {
        let mut inner = self.inner.lock().await;
        inner.last_error = Some(err.clone());
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(error = %err, "secret breaker probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.successes_in_half_open = 0;
                inner.next_attempt_time = Some(Instant::now() + Duration::from_millis(BREAKER_TIMEOUT_MS));
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= BREAKER_FAILURE_THRESHOLD {
                    inner.state = BreakerState::Open;
                    let exp = inner.consecutive_failures.saturating_sub(1).min(20);
                    inner.current_backoff_ms =
                        (BREAKER_BACKOFF_BASE_MS.saturating_mul(1u64 << exp)).min(BREAKER_BACKOFF_MAX_MS);
                    inner.next_attempt_time = Some(Instant::now() + Duration::from_millis(BREAKER_TIMEOUT_MS));
                    warn!(error = %err, "secret breaker opened after consecutive failures");
                }
            }
            BreakerState::Open => {}
        }
    }

    async fn serve_fallback(&self) -> Value {
        self.cache.lock().await.load_or_reload()
    }

    pub async fn health(&self) -> SecretHealth {
        let inner = self.inner.lock().await;
        let success_rate = if inner.total_calls == 0 {
            1.0
        } else {
            inner.total_successes as f64 / inner.total_calls as f64
        };
        let wait_time_ms = match (inner.state, inner.next_attempt_time) {
            (BreakerState::Open, Some(t)) => t.saturating_duration_since(Instant::now()).as_millis() as u64,
            _ => 0,
        };
        SecretHealth {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            success_rate,
            last_error: inner.last_error.clone(),
            using_fallback: inner.state != BreakerState::Closed,
            wait_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FlakyFetcher {
        fail_next: AtomicU32,
    }

    #[async_trait]
    impl SecretFetcher for FlakyFetcher {
        async fn fetch_secrets(&self) -> Result<Value, String> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                Err("upstream unreachable".to_string())
            } else {
                Ok(serde_json::json!({"api_key": "live"}))
            }
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            fail_next: AtomicU32::new(10),
        });
        let breaker = SecretResilience::new(fetcher, dir.path().join("cache.json"));

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.get_secrets().await;
        }

        assert_eq!(breaker.health().await.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failure_count() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            fail_next: AtomicU32::new(1),
        });
        let breaker = SecretResilience::new(fetcher, dir.path().join("cache.json"));

        breaker.get_secrets().await; // fails once
        breaker.get_secrets().await; // succeeds

        let health = breaker.health().await;
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn open_breaker_serves_fallback_without_calling_upstream() {
        let dir = tempdir().unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            fail_next: AtomicU32::new(100),
        });
        let breaker = SecretResilience::new(Arc::clone(&fetcher) as Arc<dyn SecretFetcher>, dir.path().join("cache.json"));

        for _ in 0..BREAKER_FAILURE_THRESHOLD {
            breaker.get_secrets().await;
        }
        let calls_before = fetcher.fail_next.load(Ordering::SeqCst);
        let _ = breaker.get_secrets().await;
        assert_eq!(fetcher.fail_next.load(Ordering::SeqCst), calls_before);
    }
}
