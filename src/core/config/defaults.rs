use serde_json::{json, Value};

/// Tunables referenced throughout the core. Centralised here rather than
/// scattered as magic numbers, since several of them (`ABSOLUTE_RETRY_CAP`,
/// `MAX_PERSIST_FAILURES`) are invariants other modules must agree on.
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 5;
pub const DEFAULT_MAX_QUEUE_PER_PIPELINE: usize = 1_000;
pub const ABSOLUTE_RETRY_CAP: u32 = 5;
pub const DEFAULT_MAX_ACTIVITIES: usize = 50;
pub const MAX_PERSIST_FAILURES: u32 = 5;
pub const MAX_RECOVERY_ATTEMPTS: u32 = 10;
pub const RECOVERY_BACKOFF_BASE_MS: u64 = 1_000;
pub const RECOVERY_BACKOFF_MAX_MS: u64 = 60_000;
pub const MAX_WORKER_INITS: usize = 3;
pub const REPORT_MAX_AGE_DAYS: u64 = 30;

pub const BREAKER_FAILURE_THRESHOLD: u32 = 3;
pub const BREAKER_SUCCESS_THRESHOLD: u32 = 2;
pub const BREAKER_TIMEOUT_MS: u64 = 60_000;
pub const BREAKER_BACKOFF_BASE_MS: u64 = 1_000;
pub const BREAKER_BACKOFF_MAX_MS: u64 = 60_000;
pub const FALLBACK_CACHE_STALE_SECS: u64 = 300;

/// Seed document written the first time the orchestrator runs without a
/// config file on disk, mirroring the way `generate_default_characters`
/// seeded the chat app's `config.yml` on first boot.
pub fn generate_default_config() -> Value {
    json!({
        "server": {
            "host": "127.0.0.1",
            "port": 4100,
            "cors_allowed_origins": ["http://localhost:5173", "http://127.0.0.1:5173"],
        },
        "scheduling": {
            "default_max_concurrent_jobs": DEFAULT_MAX_CONCURRENT_JOBS,
            "default_max_retries": 3,
        },
        "activity_feed": {
            "max_activities": DEFAULT_MAX_ACTIVITIES,
        },
        "reports": {
            "max_age_days": REPORT_MAX_AGE_DAYS,
        },
        "secrets": {
            "failure_threshold": BREAKER_FAILURE_THRESHOLD,
            "success_threshold": BREAKER_SUCCESS_THRESHOLD,
            "timeout_ms": BREAKER_TIMEOUT_MS,
        },
    })
}
