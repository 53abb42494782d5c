//! Durable job record store with an in-memory fast path.
//!
//! Grounded on the teacher's `history/mod.rs` sqlx-backed store: a
//! `SqlitePool`, `CREATE TABLE IF NOT EXISTS` migrations run on `new`, and
//! plain `sqlx::query` calls bound by position. The degraded-mode state
//! machine (write queue, exponential backoff, eventual `down`) has no
//! teacher counterpart and is built fresh against the spec's transition
//! table, reusing the breaker-style backoff shape from `secrets`.

mod queue;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{error, warn};

use crate::core::config::defaults::{MAX_PERSIST_FAILURES, MAX_RECOVERY_ATTEMPTS, RECOVERY_BACKOFF_BASE_MS, RECOVERY_BACKOFF_MAX_MS};
use crate::core::errors::ApiError;
use crate::job::{Job, JobStatus, RetryRecord};

pub use queue::WriteQueue;

/// Parses an opaque JSON column, returning `null` on any malformed input
/// rather than failing the read.
pub fn safe_json_parse(raw: Option<&str>) -> Value {
    match raw {
        Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
            warn!(error = %e, "discarding unparsable json column");
            Value::Null
        }),
        None => Value::Null,
    }
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PersistenceHealth {
    pub status: HealthStatus,
    pub message: String,
    pub degraded_mode: bool,
    pub persist_failure_count: u32,
    pub recovery_attempts: u32,
    pub queued_writes: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct JobCounts {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub paused: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineStats {
    pub pipeline_id: String,
    pub counts: JobCounts,
}

#[derive(Debug, Default)]
struct PersistenceState {
    degraded_mode: bool,
    persist_failure_count: u32,
    recovery_attempts: u32,
    down: bool,
}

/// The sole writer to durable storage. Reads prefer the in-memory cache so a
/// degraded or down database never blocks a caller.
pub struct PersistenceStore {
    pool: SqlitePool,
    db_path: PathBuf,
    state: Mutex<PersistenceState>,
    queue: Mutex<WriteQueue>,
    jobs: Mutex<HashMap<String, Job>>,
    retry_records: Mutex<HashMap<String, RetryRecord>>,
    /// Remaining number of durable writes to fail before reverting to
    /// normal behaviour. Exists so the degraded-mode state machine can be
    /// exercised without a real disk/database fault.
    inject_failures: AtomicUsize,
}

impl PersistenceStore {
    pub async fn new(db_path: PathBuf) -> Result<Arc<Self>, ApiError> {
        let conn_str = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&conn_str)
            .await
            .map_err(|e| ApiError::internal(format!("failed to connect to job store: {}", e)))?;

        let store = Arc::new(PersistenceStore {
            pool,
            db_path,
            state: Mutex::new(PersistenceState::default()),
            queue: Mutex::new(WriteQueue::new()),
            jobs: Mutex::new(HashMap::new()),
            retry_records: Mutex::new(HashMap::new()),
            inject_failures: AtomicUsize::new(0),
        });
        store.init().await?;
        store.hydrate_retry_records().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Forces the next `n` durable writes to fail, so the degraded-mode
    /// transition and recovery can be exercised deterministically in tests.
    #[cfg(test)]
    pub fn inject_write_failures(&self, n: usize) {
        self.inject_failures.store(n, AtomicOrdering::SeqCst);
    }

    pub async fn init(&self) -> Result<(), ApiError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                pipeline_id TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                input TEXT,
                result TEXT,
                error TEXT,
                git_context TEXT,
                retried_as TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::internal(format!("failed to init jobs table: {}", e)))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_pipeline ON jobs(pipeline_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| ApiError::internal(format!("failed to create index: {}", e)))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS retry_records (
                original_id TEXT PRIMARY KEY,
                attempts INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ApiError::internal(format!("failed to init retry_records table: {}", e)))?;

        Ok(())
    }

    /// Loads every durable retry record into the in-memory map so a restart
    /// doesn't forget how many attempts a retry family already used.
    async fn hydrate_retry_records(&self) -> Result<(), ApiError> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT original_id, attempts, max_attempts FROM retry_records",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        let mut records = self.retry_records.lock().await;
        for (original_id, attempts, max_attempts) in rows {
            records.insert(
                original_id.clone(),
                RetryRecord {
                    original_id,
                    attempts: attempts.max(0) as u32,
                    max_attempts: max_attempts.max(0) as u32,
                },
            );
        }
        Ok(())
    }

    /// Upserts `job` durably; on failure, falls through to the degraded-mode
    /// write queue and never propagates the failure to the caller.
    pub async fn save_job(&self, job: &Job) {
        self.jobs
            .lock()
            .await
            .insert(job.job_id.clone(), job.clone());

        match self.write_job(job).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if state.degraded_mode {
                    state.persist_failure_count = 0;
                }
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "durable write failed");
                self.queue.lock().await.enqueue(format!("job:{}", job.job_id));
                self.on_write_failure().await;
            }
        }
    }

    /// Returns the current retry bookkeeping for `original_id`, creating it
    /// with zero attempts if this is the first time the id is seen.
    pub async fn ensure_retry_record(&self, original_id: &str, max_attempts: u32) -> RetryRecord {
        let record = {
            let mut records = self.retry_records.lock().await;
            records
                .entry(original_id.to_string())
                .or_insert_with(|| RetryRecord::new(original_id.to_string(), max_attempts))
                .clone()
        };
        self.persist_retry_record(&record).await;
        record
    }

    pub async fn get_retry_record(&self, original_id: &str) -> Option<RetryRecord> {
        self.retry_records.lock().await.get(original_id).cloned()
    }

    /// Atomically increments `original_id`'s attempt count and persists the
    /// result, so two concurrent failures of the same retry family can never
    /// under-count each other.
    pub async fn increment_retry_attempts(&self, original_id: &str, default_max_attempts: u32) -> RetryRecord {
        let record = {
            let mut records = self.retry_records.lock().await;
            let record = records
                .entry(original_id.to_string())
                .or_insert_with(|| RetryRecord::new(original_id.to_string(), default_max_attempts));
            record.attempts += 1;
            record.clone()
        };
        self.persist_retry_record(&record).await;
        record
    }

    async fn persist_retry_record(&self, record: &RetryRecord) {
        match self.write_retry_record(record).await {
            Ok(()) => {
                let mut state = self.state.lock().await;
                if state.degraded_mode {
                    state.persist_failure_count = 0;
                }
            }
            Err(e) => {
                warn!(original_id = %record.original_id, error = %e, "durable retry-record write failed");
                self.queue.lock().await.enqueue(format!("retry:{}", record.original_id));
                self.on_write_failure().await;
            }
        }
    }

    /// Returns an error (and consumes one pending injected failure, if any)
    /// without performing any I/O. Shared by every durable write path so
    /// tests can force either jobs or retry records to fail to persist.
    fn should_inject_failure(&self) -> bool {
        self.inject_failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                if n > 0 {
                    Some(n - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    async fn write_retry_record(&self, record: &RetryRecord) -> Result<(), ApiError> {
        if self.should_inject_failure() {
            return Err(ApiError::internal("injected durable-write failure"));
        }

        sqlx::query(
            "INSERT INTO retry_records (original_id, attempts, max_attempts)
             VALUES (?, ?, ?)
             ON CONFLICT(original_id) DO UPDATE SET
                attempts = excluded.attempts,
                max_attempts = excluded.max_attempts",
        )
        .bind(&record.original_id)
        .bind(record.attempts as i64)
        .bind(record.max_attempts as i64)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    async fn write_job(&self, job: &Job) -> Result<(), ApiError> {
        if self.should_inject_failure() {
            return Err(ApiError::internal("injected durable-write failure"));
        }

        let input = serde_json::to_string(&job.input).unwrap_or_else(|_| "null".to_string());
        let result = job
            .result
            .as_ref()
            .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()));
        let error = job
            .error
            .as_ref()
            .map(|e| serde_json::to_string(e).unwrap_or_else(|_| "null".to_string()));
        let git_context = job
            .git_context
            .as_ref()
            .map(|g| serde_json::to_string(g).unwrap_or_else(|_| "null".to_string()));

        sqlx::query(
            "INSERT INTO jobs (job_id, pipeline_id, status, created_at, started_at, completed_at, input, result, error, git_context, retried_as)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                started_at = excluded.started_at,
                completed_at = excluded.completed_at,
                result = excluded.result,
                error = excluded.error,
                retried_as = excluded.retried_as",
        )
        .bind(&job.job_id)
        .bind(&job.pipeline_id)
        .bind(job.status.as_str())
        .bind(job.created_at.to_rfc3339())
        .bind(job.started_at.map(|t| t.to_rfc3339()))
        .bind(job.completed_at.map(|t| t.to_rfc3339()))
        .bind(input)
        .bind(result)
        .bind(error)
        .bind(git_context)
        .bind(&job.retried_as)
        .execute(&self.pool)
        .await
        .map_err(ApiError::internal)?;

        Ok(())
    }

    async fn on_write_failure(&self) {
        let mut state = self.state.lock().await;
        if state.down {
            return;
        }
        state.persist_failure_count += 1;
        if !state.degraded_mode && state.persist_failure_count >= MAX_PERSIST_FAILURES {
            state.degraded_mode = true;
            warn!("persistence store entering degraded mode");
            drop(state);
            self.schedule_recovery();
        }
    }

    fn schedule_recovery(self: &Arc<Self>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                let backoff = (RECOVERY_BACKOFF_BASE_MS.saturating_mul(1u64 << (attempt - 1).min(20)))
                    .min(RECOVERY_BACKOFF_MAX_MS);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;

                {
                    let mut state = store.state.lock().await;
                    state.recovery_attempts = attempt;
                }

                if store.drain_queue().await {
                    let mut state = store.state.lock().await;
                    state.degraded_mode = false;
                    state.persist_failure_count = 0;
                    state.recovery_attempts = 0;
                    return;
                }

                if attempt >= MAX_RECOVERY_ATTEMPTS {
                    let mut state = store.state.lock().await;
                    state.down = true;
                    error!("persistence store giving up recovery, now down");
                    return;
                }
            }
        });
    }

    /// Drains the write queue in insertion order; on the first failure
    /// re-enqueues that record and aborts the rest of the drain. Entries are
    /// prefixed by kind (`job:` / `retry:`) since both jobs and retry
    /// records share one degraded-mode queue.
    async fn drain_queue(&self) -> bool {
        let pending = self.queue.lock().await.drain_order();
        if pending.is_empty() {
            return true;
        }

        for key in pending {
            if let Some(job_id) = key.strip_prefix("job:") {
                let job = self.jobs.lock().await.get(job_id).cloned();
                let Some(job) = job else {
                    continue;
                };
                if let Err(e) = self.write_job(&job).await {
                    warn!(job_id = %job_id, error = %e, "recovery write failed, restoring to queue");
                    self.queue.lock().await.enqueue(key);
                    return false;
                }
            } else if let Some(original_id) = key.strip_prefix("retry:") {
                let record = self.retry_records.lock().await.get(original_id).cloned();
                let Some(record) = record else {
                    continue;
                };
                if let Err(e) = self.write_retry_record(&record).await {
                    warn!(original_id = %original_id, error = %e, "recovery write failed, restoring to queue");
                    self.queue.lock().await.enqueue(key);
                    return false;
                }
            }
        }
        true
    }

    pub async fn get_job(&self, job_id: &str) -> Option<Job> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    pub async fn get_jobs(
        &self,
        pipeline_id: &str,
        status: Option<JobStatus>,
        limit: usize,
        offset: usize,
    ) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut matched: Vec<&Job> = jobs
            .values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_all_jobs(&self, status: Option<JobStatus>, limit: usize, offset: usize) -> Vec<Job> {
        let jobs = self.jobs.lock().await;
        let mut matched: Vec<&Job> = jobs
            .values()
            .filter(|j| status.map(|s| j.status == s).unwrap_or(true))
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn get_last_job(&self, pipeline_id: &str) -> Option<Job> {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .filter(|j| j.pipeline_id == pipeline_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at))
            .cloned()
    }

    pub async fn get_job_counts(&self, pipeline_id: &str) -> JobCounts {
        let jobs = self.jobs.lock().await;
        count_statuses(jobs.values().filter(|j| j.pipeline_id == pipeline_id))
    }

    pub async fn get_all_pipeline_stats(&self) -> Vec<PipelineStats> {
        let jobs = self.jobs.lock().await;
        let mut by_pipeline: HashMap<String, Vec<&Job>> = HashMap::new();
        for job in jobs.values() {
            by_pipeline.entry(job.pipeline_id.clone()).or_default().push(job);
        }
        let mut stats: Vec<PipelineStats> = by_pipeline
            .into_iter()
            .map(|(pipeline_id, jobs)| PipelineStats {
                pipeline_id,
                counts: count_statuses(jobs.into_iter()),
            })
            .collect();
        stats.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        stats
    }

    /// Bulk-loads historical report summaries named `*-summary.json` into
    /// the store, keyed by `job_id`. Idempotent: a record already present
    /// (by `job_id`) is left alone rather than re-imported.
    pub async fn import_reports(&self, dir: &Path) -> Result<usize, ApiError> {
        self.import_by_suffix(dir, "-summary.json").await
    }

    /// Bulk-loads historical per-job logs named `<prefix>-<id>.json`.
    pub async fn import_logs(&self, dir: &Path) -> Result<usize, ApiError> {
        self.import_by_suffix(dir, ".json").await
    }

    async fn import_by_suffix(&self, dir: &Path, suffix: &str) -> Result<usize, ApiError> {
        if !dir.exists() {
            return Ok(0);
        }
        let mut entries = tokio::fs::read_dir(dir).await.map_err(ApiError::internal)?;
        let mut imported = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(ApiError::internal)? {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !name.ends_with(suffix) {
                continue;
            }
            let raw = match tokio::fs::read_to_string(&path).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable artifact");
                    continue;
                }
            };
            let parsed = safe_json_parse(Some(&raw));
            let Some(job_id) = parsed.get("job_id").and_then(|v| v.as_str()).map(str::to_string) else {
                warn!(path = %path.display(), "skipping artifact with no job_id");
                continue;
            };
            if self.jobs.lock().await.contains_key(&job_id) {
                continue;
            }

            let job = job_from_imported_artifact(job_id, &parsed);
            self.save_job(&job).await;
            imported += 1;
        }
        Ok(imported)
    }

    pub async fn health(&self) -> PersistenceHealth {
        let state = self.state.lock().await;
        let queued = self.queue.lock().await.len();
        let (status, message) = if state.down {
            (HealthStatus::Down, "persistence store is down after exhausting recovery attempts".to_string())
        } else if state.degraded_mode {
            (HealthStatus::Degraded, format!("degraded mode, {} writes queued", queued))
        } else {
            (HealthStatus::Healthy, "ok".to_string())
        };
        PersistenceHealth {
            status,
            message,
            degraded_mode: state.degraded_mode,
            persist_failure_count: state.persist_failure_count,
            recovery_attempts: state.recovery_attempts,
            queued_writes: queued,
        }
    }

    /// Idempotent; attempts one final flush of queued writes even while
    /// degraded before closing the pool.
    pub async fn close(&self) {
        let _ = self.drain_queue().await;
        self.pool.close().await;
    }
}

/// Reconstructs a [`Job`] from a historical report/log artifact. Fields the
/// artifact doesn't carry fall back to sensible defaults for an already-
/// finished import (status `completed`, `created_at` now) rather than
/// failing the import outright — the artifact's own JSON is kept verbatim
/// as the job's `result` either way.
fn job_from_imported_artifact(job_id: String, parsed: &Value) -> Job {
    let pipeline_id = parsed
        .get("pipeline_id")
        .and_then(Value::as_str)
        .unwrap_or("imported")
        .to_string();
    let status = parsed
        .get("status")
        .cloned()
        .and_then(|v| serde_json::from_value::<JobStatus>(v).ok())
        .unwrap_or(JobStatus::Completed);
    let created_at = parsed
        .get("created_at")
        .and_then(Value::as_str)
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(chrono::Utc::now);

    let mut job = Job::new(job_id, pipeline_id, Value::Null);
    job.status = status;
    job.created_at = created_at;
    job.completed_at = Some(created_at);
    job.result = Some(parsed.clone());
    job
}

fn count_statuses<'a>(jobs: impl Iterator<Item = &'a Job>) -> JobCounts {
    let mut counts = JobCounts {
        queued: 0,
        running: 0,
        completed: 0,
        failed: 0,
        cancelled: 0,
        paused: 0,
    };
    for job in jobs {
        match job.status {
            JobStatus::Queued => counts.queued += 1,
            JobStatus::Running => counts.running += 1,
            JobStatus::Completed => counts.completed += 1,
            JobStatus::Failed => counts.failed += 1,
            JobStatus::Cancelled => counts.cancelled += 1,
            JobStatus::Paused => counts.paused += 1,
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::defaults::{MAX_PERSIST_FAILURES, RECOVERY_BACKOFF_MAX_MS};
    use crate::job::Job;
    use serde_json::json;
    use tempfile::tempdir;

    /// Advances the paused test clock past every recovery attempt's backoff,
    /// yielding between steps so the spawned recovery task gets scheduled.
    async fn advance_through_recovery_attempts(n: u32) {
        for _ in 0..n {
            tokio::time::advance(std::time::Duration::from_millis(RECOVERY_BACKOFF_MAX_MS)).await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fourth_failure_stays_healthy_fifth_enters_degraded() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();

        store.inject_write_failures((MAX_PERSIST_FAILURES - 1) as usize);
        for i in 0..MAX_PERSIST_FAILURES - 1 {
            let job = Job::new(format!("j{}", i), "demo".to_string(), json!({}));
            store.save_job(&job).await;
        }
        assert!(matches!(store.health().await.status, HealthStatus::Healthy));

        store.inject_write_failures(1);
        let job = Job::new("j-trip".to_string(), "demo".to_string(), json!({}));
        store.save_job(&job).await;
        let health = store.health().await;
        assert!(matches!(health.status, HealthStatus::Degraded));
        assert!(health.queued_writes > 0);

        // the in-memory read path is unaffected by degraded mode
        let read_back = store.get_job("j-trip").await.unwrap();
        assert_eq!(read_back.job_id, "j-trip");
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_store_recovers_and_drains_the_write_queue() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();

        // trip into degraded mode, then let the next recovery attempt's
        // write through (no more injected failures queued after this).
        store.inject_write_failures(MAX_PERSIST_FAILURES as usize);
        for i in 0..MAX_PERSIST_FAILURES {
            let job = Job::new(format!("k{}", i), "demo".to_string(), json!({}));
            store.save_job(&job).await;
        }
        assert!(matches!(store.health().await.status, HealthStatus::Degraded));
        assert!(store.health().await.queued_writes > 0);

        tokio::task::yield_now().await;
        advance_through_recovery_attempts(1).await;

        let health = store.health().await;
        assert!(matches!(health.status, HealthStatus::Healthy));
        assert_eq!(health.queued_writes, 0);
        assert_eq!(health.persist_failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_recovery_attempts_marks_the_store_down() {
        use crate::core::config::defaults::MAX_RECOVERY_ATTEMPTS;

        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();

        // keep every write failing so recovery can never drain the queue.
        store.inject_write_failures(usize::MAX / 2);
        let job = Job::new("always-fails".to_string(), "demo".to_string(), json!({}));
        for _ in 0..MAX_PERSIST_FAILURES {
            store.save_job(&job).await;
        }
        assert!(matches!(store.health().await.status, HealthStatus::Degraded));

        tokio::task::yield_now().await;
        advance_through_recovery_attempts(MAX_RECOVERY_ATTEMPTS + 1).await;

        let health = store.health().await;
        assert!(matches!(health.status, HealthStatus::Down));
        assert!(health.queued_writes > 0);
    }

    #[tokio::test]
    async fn save_job_twice_collapses_to_latest_write() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();

        let mut job = Job::new("dup".to_string(), "demo".to_string(), json!({"n": 1}));
        store.save_job(&job).await;
        job.status = JobStatus::Completed;
        job.result = Some(json!({"n": 2}));
        store.save_job(&job).await;

        let last = store.get_last_job("demo").await.unwrap();
        assert_eq!(last.job_id, "dup");
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.result.unwrap()["n"], 2);
    }

    #[test]
    fn safe_json_parse_returns_null_on_malformed_input() {
        assert_eq!(safe_json_parse(Some("not json")), Value::Null);
        assert_eq!(safe_json_parse(None), Value::Null);
        assert_eq!(safe_json_parse(Some("{\"a\":1}")), json!({"a": 1}));
    }

    #[tokio::test]
    async fn import_reports_loads_historical_artifacts_into_the_store() {
        let db_dir = tempdir().unwrap();
        let store = PersistenceStore::new(db_dir.path().join("jobs.sqlite")).await.unwrap();

        let reports_dir = tempdir().unwrap();
        tokio::fs::write(
            reports_dir.path().join("repository-scan-abc123-summary.json"),
            json!({
                "job_id": "abc123",
                "pipeline_id": "repository-scan",
                "status": "completed",
                "created_at": "2026-01-01T00:00:00Z",
                "finding_count": 3,
            })
            .to_string(),
        )
        .await
        .unwrap();
        // not a `-summary.json` file; must be skipped by `import_reports`.
        tokio::fs::write(reports_dir.path().join("notes.txt"), "irrelevant")
            .await
            .unwrap();

        let imported = store.import_reports(reports_dir.path()).await.unwrap();
        assert_eq!(imported, 1);

        let job = store.get_job("abc123").await.unwrap();
        assert_eq!(job.pipeline_id, "repository-scan");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.as_ref().unwrap()["finding_count"], 3);

        let last = store.get_last_job("repository-scan").await.unwrap();
        assert_eq!(last.job_id, "abc123");

        // re-importing the same directory is a no-op: the record is
        // already present, so the count reflects nothing *newly* imported.
        let reimported = store.import_reports(reports_dir.path()).await.unwrap();
        assert_eq!(reimported, 0);
    }

    #[tokio::test]
    async fn import_reports_skips_artifacts_without_a_job_id() {
        let db_dir = tempdir().unwrap();
        let store = PersistenceStore::new(db_dir.path().join("jobs.sqlite")).await.unwrap();

        let reports_dir = tempdir().unwrap();
        tokio::fs::write(
            reports_dir.path().join("orphan-summary.json"),
            json!({ "finding_count": 1 }).to_string(),
        )
        .await
        .unwrap();

        let imported = store.import_reports(reports_dir.path()).await.unwrap();
        assert_eq!(imported, 0);
    }

    #[tokio::test]
    async fn retry_record_attempts_survive_a_store_restart() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("jobs.sqlite");
        let store = PersistenceStore::new(db_path.clone()).await.unwrap();

        store.increment_retry_attempts("job-1", 5).await;
        let record = store.increment_retry_attempts("job-1", 5).await;
        assert_eq!(record.attempts, 2);
        assert_eq!(record.max_attempts, 5);
        store.close().await;

        let reopened = PersistenceStore::new(db_path).await.unwrap();
        let record = reopened.get_retry_record("job-1").await.unwrap();
        assert_eq!(record.attempts, 2);
        assert_eq!(record.max_attempts, 5);
    }

    #[tokio::test]
    async fn ensure_retry_record_does_not_bump_an_existing_attempt_count() {
        let dir = tempdir().unwrap();
        let store = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();

        store.increment_retry_attempts("job-2", 3).await;
        let record = store.ensure_retry_record("job-2", 3).await;
        assert_eq!(record.attempts, 1);
    }
}
