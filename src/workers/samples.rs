//! Stand-in pipelines used to exercise the registry and retry engine in
//! tests and during local development. Neither implements real scan or
//! duplicate-detection business logic — the spec treats that as pluggable.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use crate::job::{Job, JobError};

use super::PipelineWorker;

/// Echoes its input back as the result. Always succeeds.
pub struct EchoWorker;

#[async_trait]
impl PipelineWorker for EchoWorker {
    fn pipeline_id(&self) -> &str {
        "echo"
    }

    async fn execute(&self, job: &Job, _cancel: watch::Receiver<bool>) -> Result<Value, JobError> {
        Ok(json!({ "echoed": job.input.clone() }))
    }
}

/// Fails with a retryable `ETIMEDOUT` on its first `fail_times` attempts
/// (as observed process-wide, not per job), then succeeds. Useful for
/// exercising the retry engine's happy-path-after-retries scenario.
pub struct FlakyWorker {
    attempts: AtomicU32,
    fail_times: u32,
}

impl FlakyWorker {
    pub fn new() -> Self {
        FlakyWorker {
            attempts: AtomicU32::new(0),
            fail_times: 2,
        }
    }
}

impl Default for FlakyWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineWorker for FlakyWorker {
    fn pipeline_id(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, job: &Job, _cancel: watch::Receiver<bool>) -> Result<Value, JobError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_times {
            return Err(JobError::new("connection reset by peer").with_code("ECONNRESET"));
        }
        Ok(json!({ "echoed": job.input.clone(), "attempt": attempt }))
    }
}

/// Always fails with the given code. Useful for exercising the retry
/// engine's circuit breaker (a retryable code, run to the absolute cap)
/// and its non-retryable terminal path (e.g. `ENOENT`).
pub struct AlwaysFailWorker {
    pipeline_id: String,
    code: String,
}

impl AlwaysFailWorker {
    pub fn new(pipeline_id: impl Into<String>, code: impl Into<String>) -> Self {
        AlwaysFailWorker {
            pipeline_id: pipeline_id.into(),
            code: code.into(),
        }
    }
}

#[async_trait]
impl PipelineWorker for AlwaysFailWorker {
    fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    async fn execute(&self, _job: &Job, _cancel: watch::Receiver<bool>) -> Result<Value, JobError> {
        Err(JobError::new("simulated failure").with_code(self.code.clone()))
    }
}
