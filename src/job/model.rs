use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A job's place in its lifecycle. Transitions are enforced by the registry,
/// not by this type — see `registry::JobRegistry` for the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Paused => "paused",
        }
    }
}

/// Structured error attached to a failed job, carrying just enough for the
/// activity feed and classifier to read without ever needing to know the
/// pipeline's own error types.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<JobError>>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Optional repository coordinates a scan/duplicate-detection job may carry.
/// The field is opaque to the core beyond being stored and echoed back —
/// interpreting it is the pipeline's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitContext {
    pub repository_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub pipeline_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_context: Option<GitContext>,
    /// Set when this job failed and a retry job was enqueued in its place;
    /// the retry id is authoritative from that point on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_as: Option<String>,
}

impl Job {
    pub fn new(job_id: String, pipeline_id: String, input: Value) -> Self {
        Job {
            job_id,
            pipeline_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            input,
            result: None,
            error: None,
            git_context: None,
            retried_as: None,
        }
    }
}

/// Bookkeeping for one retry family, keyed by the *original* job id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub original_id: String,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl RetryRecord {
    pub fn new(original_id: String, max_attempts: u32) -> Self {
        RetryRecord {
            original_id,
            attempts: 0,
            max_attempts,
        }
    }
}

/// Strips every trailing `-retryN` token so that retries of retries collapse
/// onto the same original id. A fixed point on an already-stripped id.
pub fn strip_retry_suffix(job_id: &str) -> String {
    let mut current = job_id;
    loop {
        match strip_one_retry_suffix(current) {
            Some(stripped) => current = stripped,
            None => return current.to_string(),
        }
    }
}

fn strip_one_retry_suffix(id: &str) -> Option<&str> {
    let idx = id.rfind("-retry")?;
    let (head, suffix) = id.split_at(idx);
    let digits = &suffix["-retry".len()..];
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(head)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_single_retry_suffix() {
        assert_eq!(strip_retry_suffix("job-1-retry1"), "job-1");
    }

    #[test]
    fn strips_chained_retry_suffixes() {
        assert_eq!(
            strip_retry_suffix("job-1-retry1-retry2-retry3"),
            "job-1"
        );
    }

    #[test]
    fn is_fixed_point_on_already_stripped_id() {
        let id = "job-1";
        assert_eq!(strip_retry_suffix(id), id);
        assert_eq!(strip_retry_suffix(&strip_retry_suffix(id)), id);
    }

    #[test]
    fn leaves_ids_without_retry_pattern_untouched() {
        assert_eq!(strip_retry_suffix("job-retrying-later"), "job-retrying-later");
        assert_eq!(strip_retry_suffix("job-retry"), "job-retry");
    }

    #[test]
    fn job_status_terminal_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }
}
