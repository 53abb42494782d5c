//! Maps a raw pipeline failure to a retry decision.
//!
//! This is the seam the retry engine consults after every executor failure;
//! it never fails itself and never needs to know anything about a specific
//! pipeline's error types beyond the structured fields on `job::JobError`.

use crate::job::JobError;

const NON_RETRYABLE_CODES: &[&str] = &["ENOENT", "EACCES", "EPERM", "ENOTFOUND", "EISDIR", "ENOTDIR"];
const RETRYABLE_CODES: &[&str] = &[
    "ETIMEDOUT",
    "ECONNRESET",
    "ECONNREFUSED",
    "EHOSTUNREACH",
    "ENETUNREACH",
    "EAGAIN",
    "EBUSY",
];
const MESSAGE_PATTERNS: &[&str] = &["timeout", "network", "connection", "temporary"];

const DEFAULT_RETRYABLE_DELAY_MS: u64 = 5_000;
const ECONNREFUSED_DELAY_MS: u64 = 10_000;
const RATE_LIMIT_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub category: Category,
    pub reason: String,
    pub suggested_delay_ms: u64,
}

impl Decision {
    pub fn is_retryable(&self) -> bool {
        self.category == Category::Retryable
    }

    fn retryable(reason: impl Into<String>, delay_ms: u64) -> Self {
        Decision {
            category: Category::Retryable,
            reason: reason.into(),
            suggested_delay_ms: delay_ms,
        }
    }

    fn non_retryable(reason: impl Into<String>) -> Self {
        Decision {
            category: Category::NonRetryable,
            reason: reason.into(),
            suggested_delay_ms: 0,
        }
    }
}

/// Pure: classifying the same failure twice always yields the same decision
/// (spec invariant 5 — `classify` has no side effects and reads nothing but
/// `err`).
pub fn classify(err: Option<&JobError>) -> Decision {
    let Some(err) = err else {
        return Decision::non_retryable("no error to retry");
    };

    if let Some(code) = err.code.as_deref() {
        let upper = code.to_ascii_uppercase();
        if NON_RETRYABLE_CODES.contains(&upper.as_str()) {
            return Decision::non_retryable(format!("non-retryable code {}", upper));
        }
        if RETRYABLE_CODES.contains(&upper.as_str()) {
            let delay = if upper == "ECONNREFUSED" {
                ECONNREFUSED_DELAY_MS
            } else {
                DEFAULT_RETRYABLE_DELAY_MS
            };
            return Decision::retryable(upper, delay);
        }
    }

    if let Some(status) = err.status {
        if status == 429 {
            return Decision::retryable("429 too many requests", RATE_LIMIT_DELAY_MS);
        }
        if status == 408 {
            return Decision::retryable("408 request timeout", DEFAULT_RETRYABLE_DELAY_MS);
        }
        if (400..500).contains(&status) {
            return Decision::non_retryable(format!("http {} client error", status));
        }
        if (500..600).contains(&status) {
            return Decision::retryable(format!("http {} server error", status), DEFAULT_RETRYABLE_DELAY_MS);
        }
    }

    let message_lower = err.message.to_ascii_lowercase();
    if MESSAGE_PATTERNS
        .iter()
        .any(|pattern| message_lower.contains(pattern))
    {
        return Decision::retryable("message pattern match", DEFAULT_RETRYABLE_DELAY_MS);
    }

    Decision::retryable("no classification rule matched, defaulting conservatively", DEFAULT_RETRYABLE_DELAY_MS)
}

pub fn is_retryable(err: Option<&JobError>) -> bool {
    classify(err).is_retryable()
}

/// Flattens a `JobError` chain into a single-line description for logs.
pub fn info(err: &JobError) -> String {
    let mut parts = vec![err.message.clone()];
    if let Some(code) = &err.code {
        parts.push(format!("code={}", code));
    }
    if let Some(status) = err.status {
        parts.push(format!("status={}", status));
    }
    if let Some(cause) = &err.cause {
        parts.push(format!("cause=[{}]", info(cause)));
    }
    parts.join(" ")
}

/// Wraps a lower-level failure with a new message, preserving the
/// classifiable fields from `cause` (`code`, `status`/`statusCode`, `errno`
/// as a `code` fallback).
pub fn wrap(message: impl Into<String>, cause: JobError) -> JobError {
    let code = cause.code.clone();
    let status = cause.status;
    JobError {
        message: message.into(),
        code,
        status,
        stack: None,
        cause: Some(Box::new(cause)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_error_is_non_retryable() {
        assert_eq!(classify(None).category, Category::NonRetryable);
    }

    #[test]
    fn enoent_is_non_retryable() {
        let err = JobError::new("file missing").with_code("ENOENT");
        assert_eq!(classify(Some(&err)).category, Category::NonRetryable);
    }

    #[test]
    fn etimedout_is_retryable_with_default_delay() {
        let err = JobError::new("timed out").with_code("ETIMEDOUT");
        let decision = classify(Some(&err));
        assert!(decision.is_retryable());
        assert_eq!(decision.suggested_delay_ms, DEFAULT_RETRYABLE_DELAY_MS);
    }

    #[test]
    fn econnrefused_starts_at_ten_seconds() {
        let err = JobError::new("refused").with_code("ECONNREFUSED");
        let decision = classify(Some(&err));
        assert_eq!(decision.suggested_delay_ms, ECONNREFUSED_DELAY_MS);
    }

    #[test]
    fn http_429_retries_after_exactly_sixty_seconds() {
        let mut err = JobError::new("rate limited");
        err.status = Some(429);
        let decision = classify(Some(&err));
        assert!(decision.is_retryable());
        assert_eq!(decision.suggested_delay_ms, 60_000);
    }

    #[test]
    fn http_408_is_retryable() {
        let mut err = JobError::new("timeout");
        err.status = Some(408);
        assert!(classify(Some(&err)).is_retryable());
    }

    #[test]
    fn http_4xx_other_than_408_429_is_non_retryable() {
        let mut err = JobError::new("bad request");
        err.status = Some(400);
        assert_eq!(classify(Some(&err)).category, Category::NonRetryable);
    }

    #[test]
    fn http_5xx_is_retryable() {
        let mut err = JobError::new("server error");
        err.status = Some(503);
        assert!(classify(Some(&err)).is_retryable());
    }

    #[test]
    fn message_pattern_fallback_matches_case_insensitively() {
        let err = JobError::new("Connection RESET by peer, NETWORK unstable");
        assert!(classify(Some(&err)).is_retryable());
    }

    #[test]
    fn default_is_retryable_when_nothing_else_matches() {
        let err = JobError::new("something odd happened");
        assert!(classify(Some(&err)).is_retryable());
    }

    #[test]
    fn classify_is_pure() {
        let err = JobError::new("timeout reading socket").with_code("ETIMEDOUT");
        let a = classify(Some(&err));
        let b = classify(Some(&err));
        assert_eq!(a.category, b.category);
        assert_eq!(a.suggested_delay_ms, b.suggested_delay_ms);
    }

    #[test]
    fn wrap_preserves_cause_code_and_status() {
        let mut cause = JobError::new("inner").with_code("ETIMEDOUT");
        cause.status = Some(504);
        let wrapped = wrap("outer failure", cause);
        assert_eq!(wrapped.code.as_deref(), Some("ETIMEDOUT"));
        assert_eq!(wrapped.status, Some(504));
        assert_eq!(wrapped.cause.unwrap().message, "inner");
    }
}
