//! Renders scan results into the four on-disk artifact formats the rest of
//! the system (and any human operator) consumes: HTML, Markdown, JSON, and
//! a trimmed-down summary JSON.
//!
//! The concrete shape of a scan result is out of scope here — this module
//! is generic over whatever `serde_json::Value` a pipeline hands back and
//! renders the fields that happen to be present, the way the teacher's
//! config layer reads whatever keys a document happens to carry rather
//! than demanding a fixed schema.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::errors::ApiError;

const DEFAULT_REPORT_MAX_AGE_DAYS: u64 = crate::core::config::defaults::REPORT_MAX_AGE_DAYS;

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn string_field<'a>(result: &'a Value, key: &str) -> Option<&'a str> {
    result.get(key).and_then(Value::as_str)
}

/// Derives `<scan-type>-<repo>-<date>` from whatever fields the scan
/// result carries, falling back to generic placeholders so a base name is
/// always produced even from a near-empty result.
fn base_name(result: &Value) -> String {
    let scan_type = string_field(result, "scan_type").unwrap_or("scan");
    let repo = result
        .get("repositories")
        .and_then(Value::as_array)
        .and_then(|repos| repos.first())
        .and_then(Value::as_str)
        .or_else(|| string_field(result, "repository"))
        .unwrap_or("unknown-repo");
    let date = string_field(result, "started_at")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());

    let slug = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect()
    };
    format!("{}-{}-{}", slug(scan_type), slug(repo), date)
}

/// `started_at`/`completed_at` pairs propagate a null duration when either
/// timestamp is missing, rather than guessing.
fn duration_ms(result: &Value) -> Option<i64> {
    let started = string_field(result, "started_at").and_then(|s| DateTime::parse_from_rfc3339(s).ok())?;
    let completed = string_field(result, "completed_at").and_then(|s| DateTime::parse_from_rfc3339(s).ok())?;
    Some((completed - started).num_milliseconds())
}

fn render_html(result: &Value) -> String {
    let scan_type = escape_html(string_field(result, "scan_type").unwrap_or("scan"));
    let repositories: Vec<String> = result
        .get("repositories")
        .and_then(Value::as_array)
        .map(|repos| {
            repos
                .iter()
                .filter_map(Value::as_str)
                .map(escape_html)
                .collect()
        })
        .unwrap_or_default();
    let duration = duration_ms(result)
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "unknown".to_string());
    let findings = result
        .get("findings")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);

    let mut repo_items = String::new();
    for repo in &repositories {
        repo_items.push_str(&format!("<li>{repo}</li>\n"));
    }

    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{scan_type} report</title></head>\n\
         <body>\n<h1>{scan_type} report</h1>\n<p>Duration: {duration}</p>\n<p>Findings: {findings}</p>\n\
         <ul>\n{repo_items}</ul>\n</body></html>\n"
    )
}

fn render_markdown(result: &Value) -> String {
    let scan_type = string_field(result, "scan_type").unwrap_or("scan");
    let duration = duration_ms(result)
        .map(|ms| format!("{ms} ms"))
        .unwrap_or_else(|| "unknown".to_string());
    let findings = result
        .get("findings")
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or(0);

    format!("# {scan_type} report\n\n- Duration: {duration}\n- Findings: {findings}\n")
}

fn render_summary(result: &Value) -> Value {
    serde_json::json!({
        "scan_type": string_field(result, "scan_type"),
        "duration_ms": duration_ms(result),
        "finding_count": result.get("findings").and_then(Value::as_array).map(Vec::len).unwrap_or(0),
    })
}

/// Emits the four artifacts for one scan result, creating `output_dir` if
/// it doesn't exist yet, and returns the paths written.
pub struct ReportCoordinator {
    max_age_days: u64,
}

pub struct WrittenArtifacts {
    pub html: PathBuf,
    pub markdown: PathBuf,
    pub json: PathBuf,
    pub summary: PathBuf,
}

impl ReportCoordinator {
    pub fn new() -> Self {
        ReportCoordinator {
            max_age_days: DEFAULT_REPORT_MAX_AGE_DAYS,
        }
    }

    pub fn with_max_age_days(max_age_days: u64) -> Self {
        ReportCoordinator { max_age_days }
    }

    pub async fn emit(&self, result: &Value, output_dir: &Path) -> Result<WrittenArtifacts, ApiError> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(ApiError::internal)?;

        let base = base_name(result);
        let html_path = output_dir.join(format!("{base}.html"));
        let md_path = output_dir.join(format!("{base}.md"));
        let json_path = output_dir.join(format!("{base}.json"));
        let summary_path = output_dir.join(format!("{base}-summary.json"));

        tokio::fs::write(&html_path, render_html(result))
            .await
            .map_err(ApiError::internal)?;
        tokio::fs::write(&md_path, render_markdown(result))
            .await
            .map_err(ApiError::internal)?;
        tokio::fs::write(&json_path, serde_json::to_vec_pretty(result).map_err(ApiError::internal)?)
            .await
            .map_err(ApiError::internal)?;
        tokio::fs::write(
            &summary_path,
            serde_json::to_vec_pretty(&render_summary(result)).map_err(ApiError::internal)?,
        )
        .await
        .map_err(ApiError::internal)?;

        Ok(WrittenArtifacts {
            html: html_path,
            markdown: md_path,
            json: json_path,
            summary: summary_path,
        })
    }

    /// Removes files under `output_dir` whose modification time is older
    /// than `max_age_days`. Subdirectories are left untouched.
    pub async fn prune(&self, output_dir: &Path) -> Result<usize, ApiError> {
        let mut entries = match tokio::fs::read_dir(output_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(ApiError::internal(err)),
        };

        let cutoff = SystemTime::now() - Duration::from_secs(self.max_age_days * 24 * 60 * 60);
        let mut removed = 0;

        while let Some(entry) = entries.next_entry().await.map_err(ApiError::internal)? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(err) => {
                    warn!(path = %entry.path().display(), %err, "skipping unreadable report artifact");
                    continue;
                }
            };
            if metadata.is_dir() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if modified < cutoff {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %entry.path().display(), "pruned aged-out report artifact");
                    }
                    Err(err) => warn!(path = %entry.path().display(), %err, "failed to prune report artifact"),
                }
            }
        }

        Ok(removed)
    }
}

impl Default for ReportCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::SystemTime;
    use tempfile::tempdir;

    #[tokio::test]
    async fn emit_writes_all_four_artifacts() {
        let dir = tempdir().unwrap();
        let coordinator = ReportCoordinator::new();
        let result = json!({
            "scan_type": "duplicate-detection",
            "repositories": ["my-repo"],
            "started_at": "2026-01-01T00:00:00Z",
            "completed_at": "2026-01-01T00:00:05Z",
            "findings": [{"path": "a.rs"}, {"path": "b.rs"}],
        });

        let artifacts = coordinator.emit(&result, dir.path()).await.unwrap();
        assert!(tokio::fs::metadata(&artifacts.html).await.is_ok());
        assert!(tokio::fs::metadata(&artifacts.markdown).await.is_ok());
        assert!(tokio::fs::metadata(&artifacts.json).await.is_ok());
        assert!(tokio::fs::metadata(&artifacts.summary).await.is_ok());

        let html = tokio::fs::read_to_string(&artifacts.html).await.unwrap();
        assert!(html.contains("5000 ms"));
        assert!(html.contains("my-repo"));
    }

    #[tokio::test]
    async fn html_output_escapes_scan_supplied_strings() {
        let dir = tempdir().unwrap();
        let coordinator = ReportCoordinator::new();
        let result = json!({
            "scan_type": "<script>alert(1)</script>",
            "repositories": ["<img src=x onerror=alert(1)>"],
        });

        let artifacts = coordinator.emit(&result, dir.path()).await.unwrap();
        let html = tokio::fs::read_to_string(&artifacts.html).await.unwrap();
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[tokio::test]
    async fn missing_timestamps_propagate_a_null_duration() {
        let dir = tempdir().unwrap();
        let coordinator = ReportCoordinator::new();
        let result = json!({"scan_type": "repo-scan"});

        let artifacts = coordinator.emit(&result, dir.path()).await.unwrap();
        let summary: Value = serde_json::from_slice(&tokio::fs::read(&artifacts.summary).await.unwrap()).unwrap();
        assert!(summary["duration_ms"].is_null());
    }

    #[tokio::test]
    async fn emit_creates_the_output_directory_if_absent() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("reports").join("2026");
        let coordinator = ReportCoordinator::new();

        coordinator.emit(&json!({}), &nested).await.unwrap();
        assert!(tokio::fs::metadata(&nested).await.is_ok());
    }

    #[tokio::test]
    async fn prune_removes_only_aged_out_files_and_skips_directories() {
        let dir = tempdir().unwrap();
        let old_file = dir.path().join("old-report.json");
        let fresh_file = dir.path().join("fresh-report.json");
        let sub_dir = dir.path().join("archive");
        tokio::fs::write(&old_file, "{}").await.unwrap();
        tokio::fs::write(&fresh_file, "{}").await.unwrap();
        tokio::fs::create_dir(&sub_dir).await.unwrap();

        let old_time: SystemTime = SystemTime::now() - Duration::from_secs(40 * 24 * 60 * 60);
        std::fs::File::open(&old_file)
            .unwrap()
            .set_modified(old_time)
            .unwrap();

        let coordinator = ReportCoordinator::with_max_age_days(30);
        let removed = coordinator.prune(dir.path()).await.unwrap();

        assert_eq!(removed, 1);
        assert!(tokio::fs::metadata(&old_file).await.is_err());
        assert!(tokio::fs::metadata(&fresh_file).await.is_ok());
        assert!(tokio::fs::metadata(&sub_dir).await.is_ok());
    }
}
