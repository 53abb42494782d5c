//! `/api/scans/*` handlers: the demo surface around job submission and
//! inspection. Request/response shapes follow spec.md §6's HTTP table;
//! the actual scanning logic is out of scope and delegated to whichever
//! sample pipeline the worker registry has wired up.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::ApiError;
use crate::job::GitContext;
use crate::state::AppState;

const SINGLE_REPO_PIPELINE: &str = "repository-scan";
const MULTI_REPO_PIPELINE: &str = "duplicate-detection";

#[derive(Debug, Deserialize)]
pub struct StartScanRequest {
    #[serde(rename = "repositoryPath")]
    repository_path: Option<String>,
    #[serde(default)]
    options: Value,
}

pub async fn start_scan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let repository_path = body
        .repository_path
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ApiError::validation("repositoryPath", "is required and must be non-empty"))?;

    let pipeline_id = body
        .options
        .get("pipeline")
        .and_then(Value::as_str)
        .unwrap_or(SINGLE_REPO_PIPELINE);
    let max_retries = body
        .options
        .get("maxRetries")
        .and_then(Value::as_u64)
        .map(|v| v as u32);

    let input = json!({ "repositoryPath": repository_path, "options": body.options });
    let git_context = GitContext {
        repository_path: repository_path.clone(),
        branch: None,
        commit_sha: None,
    };

    let job_id = state
        .registry
        .submit_with_git_context(pipeline_id, input, max_retries, Some(git_context))
        .await?;

    Ok(Json(json!({
        "success": true,
        "job_id": job_id,
        "status_url": format!("/api/scans/{}/status", job_id),
        "results_url": format!("/api/scans/{}/results", job_id),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct StartMultiScanRequest {
    #[serde(rename = "repositoryPaths", default)]
    repository_paths: Vec<String>,
    #[serde(rename = "groupName")]
    group_name: Option<String>,
}

pub async fn start_multi_scan(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartMultiScanRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.repository_paths.len() < 2 {
        return Err(ApiError::validation(
            "repositoryPaths",
            "must contain at least 2 repository paths",
        ));
    }

    let input = json!({
        "repositoryPaths": body.repository_paths,
        "groupName": body.group_name,
    });

    let job_id = state
        .registry
        .submit(MULTI_REPO_PIPELINE, input, None)
        .await?;

    Ok(Json(json!({
        "success": true,
        "job_id": job_id,
        "repository_count": body.repository_paths.len(),
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

pub async fn scan_status(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown job '{}'", job_id)))?;

    let registry_stats = state.registry.stats().await;
    let pipeline_snapshot = registry_stats.pipelines.get(&job.pipeline_id).cloned().unwrap_or_default();
    let job_counts = state.persistence.get_job_counts(&job.pipeline_id).await;

    Ok(Json(json!({
        "job_id": job.job_id,
        "status": job.status.as_str(),
        "queued": pipeline_snapshot.queued,
        "active": pipeline_snapshot.active,
        "completed": job_counts.completed,
        "timestamp": Utc::now().to_rfc3339(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default)]
    format: Option<String>,
}

pub async fn scan_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Query(query): Query<ResultsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown job '{}'", job_id)))?;

    let mut body = json!({
        "job_id": job.job_id,
        "status": job.status.as_str(),
        "metrics": job.result.clone().unwrap_or(Value::Null),
        "error": job.error,
        "timestamp": Utc::now().to_rfc3339(),
    });

    if query.format.as_deref() == Some("full") {
        body["detailed_metrics"] = job.result.clone().unwrap_or(Value::Null);
    }

    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    limit: Option<usize>,
}

pub async fn recent_scans(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(10);
    let jobs = state.persistence.get_all_jobs(None, limit, 0).await;
    Json(json!({
        "scans": jobs,
        "total": jobs.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn scan_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scan_metrics = state.activity.stats().await;
    let queue_stats = state.registry.stats().await;
    let cache_stats = state.secrets.health().await;

    Json(json!({
        "scan_metrics": scan_metrics,
        "queue_stats": queue_stats,
        "cache_stats": cache_stats,
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

pub async fn cancel_scan(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .registry
        .get(&job_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown job '{}'", job_id)))?;

    if job.status.is_terminal() {
        return Err(ApiError::validation(
            "job_id",
            format!("job '{}' is already in a terminal state ({})", job_id, job.status.as_str()),
        ));
    }

    state.registry.cancel(&job_id).await;
    Ok(Json(json!({ "success": true, "job_id": job_id })))
}
