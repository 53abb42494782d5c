//! `/api/reports[/:filename]` handlers: read-only access to the artifacts
//! [`crate::reports::ReportCoordinator`] writes, plus deletion. Filenames
//! are sanitised against path traversal per spec.md §6.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::core::errors::ApiError;
use crate::state::AppState;

/// Rejects any filename that isn't a bare file name in the reports
/// directory — no path separators, no `..`, no absolute paths.
fn sanitize_filename(filename: &str) -> Result<&str, ApiError> {
    if filename.is_empty()
        || filename.contains("..")
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(ApiError::validation("filename", "must not contain path separators or '..'"));
    }
    Ok(filename)
}

fn content_type_for(filename: &str) -> &'static str {
    if filename.ends_with(".json") {
        "application/json"
    } else if filename.ends_with(".html") {
        "text/html; charset=utf-8"
    } else if filename.ends_with(".md") {
        "text/markdown; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

pub async fn list_reports(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let mut entries = match tokio::fs::read_dir(&state.paths.reports_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(json!({ "reports": [] })));
        }
        Err(err) => return Err(ApiError::internal(err)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(ApiError::internal)? {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    Ok(Json(json!({ "reports": names })))
}

pub async fn get_report(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let filename = sanitize_filename(&filename)?;
    let path = state.paths.reports_dir.join(filename);

    let bytes = tokio::fs::read(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(format!("no such report '{}'", filename))
        } else {
            ApiError::internal(err)
        }
    })?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type_for(filename))],
        bytes,
    ))
}

pub async fn delete_report(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let filename = sanitize_filename(&filename)?;
    let path = state.paths.reports_dir.join(filename);

    tokio::fs::remove_file(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::NotFound(format!("no such report '{}'", filename))
        } else {
            ApiError::internal(err)
        }
    })?;

    Ok(Json(json!({ "success": true, "filename": filename })))
}
