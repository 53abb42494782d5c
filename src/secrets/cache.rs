use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

use crate::core::config::defaults::FALLBACK_CACHE_STALE_SECS;

/// File-backed snapshot of the last successfully fetched secrets, served
/// while the breaker is open. Reloaded from disk when the in-memory copy
/// is older than [`FALLBACK_CACHE_STALE_SECS`].
pub struct FallbackCache {
    path: PathBuf,
    loaded: Option<(Value, Instant)>,
}

impl FallbackCache {
    pub fn new(path: PathBuf) -> Self {
        FallbackCache { path, loaded: None }
    }

    pub fn store(&mut self, secrets: &Value) {
        let document = json!({
            "fetched_at": Utc::now().to_rfc3339(),
            "secrets": secrets,
        });
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.path, document.to_string()) {
            warn!(path = %self.path.display(), error = %e, "failed to persist fallback secret cache");
        }
        self.loaded = Some((secrets.clone(), Instant::now()));
    }

    /// Returns the cached secrets, reloading from disk if the in-memory
    /// copy is stale or absent. Returns an empty object if nothing has
    /// ever been cached.
    pub fn load_or_reload(&mut self) -> Value {
        let is_stale = self
            .loaded
            .as_ref()
            .map(|(_, at)| at.elapsed() >= Duration::from_secs(FALLBACK_CACHE_STALE_SECS))
            .unwrap_or(true);

        if is_stale {
            self.reload_from_disk();
        }

        self.loaded
            .as_ref()
            .map(|(secrets, _)| secrets.clone())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }

    fn reload_from_disk(&mut self) {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return;
        };
        let Ok(document) = serde_json::from_str::<Value>(&raw) else {
            warn!(path = %self.path.display(), "fallback secret cache is not valid json, ignoring");
            return;
        };
        if let Some(secrets) = document.get("secrets") {
            self.loaded = Some((secrets.clone(), Instant::now()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stores_and_reloads_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("secrets-cache.json");

        let mut cache = FallbackCache::new(path.clone());
        cache.store(&json!({"api_key": "abc"}));

        let mut reloaded = FallbackCache::new(path);
        assert_eq!(reloaded.load_or_reload(), json!({"api_key": "abc"}));
    }

    #[test]
    fn missing_cache_file_yields_empty_object() {
        let dir = tempdir().unwrap();
        let mut cache = FallbackCache::new(dir.path().join("missing.json"));
        assert_eq!(cache.load_or_reload(), Value::Object(serde_json::Map::new()));
    }
}
