//! Pipeline executor trait and the registry of known pipelines.
//!
//! Grounded on the teacher's `context/worker.rs`: an `async_trait` per-unit
//! trait (`ContextWorker` there, `PipelineWorker` here), driven by an engine
//! that interprets the outcome (`WorkerPipeline::run` there, the job
//! registry here). The worker map with bounded concurrent construction has
//! no direct teacher counterpart; it is built against this spec's own
//! requirement using the same `Semaphore` idiom the teacher uses for
//! `mcp_registry`'s connection cap.

pub mod samples;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::info;

use crate::core::config::defaults::MAX_WORKER_INITS;
use crate::core::errors::ApiError;
use crate::job::{Job, JobError};

/// One pipeline's executor. Implementations run a single job to completion
/// and return either its result payload or a structured failure the
/// classifier can interpret. `cancel` reports `true` once the registry has
/// cooperatively cancelled this job; long-running workers should poll it
/// and return early, though nothing forces them to.
#[async_trait]
pub trait PipelineWorker: Send + Sync {
    fn pipeline_id(&self) -> &str;

    async fn execute(&self, job: &Job, cancel: watch::Receiver<bool>) -> Result<Value, JobError>;

    /// Called once during registry shutdown. Default is a no-op; workers
    /// holding connections or background tasks override it.
    async fn stop(&self) {}
}

type WorkerFactory = Box<dyn Fn() -> Arc<dyn PipelineWorker> + Send + Sync>;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerRegistryStats {
    pub supported_pipelines: Vec<String>,
    pub constructed_pipelines: Vec<String>,
}

/// Holds the factory map `pipeline_id -> worker constructor` and lazily,
/// memoised, constructs each worker on first use.
pub struct WorkerRegistry {
    factories: HashMap<String, WorkerFactory>,
    instances: Mutex<HashMap<String, Arc<dyn PipelineWorker>>>,
    init_gate: Semaphore,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        WorkerRegistry {
            factories: HashMap::new(),
            instances: Mutex::new(HashMap::new()),
            init_gate: Semaphore::new(MAX_WORKER_INITS),
        }
    }

    pub fn register(
        &mut self,
        pipeline_id: impl Into<String>,
        factory: impl Fn() -> Arc<dyn PipelineWorker> + Send + Sync + 'static,
    ) {
        self.factories.insert(pipeline_id.into(), Box::new(factory));
    }

    pub fn is_supported(&self, pipeline_id: &str) -> bool {
        self.factories.contains_key(pipeline_id)
    }

    pub fn supported_pipelines(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Returns the memoised worker for `pipeline_id`, constructing it on
    /// first use. Construction is bounded to `MAX_WORKER_INITS` concurrent
    /// initialisations; further callers wait on the semaphore.
    pub async fn get(&self, pipeline_id: &str) -> Result<Arc<dyn PipelineWorker>, ApiError> {
        {
            let instances = self.instances.lock().await;
            if let Some(worker) = instances.get(pipeline_id) {
                return Ok(Arc::clone(worker));
            }
        }

        let factory = self
            .factories
            .get(pipeline_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown pipeline '{}'", pipeline_id)))?;

        let _permit = self
            .init_gate
            .acquire()
            .await
            .map_err(ApiError::internal)?;

        let mut instances = self.instances.lock().await;
        if let Some(worker) = instances.get(pipeline_id) {
            return Ok(Arc::clone(worker));
        }
        let worker = factory();
        instances.insert(pipeline_id.to_string(), Arc::clone(&worker));
        info!(pipeline_id, "worker constructed");
        Ok(worker)
    }

    pub async fn all_stats(&self) -> WorkerRegistryStats {
        let instances = self.instances.lock().await;
        let mut constructed: Vec<String> = instances.keys().cloned().collect();
        constructed.sort();
        WorkerRegistryStats {
            supported_pipelines: self.supported_pipelines(),
            constructed_pipelines: constructed,
        }
    }

    pub async fn shutdown(&self) {
        let mut instances = self.instances.lock().await;
        for (pipeline_id, worker) in instances.drain() {
            info!(pipeline_id, "stopping worker");
            worker.stop().await;
        }
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::samples::{EchoWorker, FlakyWorker};

    fn registry_with_samples() -> WorkerRegistry {
        let mut registry = WorkerRegistry::new();
        registry.register("echo", || Arc::new(EchoWorker));
        registry.register("flaky", || Arc::new(FlakyWorker::new()));
        registry
    }

    #[tokio::test]
    async fn unknown_pipeline_fails_fast() {
        let registry = registry_with_samples();
        assert!(registry.get("does-not-exist").await.is_err());
        assert!(!registry.is_supported("does-not-exist"));
    }

    #[tokio::test]
    async fn worker_construction_is_memoised() {
        let registry = registry_with_samples();
        let a = registry.get("echo").await.unwrap();
        let b = registry.get("echo").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.all_stats().await.constructed_pipelines, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn supported_pipelines_lists_every_registered_factory() {
        let registry = registry_with_samples();
        assert_eq!(registry.supported_pipelines(), vec!["echo".to_string(), "flaky".to_string()]);
    }
}
