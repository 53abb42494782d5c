//! Job submission, fair per-pipeline scheduling, and the retry engine.
//!
//! The dequeue-under-a-cap shape is grounded on the teacher's
//! `WorkerPipeline::run` (`context/worker.rs`): classify the outcome, retry
//! up to a bound, otherwise fail fast. Round-robin fairness across pipelines
//! and the write-through to `PersistenceStore` have no single teacher
//! analogue and are built directly against the scheduling model this spec
//! describes.

mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier;
use crate::core::config::defaults::ABSOLUTE_RETRY_CAP;
use crate::core::errors::ApiError;
use crate::events::{envelope, topics, Publisher};
use crate::job::{strip_retry_suffix, Job, JobError, JobStatus};
use crate::persistence::PersistenceStore;
use crate::workers::WorkerRegistry;

use queue::PipelineQueue;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PipelineSnapshot {
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RegistryStats {
    pub total_active: usize,
    pub total_queued: usize,
    pub pipelines: HashMap<String, PipelineSnapshot>,
}

#[derive(Default)]
struct RegistryState {
    pipelines: HashMap<String, PipelineQueue>,
    order: Vec<String>,
    cursor: usize,
}

/// Accepts job submissions, dispatches them under per-pipeline concurrency
/// caps with round-robin fairness, and drives each failure through the
/// classifier to either retry or fail the job terminally.
pub struct JobRegistry {
    persistence: Arc<PersistenceStore>,
    workers: Arc<WorkerRegistry>,
    events: Arc<dyn Publisher>,
    state: Mutex<RegistryState>,
    cancel_signals: Mutex<HashMap<String, watch::Sender<bool>>>,
    notify: Notify,
    stopped: AtomicBool,
    default_max_concurrent_jobs: usize,
    default_max_retries: u32,
    max_queue_per_pipeline: usize,
}

impl JobRegistry {
    pub fn new(
        persistence: Arc<PersistenceStore>,
        workers: Arc<WorkerRegistry>,
        events: Arc<dyn Publisher>,
        default_max_concurrent_jobs: usize,
        default_max_retries: u32,
    ) -> Arc<Self> {
        Self::with_queue_cap(
            persistence,
            workers,
            events,
            default_max_concurrent_jobs,
            default_max_retries,
            crate::core::config::defaults::DEFAULT_MAX_QUEUE_PER_PIPELINE,
        )
    }

    pub fn with_queue_cap(
        persistence: Arc<PersistenceStore>,
        workers: Arc<WorkerRegistry>,
        events: Arc<dyn Publisher>,
        default_max_concurrent_jobs: usize,
        default_max_retries: u32,
        max_queue_per_pipeline: usize,
    ) -> Arc<Self> {
        let registry = Arc::new(JobRegistry {
            persistence,
            workers,
            events,
            state: Mutex::new(RegistryState::default()),
            cancel_signals: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            stopped: AtomicBool::new(false),
            default_max_concurrent_jobs,
            default_max_retries,
            max_queue_per_pipeline,
        });
        tokio::spawn(Self::dispatch_loop(Arc::clone(&registry)));
        registry
    }

    /// Assigns a fresh `job_id`, creates the job in `queued`, and enqueues
    /// it onto its pipeline's FIFO queue.
    pub async fn submit(
        &self,
        pipeline_id: &str,
        input: Value,
        max_retries: Option<u32>,
    ) -> Result<String, ApiError> {
        self.submit_with_git_context(pipeline_id, input, max_retries, None).await
    }

    /// As [`submit`](Self::submit), but also attaches `git_context` to the
    /// created job — for pipelines (duplicate detection, repository scans)
    /// whose submission naturally carries repository coordinates.
    pub async fn submit_with_git_context(
        &self,
        pipeline_id: &str,
        input: Value,
        max_retries: Option<u32>,
        git_context: Option<crate::job::GitContext>,
    ) -> Result<String, ApiError> {
        if !self.workers.is_supported(pipeline_id) {
            return Err(ApiError::NotFound(format!("unknown pipeline '{}'", pipeline_id)));
        }

        {
            let state = self.state.lock().await;
            if let Some(pq) = state.pipelines.get(pipeline_id) {
                if pq.queue.len() >= self.max_queue_per_pipeline {
                    return Err(ApiError::QueueFull(format!(
                        "pipeline '{}' has reached its queue capacity of {}",
                        pipeline_id, self.max_queue_per_pipeline
                    )));
                }
            }
        }

        let job_id = format!("{}-{}", pipeline_id, Uuid::new_v4());
        let max_attempts = max_retries.unwrap_or(self.default_max_retries);
        self.persistence.ensure_retry_record(&job_id, max_attempts).await;

        let mut job = Job::new(job_id.clone(), pipeline_id.to_string(), input);
        job.git_context = git_context;
        self.enqueue_job(job).await;
        Ok(job_id)
    }

    pub async fn get(&self, job_id: &str) -> Option<Job> {
        self.persistence.get_job(job_id).await
    }

    /// Cancels `job_id` unless it is already terminal. A queued job is
    /// removed from its pipeline's queue; a running job is sent a
    /// cooperative cancellation signal. Either way the job's status becomes
    /// `cancelled` immediately.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let Some(mut job) = self.persistence.get_job(job_id).await else {
            return false;
        };
        if job.status.is_terminal() {
            return false;
        }

        let was_running = job.status == JobStatus::Running;
        if job.status == JobStatus::Queued {
            self.remove_from_queue(&job.pipeline_id, job_id).await;
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.persistence.save_job(&job).await;

        if was_running {
            if let Some(tx) = self.cancel_signals.lock().await.get(job_id) {
                let _ = tx.send(true);
            }
        }
        true
    }

    pub async fn stats(&self) -> RegistryStats {
        let state = self.state.lock().await;
        let mut pipelines = HashMap::new();
        let mut total_active = 0;
        let mut total_queued = 0;
        for (pipeline_id, pq) in &state.pipelines {
            total_active += pq.active;
            total_queued += pq.queue.len();
            pipelines.insert(
                pipeline_id.clone(),
                PipelineSnapshot {
                    active: pq.active,
                    queued: pq.queue.len(),
                    max_concurrent: pq.max_concurrent,
                },
            );
        }
        RegistryStats {
            total_active,
            total_queued,
            pipelines,
        }
    }

    /// Stops further dequeues. Already-running jobs are left to complete;
    /// queued jobs are left queued rather than force-cancelled.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    async fn remove_from_queue(&self, pipeline_id: &str, job_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(pq) = state.pipelines.get_mut(pipeline_id) {
            pq.queue.retain(|id| id != job_id);
        }
    }

    async fn ensure_pipeline(&self, pipeline_id: &str) {
        let mut state = self.state.lock().await;
        if !state.pipelines.contains_key(pipeline_id) {
            state
                .pipelines
                .insert(pipeline_id.to_string(), PipelineQueue::new(self.default_max_concurrent_jobs));
            state.order.push(pipeline_id.to_string());
        }
    }

    async fn enqueue_job(&self, job: Job) {
        self.ensure_pipeline(&job.pipeline_id).await;
        let pipeline_id = job.pipeline_id.clone();
        let job_id = job.job_id.clone();

        self.persistence.save_job(&job).await;
        self.publish(topics::JOB_CREATED, json!({ "job": job }));

        let (tx, _rx) = watch::channel(false);
        self.cancel_signals.lock().await.insert(job_id.clone(), tx);

        {
            let mut state = self.state.lock().await;
            if let Some(pq) = state.pipelines.get_mut(&pipeline_id) {
                pq.queue.push_back(job_id);
            }
        }
        self.notify.notify_one();
    }

    fn publish(&self, message_type: &str, fields: Value) {
        self.events.publish(Some(topics::CHANNEL_JOBS), envelope(message_type, fields));
    }

    async fn dispatch_loop(registry: Arc<Self>) {
        loop {
            registry.notify.notified().await;
            while Self::try_dispatch_once(&registry).await {}
        }
    }

    async fn try_dispatch_once(registry: &Arc<Self>) -> bool {
        if registry.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let dispatch = {
            let mut state = registry.state.lock().await;
            let n = state.order.len();
            let mut found = None;
            for _ in 0..n {
                let idx = state.cursor % n;
                state.cursor = (state.cursor + 1) % n;
                let pipeline_id = state.order[idx].clone();
                if let Some(pq) = state.pipelines.get_mut(&pipeline_id) {
                    if pq.active < pq.max_concurrent {
                        if let Some(job_id) = pq.queue.pop_front() {
                            pq.active += 1;
                            found = Some((pipeline_id, job_id));
                            break;
                        }
                    }
                }
            }
            found
        };

        match dispatch {
            Some((pipeline_id, job_id)) => {
                let registry = Arc::clone(registry);
                tokio::spawn(async move {
                    registry.run_job(pipeline_id, job_id).await;
                });
                true
            }
            None => false,
        }
    }

    async fn finish_dispatch(&self, pipeline_id: &str) {
        {
            let mut state = self.state.lock().await;
            if let Some(pq) = state.pipelines.get_mut(pipeline_id) {
                pq.active = pq.active.saturating_sub(1);
            }
        }
        self.notify.notify_one();
    }

    async fn run_job(self: Arc<Self>, pipeline_id: String, job_id: String) {
        let Some(mut job) = self.persistence.get_job(&job_id).await else {
            return;
        };

        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.persistence.save_job(&job).await;
        self.publish(topics::JOB_STARTED, json!({ "job": &job }));

        let cancel_rx = {
            let signals = self.cancel_signals.lock().await;
            signals.get(&job_id).map(|tx| tx.subscribe())
        }
        .unwrap_or_else(|| watch::channel(false).1);

        let worker = match self.workers.get(&pipeline_id).await {
            Ok(worker) => worker,
            Err(e) => {
                self.finish_dispatch(&pipeline_id).await;
                self.process_failure(job, JobError::new(e.to_string()), cancel_rx).await;
                return;
            }
        };

        let outcome = worker.execute(&job, cancel_rx.clone()).await;
        self.finish_dispatch(&pipeline_id).await;

        let still_live = self
            .persistence
            .get_job(&job_id)
            .await
            .map(|j| j.status != JobStatus::Cancelled)
            .unwrap_or(false);
        if !still_live {
            debug!(job_id, "ignoring outcome of a job cancelled while running");
            self.cancel_signals.lock().await.remove(&job_id);
            return;
        }

        match outcome {
            Ok(value) => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.result = Some(value);
                self.persistence.save_job(&job).await;
                self.publish(topics::JOB_COMPLETED, json!({ "job": &job }));
                self.cancel_signals.lock().await.remove(&job_id);
            }
            Err(err) => self.process_failure(job, err, cancel_rx).await,
        }
    }

    /// Runs a failed job's outcome through the classifier and either fails
    /// it terminally or schedules a retry.
    async fn process_failure(&self, mut job: Job, err: JobError, cancel_rx: watch::Receiver<bool>) {
        let decision = classifier::classify(Some(&err));
        let original_id = strip_retry_suffix(&job.job_id);
        job.error = Some(err);

        let record = self
            .persistence
            .increment_retry_attempts(&original_id, self.default_max_retries)
            .await;
        let (attempts, max_attempts) = (record.attempts, record.max_attempts);

        let circuit_broken = attempts >= ABSOLUTE_RETRY_CAP;
        let terminal = !decision.is_retryable() || attempts >= max_attempts || circuit_broken;

        if terminal {
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            self.persistence.save_job(&job).await;
            self.publish(topics::JOB_FAILED, json!({ "job": &job, "reason": decision.reason }));
            if circuit_broken {
                warn!(job_id = %job.job_id, attempts, "retry circuit broken at absolute cap");
                self.publish(
                    topics::RETRY_MAX_ATTEMPTS,
                    json!({ "job_id": job.job_id, "attempts": attempts, "max_attempts": max_attempts }),
                );
            }
            self.cancel_signals.lock().await.remove(&job.job_id);
            return;
        }

        self.publish(
            topics::RETRY_CREATED,
            json!({
                "job_id": job.job_id,
                "attempt": attempts,
                "max_attempts": max_attempts,
                "reason": decision.reason,
                "delay_ms": decision.suggested_delay_ms,
            }),
        );

        Self::wait_cancellable(decision.suggested_delay_ms, cancel_rx).await;

        let cancelled_during_wait = self
            .persistence
            .get_job(&job.job_id)
            .await
            .map(|j| j.status == JobStatus::Cancelled)
            .unwrap_or(false);
        if cancelled_during_wait {
            info!(job_id = %job.job_id, "cancel won the race with a scheduled retry");
            self.cancel_signals.lock().await.remove(&job.job_id);
            return;
        }

        let new_job_id = format!("{}-retry{}", original_id, attempts);
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.retried_as = Some(new_job_id.clone());
        self.persistence.save_job(&job).await;
        self.cancel_signals.lock().await.remove(&job.job_id);

        let mut new_job = Job::new(new_job_id, job.pipeline_id.clone(), job.input.clone());
        new_job.git_context = job.git_context.clone();
        self.enqueue_job(new_job).await;
    }

    async fn wait_cancellable(delay_ms: u64, mut cancel_rx: watch::Receiver<bool>) {
        if *cancel_rx.borrow() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = cancel_rx.changed() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::samples::{AlwaysFailWorker, EchoWorker, FlakyWorker};
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout};

    #[derive(Default)]
    struct RecordingPublisher {
        messages: StdMutex<Vec<(Option<String>, Value)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, channel: Option<&str>, message: Value) {
            self.messages
                .lock()
                .unwrap()
                .push((channel.map(|c| c.to_string()), message));
        }
    }

    async fn test_registry() -> (Arc<JobRegistry>, Arc<PersistenceStore>, Arc<RecordingPublisher>) {
        let dir = tempdir().unwrap();
        let persistence = PersistenceStore::new(dir.path().join("jobs.sqlite")).await.unwrap();
        let mut worker_registry = WorkerRegistry::new();
        worker_registry.register("echo", || Arc::new(EchoWorker));
        worker_registry.register("flaky", || Arc::new(FlakyWorker::new()));
        worker_registry.register("always-timeout", || Arc::new(AlwaysFailWorker::new("always-timeout", "ETIMEDOUT")));
        worker_registry.register("always-enoent", || Arc::new(AlwaysFailWorker::new("always-enoent", "ENOENT")));
        let workers = Arc::new(worker_registry);
        let publisher = Arc::new(RecordingPublisher::default());
        let registry = JobRegistry::new(
            Arc::clone(&persistence),
            workers,
            publisher.clone() as Arc<dyn Publisher>,
            5,
            3,
        );
        (registry, persistence, publisher)
    }

    async fn wait_for_terminal(registry: &JobRegistry, job_id: &str) -> Job {
        timeout(Duration::from_secs(5), async {
            loop {
                if let Some(job) = registry.get(job_id).await {
                    if job.status.is_terminal() {
                        return job;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("job did not reach a terminal state in time")
    }

    #[tokio::test]
    async fn happy_path_submits_dispatches_and_completes() {
        let (registry, _persistence, _publisher) = test_registry().await;
        let job_id = registry.submit("echo", json!({"n": 1}), None).await.unwrap();
        let job = wait_for_terminal(&registry, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result.unwrap()["echoed"], json!({"n": 1}));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds_on_a_flaky_worker() {
        let (registry, _persistence, _publisher) = test_registry().await;
        let job_id = registry.submit("flaky", json!({"n": 2}), Some(5)).await.unwrap();
        let job = wait_for_terminal(&registry, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn submit_to_unknown_pipeline_is_rejected() {
        let (registry, _persistence, _publisher) = test_registry().await;
        assert!(registry.submit("does-not-exist", json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn cancel_removes_a_queued_job_without_running_it() {
        let (registry, _persistence, _publisher) = test_registry().await;
        registry.stop(); // prevent dispatch so the job stays queued
        let job_id = registry.submit("echo", json!({}), None).await.unwrap();
        assert!(registry.cancel(&job_id).await);
        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancelling_an_already_terminal_job_returns_false() {
        let (registry, _persistence, _publisher) = test_registry().await;
        let job_id = registry.submit("echo", json!({}), None).await.unwrap();
        wait_for_terminal(&registry, &job_id).await;
        assert!(!registry.cancel(&job_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn a_persistently_retryable_failure_trips_the_absolute_cap() {
        let (registry, _persistence, publisher) = test_registry().await;
        let job_id = registry
            .submit("always-timeout", json!({}), Some(100))
            .await
            .unwrap();
        let job = wait_for_terminal(&registry, &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let messages = publisher.messages.lock().unwrap();
        assert!(messages
            .iter()
            .any(|(_, msg)| msg["type"] == topics::RETRY_MAX_ATTEMPTS));
    }

    #[tokio::test]
    async fn a_non_retryable_failure_fails_immediately_without_a_retry() {
        let (registry, _persistence, publisher) = test_registry().await;
        let job_id = registry.submit("always-enoent", json!({}), Some(5)).await.unwrap();
        let job = wait_for_terminal(&registry, &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.retried_as.is_none());

        let messages = publisher.messages.lock().unwrap();
        assert!(!messages.iter().any(|(_, msg)| msg["type"] == topics::RETRY_CREATED));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_attempts_are_recorded_durably_in_the_persistence_store() {
        let (registry, persistence, _publisher) = test_registry().await;
        let job_id = registry.submit("flaky", json!({"n": 2}), Some(5)).await.unwrap();
        wait_for_terminal(&registry, &job_id).await;

        let record = persistence.get_retry_record(&job_id).await.unwrap();
        assert!(record.attempts >= 1);
        assert_eq!(record.max_attempts, 5);
    }
}
