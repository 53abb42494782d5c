//! Composition root: wires persistence, workers, the event bus, the job
//! registry, secret resilience, the activity feed, and the report
//! coordinator into one shared [`AppState`], the way the teacher's
//! `state::AppState::initialize` wires its own service graph.

pub mod error;

use std::sync::Arc;

use tracing::{info, warn};

use crate::activity::ActivityFeed;
use crate::core::config::defaults::{DEFAULT_MAX_ACTIVITIES, DEFAULT_MAX_CONCURRENT_JOBS};
use crate::core::config::{AppPaths, ConfigService};
use crate::events::{EventBus, Publisher};
use crate::persistence::PersistenceStore;
use crate::registry::JobRegistry;
use crate::reports::ReportCoordinator;
use crate::secrets::{HttpSecretFetcher, SecretResilience};
use crate::workers::samples::{EchoWorker, FlakyWorker};
use crate::workers::WorkerRegistry;

use error::InitializationError;

/// Global application state shared across every route and background task.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config: ConfigService,
    pub events: Arc<EventBus>,
    pub persistence: Arc<PersistenceStore>,
    pub workers: Arc<WorkerRegistry>,
    pub registry: Arc<JobRegistry>,
    pub secrets: Arc<SecretResilience>,
    pub activity: Arc<ActivityFeed>,
    pub reports: Arc<ReportCoordinator>,
}

impl AppState {
    /// Initializes the application state:
    /// 1. Resolves paths and loads (seeding if absent) the config document.
    /// 2. Opens the durable job store.
    /// 3. Registers the illustrative sample pipelines.
    /// 4. Wires the event bus, job registry, secret resilience, activity
    ///    feed, and report coordinator on top.
    pub async fn initialize() -> Result<Arc<Self>, InitializationError> {
        let paths = Arc::new(AppPaths::new());
        let config = ConfigService::new(paths.clone());
        let document = config
            .load_config_or_seed()
            .map_err(InitializationError::Config)?;

        let persistence = PersistenceStore::new(paths.db_path.clone())
            .await
            .map_err(InitializationError::Persistence)?;

        let mut workers = WorkerRegistry::new();
        workers.register("echo", || Arc::new(EchoWorker));
        workers.register("flaky", || Arc::new(FlakyWorker::new()));
        // Illustrative stand-ins for the two pipelines the demo HTTP surface
        // submits against; real scan/duplicate-detection logic is out of
        // scope per spec.md's non-goals.
        workers.register("repository-scan", || Arc::new(EchoWorker));
        workers.register("duplicate-detection", || Arc::new(EchoWorker));
        let workers = Arc::new(workers);

        let events = EventBus::new();
        events.spawn_liveness_probe();

        let default_max_concurrent_jobs = document
            .get("scheduling")
            .and_then(|s| s.get("default_max_concurrent_jobs"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_JOBS);
        let default_max_retries = document
            .get("scheduling")
            .and_then(|s| s.get("default_max_retries"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .unwrap_or(3);

        let publisher: Arc<dyn Publisher> = events.clone();
        let registry = JobRegistry::new(
            Arc::clone(&persistence),
            Arc::clone(&workers),
            publisher,
            default_max_concurrent_jobs,
            default_max_retries,
        );

        let secrets_url = document
            .get("secrets")
            .and_then(|s| s.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if secrets_url.is_empty() {
            warn!("no secrets.url configured; secret resilience will always serve the fallback cache");
        }
        let secrets = Arc::new(SecretResilience::new(
            Arc::new(HttpSecretFetcher::new(secrets_url)),
            paths.secret_cache_path.clone(),
        ));

        let max_activities = document
            .get("activity_feed")
            .and_then(|s| s.get("max_activities"))
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_ACTIVITIES);
        let activity_publisher: Arc<dyn Publisher> = events.clone();
        let activity = ActivityFeed::new(max_activities, activity_publisher);
        activity.listen(&events);

        let reports = Arc::new(ReportCoordinator::new());

        info!(
            db_path = %paths.db_path.display(),
            reports_dir = %paths.reports_dir.display(),
            "application state initialized"
        );

        Ok(Arc::new(AppState {
            paths,
            config,
            events,
            persistence,
            workers,
            registry,
            secrets,
            activity,
            reports,
        }))
    }
}
