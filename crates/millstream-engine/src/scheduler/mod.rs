//! Delayed-job scheduler.
//!
//! Jobs are rows in the `scheduled_jobs` table; any engine process may fire
//! them. The polling loop claims due jobs with a capture marker (SKIP
//! LOCKED on Postgres) and dispatches them through a registry of symbolic
//! function names, so a job row never references code directly. Delivery is
//! at-least-once: a claim abandoned by a crashed worker is recovered after
//! the capture timeout.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::config::SchedulerConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::persistence::{ScheduledJob, Store, StoreError};

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Handler invoked for a claimed job.
pub type JobHandler =
    Arc<dyn Fn(Arc<Engine>, Value) -> BoxFuture<'static, Result<(), EngineError>> + Send + Sync>;

/// Registry of allowed job functions, keyed by the symbolic name persisted
/// on the job row. Populated once at engine construction.
#[derive(Default)]
pub struct JobRegistry {
    handlers: DashMap<String, JobHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, func_name: &str, handler: F)
    where
        F: Fn(Arc<Engine>, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let handler: JobHandler = Arc::new(move |engine, args| Box::pin(handler(engine, args)));
        self.handlers.insert(func_name.to_string(), handler);
    }

    pub fn get(&self, func_name: &str) -> Option<JobHandler> {
        self.handlers.get(func_name).map(|h| Arc::clone(&h))
    }

    pub fn contains(&self, func_name: &str) -> bool {
        self.handlers.contains_key(func_name)
    }
}

/// The delayed-job scheduler.
pub struct Scheduler {
    store: Arc<dyn Store>,
    registry: JobRegistry,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            store,
            registry: JobRegistry::new(),
            config,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Persist a job.
    ///
    /// A keyed job deduplicates: when an unprocessed job with the same key
    /// already exists, the insert is skipped. The check-and-insert runs
    /// under the key's named lock so concurrent schedulers agree.
    #[instrument(skip(self, job), fields(func = %job.func_name))]
    pub async fn schedule(&self, job: ScheduledJob) -> Result<(), SchedulerError> {
        match &job.key {
            None => self.insert_job(&job, None).await,
            Some(key) => {
                let key = key.clone();
                let lock = self
                    .store
                    .acquire_named_lock(&format!("sched-{}", key))
                    .await?;

                let result = self.insert_job(&job, Some(&key)).await;

                if let Err(e) = self.store.release_named_lock(lock).await {
                    warn!("failed to release scheduling lock: {}", e);
                }

                result
            }
        }
    }

    async fn insert_job(
        &self,
        job: &ScheduledJob,
        dedup_key: Option<&str>,
    ) -> Result<(), SchedulerError> {
        let mut tx = self.store.begin(false).await?;

        if let Some(key) = dedup_key {
            if tx.has_scheduled_jobs(key).await? {
                debug!(key, "job already scheduled, skipping");
                tx.rollback().await?;
                return Ok(());
            }
        }

        tx.create_scheduled_job(job).await?;
        tx.commit().await?;

        debug!(job_id = %job.id, run_after = job.run_after, "scheduled job");
        Ok(())
    }

    /// Claim due jobs and run them. Returns how many jobs were claimed.
    pub async fn poll_once(&self, engine: &Arc<Engine>) -> Result<usize, SchedulerError> {
        let claimed = {
            let mut tx = self.store.begin(false).await?;
            let claimed = tx
                .claim_due_scheduled_jobs(Utc::now(), self.config.batch_size)
                .await?;
            tx.commit().await?;
            claimed
        };

        let count = claimed.len();
        for job in claimed {
            self.run_job(engine, job).await;
        }

        Ok(count)
    }

    /// Execute one claimed job and settle its row.
    ///
    /// Success and fatal errors delete the row (fatal ones are logged);
    /// transient errors clear the capture so another poll retries.
    async fn run_job(&self, engine: &Arc<Engine>, job: ScheduledJob) {
        let outcome = match self.registry.get(&job.func_name) {
            Some(handler) => handler(Arc::clone(engine), job.func_args.clone()).await,
            None => {
                error!(func = %job.func_name, "no handler registered for scheduled job");
                self.settle(job.id, JobSettlement::Delete).await;
                return;
            }
        };

        match outcome {
            Ok(()) => self.settle(job.id, JobSettlement::Delete).await,
            Err(e) if e.is_transient() => {
                warn!(job_id = %job.id, func = %job.func_name, "transient job failure, will retry: {}", e);
                self.settle(job.id, JobSettlement::Reset).await;
            }
            Err(e) => {
                error!(job_id = %job.id, func = %job.func_name, "scheduled job failed: {}", e);
                self.settle(job.id, JobSettlement::Delete).await;
            }
        }
    }

    async fn settle(&self, job_id: uuid::Uuid, settlement: JobSettlement) {
        let result = async {
            let mut tx = self.store.begin(false).await?;
            match settlement {
                JobSettlement::Delete => tx.delete_scheduled_job(job_id).await?,
                JobSettlement::Reset => tx.reset_scheduled_job(job_id).await?,
            }
            tx.commit().await
        }
        .await;

        if let Err(e) = result {
            error!(%job_id, "failed to settle scheduled job: {}", e);
        }
    }

    /// Reset captures abandoned by crashed workers.
    pub async fn recover_abandoned(&self) -> Result<u64, SchedulerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.capture_timeout).unwrap_or_default();

        let mut tx = self.store.begin(false).await?;
        let recovered = tx.recover_abandoned_scheduled_jobs(cutoff).await?;
        tx.commit().await?;

        if recovered > 0 {
            warn!(count = recovered, "recovered abandoned scheduled jobs");
        }

        Ok(recovered)
    }
}

#[derive(Clone, Copy)]
enum JobSettlement {
    Delete,
    Reset,
}

/// Spawn the polling and capture-recovery loops.
pub(crate) fn start_loops(
    scheduler: Arc<Scheduler>,
    engine: Arc<Engine>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    {
        let scheduler = Arc::clone(&scheduler);
        let engine = Arc::clone(&engine);
        let mut shutdown_rx = shutdown_rx.clone();
        let delay = scheduler.config.fixed_delay;

        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = scheduler.poll_once(&engine).await {
                            error!("scheduler poll failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Scheduler poll loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Scheduler poll loop exited");
        }));
    }

    {
        let mut shutdown_rx = shutdown_rx.clone();
        let interval = scheduler.config.capture_timeout / 2;

        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = scheduler.recover_abandoned().await {
                            error!("capture recovery failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Capture recovery loop: shutdown requested");
                        break;
                    }
                }
            }

            debug!("Capture recovery loop exited");
        }));
    }

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use serde_json::json;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(MemoryStore::new()), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_keyed_dedup_skips_second_insert() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            Arc::clone(&store) as Arc<dyn Store>,
            SchedulerConfig::default(),
        );

        let job = ScheduledJob::new("noop", json!({}), 60).with_key("integrity-x");
        scheduler.schedule(job).await.expect("should schedule");

        let dup = ScheduledJob::new("noop", json!({}), 60).with_key("integrity-x");
        scheduler.schedule(dup).await.expect("should dedup silently");

        assert_eq!(store.scheduled_job_count().await, 1);
    }

    #[tokio::test]
    async fn test_unkeyed_jobs_are_not_deduped() {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Scheduler::new(
            Arc::clone(&store) as Arc<dyn Store>,
            SchedulerConfig::default(),
        );

        scheduler
            .schedule(ScheduledJob::new("noop", json!({}), 60))
            .await
            .expect("should schedule");
        scheduler
            .schedule(ScheduledJob::new("noop", json!({}), 60))
            .await
            .expect("should schedule");

        assert_eq!(store.scheduled_job_count().await, 2);
    }

    #[test]
    fn test_registry_round_trip() {
        let sched = scheduler();
        assert!(!sched.registry().contains("task.retry"));

        sched
            .registry()
            .register("task.retry", |_engine, _args| async { Ok(()) });

        assert!(sched.registry().contains("task.retry"));
        assert!(sched.registry().get("task.retry").is_some());
        assert!(sched.registry().get("unknown").is_none());
    }
}
