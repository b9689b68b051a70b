//! Job acquisition and execution.
//!
//! A [`JobExecutor`] repeatedly asks the store for due jobs, takes a lease
//! on each through the same optimistic-revision discipline as any other
//! write, and runs every acquired job in its own command. A handler
//! failure is recorded on the job and never aborts its batch siblings; a
//! crashed acquirer simply lets its lease expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::commands::ExecuteJob;
use crate::engine::ProcessEngine;
use crate::entity::Job;
use crate::error::{EngineError, EngineResult, StoreError};
use crate::events::EngineEvent;
use crate::store::{EntityRecord, FlushBatch, UpdateRecord};

#[derive(Clone, Debug)]
pub struct JobExecutorConfig {
    /// Jobs fetched per acquisition cycle.
    pub batch_size: usize,
    /// Lease length written into acquired jobs.
    pub lock_duration: chrono::Duration,
    /// Tick interval of the background loop.
    pub poll_interval: Duration,
    /// Identity written as lock owner.
    pub lock_owner: String,
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            lock_duration: chrono::Duration::minutes(5),
            poll_interval: Duration::from_millis(100),
            lock_owner: format!("job-executor-{}", Uuid::now_v7()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AcquisitionSummary {
    pub acquired: usize,
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub struct JobExecutor {
    engine: Arc<ProcessEngine>,
    config: JobExecutorConfig,
}

impl JobExecutor {
    pub fn new(engine: Arc<ProcessEngine>, config: JobExecutorConfig) -> Self {
        Self { engine, config }
    }

    /// One acquisition cycle: fetch due jobs, lock and run up to `max` of
    /// them. Exclusive jobs of an instance that already holds a locked
    /// exclusive job are skipped, within this batch and across acquirers.
    pub async fn acquire_and_run_due_jobs(&self, max: usize) -> EngineResult<AcquisitionSummary> {
        let store = self.engine.store();
        let now = self.engine.clock().now();
        let candidates = store.due_jobs(now, max).await?;
        let mut exclusive_held = store.instances_with_locked_exclusive_jobs(now).await?;
        let mut summary = AcquisitionSummary::default();

        for candidate in candidates {
            if candidate.exclusive {
                if let Some(instance) = candidate.process_instance_id {
                    if exclusive_held.contains(&instance) {
                        debug!(job_id = %candidate.id, %instance, "exclusive job held back");
                        summary.skipped += 1;
                        continue;
                    }
                }
            }

            let now = self.engine.clock().now();
            let Some(locked) = self.try_lock(&candidate, now).await? else {
                summary.skipped += 1;
                continue;
            };
            summary.acquired += 1;
            if locked.exclusive {
                if let Some(instance) = locked.process_instance_id {
                    exclusive_held.insert(instance);
                }
            }

            match self
                .engine
                .execute_command(&ExecuteJob { job_id: locked.id })
                .await
            {
                Ok(()) => summary.executed += 1,
                Err(err) => {
                    // Never abort the rest of the batch.
                    summary.failed += 1;
                    warn!(job_id = %locked.id, error = %err, "job handler failed");
                    let failure = EngineError::HandlerFailure(err.to_string());
                    self.record_failure(locked.id, &failure).await;
                }
            }
        }
        Ok(summary)
    }

    /// Write the lease with a revision check; losing the race to another
    /// acquirer is a skip, not an error.
    async fn try_lock(&self, candidate: &Job, now: DateTime<Utc>) -> EngineResult<Option<Job>> {
        let store = self.engine.store();
        let Some(fresh) = store.find_job(candidate.id).await? else {
            return Ok(None);
        };
        if !fresh.is_acquirable(now) {
            return Ok(None);
        }
        let mut locked = fresh.clone();
        locked.lock_owner = Some(self.config.lock_owner.clone());
        locked.lock_expiration = Some(now + self.config.lock_duration);
        locked.revision = fresh.revision + 1;

        let batch = FlushBatch {
            updates: vec![UpdateRecord {
                entity: EntityRecord::Job(locked.clone()),
                expected_revision: fresh.revision,
            }],
            ..Default::default()
        };
        match store.apply(batch).await {
            Ok(()) => Ok(Some(locked)),
            Err(StoreError::Conflict { .. } | StoreError::NotFound { .. }) => Ok(None),
            Err(other) => Err(EngineError::Store(other)),
        }
    }

    /// Record a handler failure on the job in its own small write:
    /// decrement retries, remember the error, release the lease. At zero
    /// retries the job is dead and leaves the acquisition query.
    async fn record_failure(&self, job_id: Uuid, failure: &EngineError) {
        let store = self.engine.store();
        for _ in 0..3 {
            let fresh = match store.find_job(job_id).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) => return,
                Err(err) => {
                    error!(%job_id, error = %err, "could not load failed job");
                    return;
                }
            };
            let mut updated = fresh.clone();
            updated.retries = (fresh.retries - 1).max(0);
            updated.last_failure = Some(failure.to_string());
            updated.lock_owner = None;
            updated.lock_expiration = None;
            updated.revision = fresh.revision + 1;
            let retries_left = updated.retries;

            let batch = FlushBatch {
                updates: vec![UpdateRecord {
                    entity: EntityRecord::Job(updated),
                    expected_revision: fresh.revision,
                }],
                ..Default::default()
            };
            match store.apply(batch).await {
                Ok(()) => {
                    self.engine.publish(&EngineEvent::JobFailed {
                        job_id,
                        retries_left,
                        error: failure.to_string(),
                    });
                    if retries_left == 0 {
                        error!(%job_id, "job is dead: retries exhausted");
                        self.engine.publish(&EngineEvent::JobDead { job_id });
                    }
                    return;
                }
                Err(StoreError::Conflict { .. }) => continue,
                Err(err) => {
                    error!(%job_id, error = %err, "could not record job failure");
                    return;
                }
            }
        }
        error!(%job_id, "gave up recording job failure after repeated conflicts");
    }

    /// Background acquisition loop; returns a handle for shutdown.
    pub fn start(self: Arc<Self>) -> JobExecutorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let executor = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            info!(
                batch_size = executor.config.batch_size,
                poll_interval_ms = executor.config.poll_interval.as_millis(),
                "job executor started"
            );
            let mut ticker = interval(executor.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match executor
                            .acquire_and_run_due_jobs(executor.config.batch_size)
                            .await
                        {
                            Ok(summary) if summary.acquired > 0 => {
                                debug!(?summary, "acquisition cycle done");
                            }
                            Ok(_) => {}
                            Err(err) => error!(error = %err, "acquisition cycle failed"),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("job executor shutting down");
                            break;
                        }
                    }
                }
            }
        });
        JobExecutorHandle {
            shutdown_tx,
            handle,
        }
    }
}

pub struct JobExecutorHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JobExecutorHandle {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) {
        self.trigger_shutdown();
        let _ = self.handle.await;
    }
}
