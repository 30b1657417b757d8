use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{StoreError, SyncError};
use crate::models::User;
use crate::sync::{Pipeline, RunReport};

/// Users with a run in flight. A user appears at most once.
#[derive(Default)]
pub struct RunLocks {
    running: Mutex<HashSet<String>>,
}

/// Held for the duration of one user's run; releases the lock on drop.
pub struct RunGuard {
    locks: Arc<RunLocks>,
    user_id: String,
}

impl RunLocks {
    pub fn try_acquire(self: &Arc<Self>, user_id: &str) -> Option<RunGuard> {
        if !self.running.lock().insert(user_id.to_string()) {
            return None;
        }
        Some(RunGuard {
            locks: Arc::clone(self),
            user_id: user_id.to_string(),
        })
    }

    pub fn is_running(&self, user_id: &str) -> bool {
        self.running.lock().contains(user_id)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.locks.running.lock().remove(&self.user_id);
    }
}

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("user {0} not found")]
    NotFound(String),

    #[error("user {0} is not active or has not authorized Last.fm")]
    NotEligible(String),

    #[error("a run for user {0} is in progress")]
    Busy(String),

    #[error(transparent)]
    Run(SyncError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OperatorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => OperatorError::NotFound(id),
            other => OperatorError::Store(other),
        }
    }
}

impl From<SyncError> for OperatorError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::NotEligible(id) => OperatorError::NotEligible(id),
            SyncError::Store(StoreError::NotFound(id)) => OperatorError::NotFound(id),
            other => OperatorError::Run(other),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub eligible: usize,
    pub busy: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub scrobbled: usize,
}

/// Drives the pipeline for every eligible user on a fixed cadence. Scheduled
/// and operator-triggered runs share the lock table and the worker pool.
/// Every run lives on a task tracked by the scheduler, so it is never cut
/// short by whoever asked for it going away.
#[derive(Clone)]
pub struct Scheduler {
    pipeline: Pipeline,
    locks: Arc<RunLocks>,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    interval: Duration,
}

impl Scheduler {
    pub fn new(pipeline: Pipeline) -> Self {
        let config = pipeline.config();
        Self {
            locks: Arc::new(RunLocks::default()),
            workers: Arc::new(Semaphore::new(config.workers)),
            tasks: TaskTracker::new(),
            interval: config.interval,
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn locks(&self) -> &Arc<RunLocks> {
        &self.locks
    }

    /// Fires a tick every interval until `shutdown` is cancelled. Each wave
    /// runs on its own task so a slow wave never delays the next tick.
    pub async fn run_forever(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("scheduler started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let scheduler = self.clone();
                    self.tasks.spawn(async move {
                        scheduler.tick().await;
                    });
                }
            }
        }

        self.workers.close();
    }

    /// Waits for every spawned tick and run to finish. Runs that have not
    /// started yet give up once `run_forever` has stopped.
    pub async fn drain(&self) {
        self.tasks.close();
        if !self.tasks.is_empty() {
            tracing::info!("waiting for {} in-flight runs", self.tasks.len());
        }
        self.tasks.wait().await;
    }

    /// One wave over all eligible users. Users whose previous run is still
    /// going are skipped.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        let users = match self.pipeline.store().eligible_users().await {
            Ok(users) => users,
            Err(e) => {
                tracing::error!("failed to load eligible users: {}", e);
                return summary;
            }
        };
        summary.eligible = users.len();

        let mut runs = JoinSet::new();
        for user in users {
            let Some(guard) = self.locks.try_acquire(&user.id) else {
                tracing::debug!("user {} still running, skipping this tick", user.id);
                summary.busy += 1;
                continue;
            };
            let scheduler = self.clone();
            runs.spawn(async move { scheduler.run_locked(&user.id, guard).await });
        }

        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    summary.succeeded += 1;
                    summary.scrobbled += report.scrobbled;
                    if report.partial {
                        summary.partial += 1;
                    }
                }
                Ok(Err(_)) => summary.failed += 1,
                Err(e) => {
                    tracing::error!("run task panicked: {}", e);
                    summary.failed += 1;
                }
            }
        }

        tracing::info!(
            "tick complete. Eligible: {}, Busy: {}, Succeeded: {}, Partial: {}, Failed: {}, Scrobbled: {}",
            summary.eligible,
            summary.busy,
            summary.succeeded,
            summary.partial,
            summary.failed,
            summary.scrobbled
        );
        summary
    }

    /// Operator "run now"; refuses instead of waiting when a run is in flight.
    pub async fn run_now(&self, user_id: &str) -> Result<RunReport, OperatorError> {
        let guard = self
            .locks
            .try_acquire(user_id)
            .ok_or_else(|| OperatorError::Busy(user_id.to_string()))?;

        let scheduler = self.clone();
        let id = user_id.to_string();
        let run = self
            .tasks
            .spawn(async move { scheduler.run_locked(&id, guard).await });

        let report = run
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))??;
        Ok(report)
    }

    /// Operator enable/disable, serialized with runs through the same lock.
    pub async fn set_active(&self, user_id: &str, active: bool) -> Result<User, OperatorError> {
        let _guard = self
            .locks
            .try_acquire(user_id)
            .ok_or_else(|| OperatorError::Busy(user_id.to_string()))?;
        let user = self.pipeline.store().set_active(user_id, active).await?;
        tracing::info!("user {} set active={}", user_id, active);
        Ok(user)
    }

    /// Waits for a worker slot, then reloads the user so the run sees the
    /// latest watermark and activation state.
    async fn run_locked(&self, user_id: &str, _guard: RunGuard) -> Result<RunReport, SyncError> {
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| SyncError::Cancelled)?;

        let user = self.pipeline.store().get_user(user_id).await?;
        if !user.is_eligible() {
            return Err(SyncError::NotEligible(user.id));
        }
        self.pipeline.execute(&user).await
    }
}
