//! Polling scheduler: drain queued update tasks, then scan for due repositories.
//!
//! ## One iteration (`run_once`)
//!
//! 1. Drain: pending tasks by priority desc, then age. Each is claimed
//!    (`Pending -> Processing`), processed, then completed or failed. A claimed
//!    task always ends terminal unless the run is cancelled; store errors while
//!    finishing one task are logged and the drain moves on.
//! 2. Scan: `Pending` repositories get a task per branch; `Completed`
//!    repositories past their recheck interval get a task per branch and a
//!    fresh `last_update_check_at`.
//!
//! An iteration takes `now` as an argument for its scheduling decisions and
//! holds no timers, so tests can drive it directly. Task transitions are
//! stamped from the scheduler's clock at the moment they happen. [`Scheduler::run`] adds the startup delay, the reconcile
//! pass and the cancellable polling sleep.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use wikisync_core::config::SchedulerConfig;
use wikisync_core::{
    NewTask, Repository, RepositoryId, RepositoryStatus, Store, TaskId, TaskKind, UpdateTask,
};
use wikisync_sync::{Orchestrator, SyncError};

use crate::error::DaemonError;

/// Executes one claimed task and returns the commit it brought the branch to.
pub trait TaskProcessor: Send + Sync {
    fn process(&self, task: &UpdateTask, cancel: &CancellationToken) -> Result<String, SyncError>;
}

impl TaskProcessor for Orchestrator {
    fn process(&self, task: &UpdateTask, cancel: &CancellationToken) -> Result<String, SyncError> {
        self.process_update(&task.repository_id, &task.branch_id, Some(&task.id), cancel)
            .map(|outcome| outcome.current_commit_id)
    }
}

/// Source of transition timestamps.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Counters for one iteration, exposed through the daemon `status` command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IterationReport {
    pub started_at: Option<DateTime<Utc>>,
    pub completed: usize,
    pub failed: usize,
    /// Tasks another worker claimed first.
    pub skipped: usize,
    pub enqueued: usize,
    pub rechecked: usize,
    pub cancelled: bool,
}

pub struct Scheduler {
    store: Arc<Store>,
    processor: Arc<dyn TaskProcessor>,
    config: SchedulerConfig,
    clock: Clock,
    wake: Notify,
    last_iteration: Mutex<Option<IterationReport>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        processor: Arc<dyn TaskProcessor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            clock: Arc::new(Utc::now),
            wake: Notify::new(),
            last_iteration: Mutex::new(None),
        }
    }

    /// Replace the wall clock used for claim and completion timestamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Cut the current polling sleep short (e.g. after a manual trigger).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn last_iteration(&self) -> Option<IterationReport> {
        self.last_iteration
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// One drain + scan pass.
    pub fn run_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<IterationReport, DaemonError> {
        let mut report = IterationReport {
            started_at: Some(now),
            ..IterationReport::default()
        };
        self.drain(cancel, &mut report)?;
        if !report.cancelled {
            self.scan(now, cancel, &mut report)?;
        }
        if let Ok(mut last) = self.last_iteration.lock() {
            *last = Some(report.clone());
        }
        Ok(report)
    }

    /// Process every pending task, highest priority first.
    pub fn drain(
        &self,
        cancel: &CancellationToken,
        report: &mut IterationReport,
    ) -> Result<(), DaemonError> {
        let mut failed_repositories = HashSet::new();
        for pending in self.store.pending_tasks()? {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let task = match self.store.claim_task(&pending.id, self.now()) {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::debug!(task_id = %pending.id, "task no longer pending; skipping");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    tracing::error!(task_id = %pending.id, error = %err, "failed to claim task");
                    report.skipped += 1;
                    continue;
                }
            };
            if !self.process_task(&task, cancel, report, &mut failed_repositories) {
                report.cancelled = true;
                break;
            }
        }
        Ok(())
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Returns `false` when the run was cancelled and the task left `Processing`.
    ///
    /// A repository that failed earlier in the same pass stays `Failed` even
    /// if its other branches succeed.
    fn process_task(
        &self,
        task: &UpdateTask,
        cancel: &CancellationToken,
        report: &mut IterationReport,
        failed_repositories: &mut HashSet<RepositoryId>,
    ) -> bool {
        let repository = match self.store.repository(&task.repository_id) {
            Ok(repository) => repository,
            Err(err) => {
                self.fail_claimed(task, &format!("repository lookup failed: {err}"));
                report.failed += 1;
                return true;
            }
        };
        let mut settles_repository = !failed_repositories.contains(&repository.id)
            && (task.kind == TaskKind::Bootstrap
                || repository.status == RepositoryStatus::Pending);
        if settles_repository {
            if let Err(err) = self.store.set_repository_status(
                &repository.id,
                RepositoryStatus::Processing,
                self.now(),
            ) {
                tracing::warn!(
                    repository = %repository.full_name(),
                    error = %err,
                    "could not mark repository processing"
                );
                settles_repository = false;
            }
        }

        tracing::info!(
            task_id = %task.id,
            repository = %repository.full_name(),
            kind = %task.kind,
            priority = task.priority,
            manual = task.is_manual_trigger,
            "processing task"
        );

        let succeeded = match self.processor.process(task, cancel) {
            Err(SyncError::Cancelled) => {
                tracing::warn!(task_id = %task.id, "cancelled; task left in processing");
                return false;
            }
            Ok(commit) => match self.store.complete_task(&task.id, Some(commit), self.now()) {
                Ok(_) => {
                    report.completed += 1;
                    tracing::info!(task_id = %task.id, "task completed");
                    true
                }
                Err(err) => {
                    tracing::error!(task_id = %task.id, error = %err, "failed to record completion");
                    self.fail_claimed(task, &format!("could not record completion: {err}"));
                    report.failed += 1;
                    false
                }
            },
            Err(err) => {
                if let Some(failed) = self.fail_claimed(task, &err.to_string()) {
                    tracing::error!(
                        task_id = %task.id,
                        repository = %repository.full_name(),
                        retry_count = failed.retry_count,
                        error = %err,
                        "task failed"
                    );
                }
                report.failed += 1;
                false
            }
        };

        if settles_repository {
            if !succeeded {
                failed_repositories.insert(repository.id.clone());
            }
            if let Err(err) = self.settle_repository(&repository.id, succeeded) {
                tracing::error!(
                    repository = %repository.full_name(),
                    error = %err,
                    "failed to settle repository status"
                );
            }
        }
        true
    }

    /// `Processing -> Failed`. A store error here leaves the task for reconcile.
    fn fail_claimed(&self, task: &UpdateTask, message: &str) -> Option<UpdateTask> {
        match self.store.fail_task(&task.id, message, self.now()) {
            Ok(failed) => Some(failed),
            Err(err) => {
                tracing::error!(
                    task_id = %task.id,
                    error = %err,
                    "failed to record task failure; left processing until reconcile"
                );
                None
            }
        }
    }

    fn settle_repository(
        &self,
        repository_id: &RepositoryId,
        succeeded: bool,
    ) -> Result<(), DaemonError> {
        if !succeeded {
            self.store
                .set_repository_status(repository_id, RepositoryStatus::Failed, self.now())?;
            return Ok(());
        }
        let repository = self.store.repository(repository_id)?;
        if repository.status == RepositoryStatus::Processing
            && !self.store.has_active_tasks(repository_id)?
        {
            self.store
                .set_repository_status(repository_id, RepositoryStatus::Completed, self.now())?;
        }
        Ok(())
    }

    /// Enqueue work for new repositories and for repositories due a recheck.
    pub fn scan(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
        report: &mut IterationReport,
    ) -> Result<(), DaemonError> {
        for repository in self
            .store
            .repositories_with_status(RepositoryStatus::Pending)?
        {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            let queued = self.enqueue_branches(&repository, now)?;
            if queued.is_none() {
                tracing::warn!(
                    repository = %repository.full_name(),
                    "pending repository has no branches; marking completed"
                );
                self.store
                    .set_repository_status(&repository.id, RepositoryStatus::Completed, now)?;
            }
            report.enqueued += queued.unwrap_or(0);
        }

        let due = self
            .store
            .due_for_recheck(now, &self.config, self.config.scan_batch_size)?;
        for repository in due {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(());
            }
            report.enqueued += self.enqueue_branches(&repository, now)?.unwrap_or(0);
            self.store.touch_update_check(&repository.id, now)?;
            report.rechecked += 1;
        }
        Ok(())
    }

    /// Scheduled task per branch. `None` when the repository has no branches.
    fn enqueue_branches(
        &self,
        repository: &Repository,
        now: DateTime<Utc>,
    ) -> Result<Option<usize>, DaemonError> {
        let branches = self.store.branches_of(&repository.id)?;
        if branches.is_empty() {
            return Ok(None);
        }
        let mut created = 0;
        for branch in branches {
            let outcome = self.store.enqueue_task(
                NewTask {
                    repository_id: repository.id.clone(),
                    branch_id: branch.id.clone(),
                    priority: 0,
                    is_manual_trigger: false,
                },
                now,
            )?;
            if outcome.created {
                created += 1;
                tracing::debug!(
                    repository = %repository.full_name(),
                    branch = %branch.name,
                    task_id = %outcome.task.id,
                    "scheduled update"
                );
            }
        }
        Ok(Some(created))
    }

    /// Fail tasks a previous daemon left in `Processing` and return their
    /// repositories to `Pending` so the next scan bootstraps them again.
    pub fn reconcile(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, DaemonError> {
        let recovered = self.store.recover_interrupted_tasks(now)?;
        for task_id in &recovered {
            tracing::warn!(task_id = %task_id, "task interrupted by previous shutdown; marked failed");
        }
        for repository in self
            .store
            .repositories_with_status(RepositoryStatus::Processing)?
        {
            tracing::warn!(
                repository = %repository.full_name(),
                "repository left processing by previous shutdown; requeueing"
            );
            self.store
                .set_repository_status(&repository.id, RepositoryStatus::Pending, now)?;
        }
        Ok(recovered)
    }

    /// Startup delay, reconcile, then iterate until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), DaemonError> {
        let startup_delay = Duration::from_secs(self.config.startup_delay_secs);
        if !startup_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(startup_delay) => {}
            }
        }

        let scheduler = Arc::clone(&self);
        tokio::task::spawn_blocking(move || scheduler.reconcile(Utc::now()))
            .await
            .map_err(|err| DaemonError::Protocol(format!("reconcile join error: {err}")))??;

        tracing::info!(
            polling_interval_secs = self.config.polling_interval_secs,
            "scheduler started"
        );
        loop {
            let scheduler = Arc::clone(&self);
            let token = cancel.clone();
            match tokio::task::spawn_blocking(move || scheduler.run_once(Utc::now(), &token)).await
            {
                Ok(Ok(report)) => tracing::debug!(
                    completed = report.completed,
                    failed = report.failed,
                    enqueued = report.enqueued,
                    rechecked = report.rechecked,
                    "scheduler iteration finished"
                ),
                Ok(Err(err)) => tracing::error!(error = %err, "scheduler iteration failed"),
                Err(err) => tracing::error!(error = %err, "scheduler iteration panicked"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.polling_interval()) => {}
            }
        }
        tracing::info!("scheduler stopped");
        Ok(())
    }
}
