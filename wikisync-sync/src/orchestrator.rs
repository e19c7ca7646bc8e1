//! Update orchestration for one (repository, branch) pair.
//!
//! ## `process_update`
//!
//! 1. Load repository + branch checkpoint.
//! 2. Prepare the workspace (clone/fetch with retry) and read HEAD.
//! 3. HEAD == checkpoint → up to date, nothing written.
//! 4. Diff checkpoint..HEAD (every tracked file when there is no checkpoint).
//! 5. Per language: `generate_full` (no checkpoint) or `apply_incremental`.
//! 6. One store write: branch checkpoint, repository check stamp, task completion.
//! 7. Notify; failures are logged only.
//!
//! Any error before step 6 leaves the checkpoint untouched, so the next run
//! recomputes the same change set.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use wikisync_core::{
    Branch, BranchId, Checkpoint, EnqueueOutcome, NewTask, Repository, RepositoryId, Store, TaskId,
};

use crate::error::{store_err, SyncError};
use crate::generator::WikiGenerator;
use crate::notify::{Notifier, UpdateNotification};
use crate::workspace::{Workspace, WorkspaceManager};

/// How a run treated the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Nothing to regenerate.
    UpToDate,
    /// First run for the branch; every document generated.
    Full,
    /// Changed files applied on top of the previous checkpoint.
    Incremental,
}

/// Result of [`check_for_updates`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCheck {
    pub needs_update: bool,
    pub previous_commit_id: Option<String>,
    pub current_commit_id: String,
    pub changed_files: Vec<String>,
}

/// Result of a successful [`Orchestrator::process_update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub previous_commit_id: Option<String>,
    pub current_commit_id: String,
    pub changed_files_count: usize,
    /// Language variants regenerated.
    pub updated_count: usize,
    pub mode: UpdateMode,
    pub duration: Duration,
}

/// Drives the workspace, the generator and the store for update runs.
pub struct Orchestrator {
    store: Arc<Store>,
    workspaces: WorkspaceManager,
    generator: Arc<dyn WikiGenerator>,
    notifier: Arc<dyn Notifier>,
    manual_trigger_priority: i32,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        workspaces: WorkspaceManager,
        generator: Arc<dyn WikiGenerator>,
        notifier: Arc<dyn Notifier>,
        manual_trigger_priority: i32,
    ) -> Self {
        Self {
            store,
            workspaces,
            generator,
            notifier,
            manual_trigger_priority,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn check_for_updates(
        &self,
        repository_id: &RepositoryId,
        branch_id: &BranchId,
        cancel: &CancellationToken,
    ) -> Result<UpdateCheck, SyncError> {
        check_for_updates(&self.store, &self.workspaces, repository_id, branch_id, cancel)
    }

    /// Bring the wiki of one branch up to date with its remote.
    ///
    /// When `task` is given, its `Processing -> Completed` transition is
    /// written together with the new checkpoint.
    pub fn process_update(
        &self,
        repository_id: &RepositoryId,
        branch_id: &BranchId,
        task: Option<&TaskId>,
        cancel: &CancellationToken,
    ) -> Result<UpdateOutcome, SyncError> {
        let started = Instant::now();
        let (repository, branch) = load_pair(&self.store, repository_id, branch_id)?;
        tracing::info!(
            repository = %repository.full_name(),
            branch = %branch.name,
            task_id = task.map(|id| id.0.as_str()).unwrap_or("-"),
            "processing update"
        );

        let workspace = self.workspaces.prepare_workspace(
            &repository,
            &branch.name,
            branch.last_commit_id.as_deref(),
            cancel,
        )?;
        let result = self.update_workspace(&repository, &branch, &workspace, task, cancel, started);
        self.workspaces.cleanup_workspace(&workspace);

        match &result {
            Ok(outcome) => tracing::info!(
                repository = %repository.full_name(),
                branch = %branch.name,
                mode = ?outcome.mode,
                changed = outcome.changed_files_count,
                updated = outcome.updated_count,
                duration_ms = outcome.duration.as_millis() as u64,
                "update finished"
            ),
            Err(err) => tracing::error!(
                repository = %repository.full_name(),
                branch = %branch.name,
                duration_ms = started.elapsed().as_millis() as u64,
                error = %err,
                "update failed"
            ),
        }
        result
    }

    fn update_workspace(
        &self,
        repository: &Repository,
        branch: &Branch,
        workspace: &Workspace,
        task: Option<&TaskId>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<UpdateOutcome, SyncError> {
        let check = inspect(&self.workspaces, branch, workspace)?;
        let previous = check.previous_commit_id.clone();

        if !check.needs_update {
            if previous.as_deref() != Some(check.current_commit_id.as_str()) {
                // HEAD moved but nothing documentable changed (deletions only).
                self.commit(repository, branch, &check.current_commit_id, task)?;
            }
            return Ok(UpdateOutcome {
                previous_commit_id: previous,
                current_commit_id: check.current_commit_id,
                changed_files_count: 0,
                updated_count: 0,
                mode: UpdateMode::UpToDate,
                duration: started.elapsed(),
            });
        }

        let mode = if workspace.is_incremental() {
            UpdateMode::Incremental
        } else {
            UpdateMode::Full
        };
        if branch.languages.is_empty() {
            tracing::warn!(
                repository = %repository.full_name(),
                branch = %branch.name,
                "branch has no language variants; advancing checkpoint without generating"
            );
        }

        let mut updated_count = 0;
        for language in &branch.languages {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            tracing::info!(
                repository = %repository.full_name(),
                branch = %branch.name,
                language = %language,
                mode = ?mode,
                "generating"
            );
            let generated = match mode {
                UpdateMode::Incremental => {
                    self.generator
                        .apply_incremental(workspace, language, &check.changed_files)
                }
                _ => self.generator.generate_full(workspace, language),
            };
            generated.map_err(|err| SyncError::Generator {
                language: language.clone(),
                message: format!("{err:#}"),
            })?;
            updated_count += 1;
        }

        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let completed_at = self.commit(repository, branch, &check.current_commit_id, task)?;

        let notification = UpdateNotification {
            repository_id: repository.id.clone(),
            repository: repository.full_name(),
            branch: branch.name.clone(),
            previous_commit_id: previous.clone(),
            commit_id: check.current_commit_id.clone(),
            mode,
            summary: UpdateNotification::summarize(mode, check.changed_files.len()),
            changed_files_count: check.changed_files.len(),
            updated_count,
            completed_at,
        };
        if let Err(err) = self.notifier.notify(&notification) {
            tracing::warn!(
                repository = %repository.full_name(),
                branch = %branch.name,
                error = %format!("{err:#}"),
                "notification failed"
            );
        }

        Ok(UpdateOutcome {
            previous_commit_id: previous,
            current_commit_id: check.current_commit_id,
            changed_files_count: check.changed_files.len(),
            updated_count,
            mode,
            duration: started.elapsed(),
        })
    }

    fn commit(
        &self,
        repository: &Repository,
        branch: &Branch,
        commit_id: &str,
        task: Option<&TaskId>,
    ) -> Result<DateTime<Utc>, SyncError> {
        let processed_at = Utc::now();
        self.store
            .commit_checkpoint(Checkpoint {
                repository_id: repository.id.clone(),
                branch_id: branch.id.clone(),
                commit_id: commit_id.to_string(),
                processed_at,
                task_id: task.cloned(),
            })
            .map_err(store_err)?;
        Ok(processed_at)
    }

    pub fn trigger_manual_update(
        &self,
        repository_id: &RepositoryId,
        branch_id: &BranchId,
    ) -> Result<TaskId, SyncError> {
        trigger_manual_update(
            &self.store,
            repository_id,
            branch_id,
            self.manual_trigger_priority,
            Utc::now(),
        )
        .map(|outcome| outcome.task.id)
    }
}

/// Prepare the workspace for a branch and report what changed since its checkpoint.
pub fn check_for_updates(
    store: &Store,
    workspaces: &WorkspaceManager,
    repository_id: &RepositoryId,
    branch_id: &BranchId,
    cancel: &CancellationToken,
) -> Result<UpdateCheck, SyncError> {
    let (repository, branch) = load_pair(store, repository_id, branch_id)?;
    let workspace = workspaces.prepare_workspace(
        &repository,
        &branch.name,
        branch.last_commit_id.as_deref(),
        cancel,
    )?;
    let check = inspect(workspaces, &branch, &workspace);
    workspaces.cleanup_workspace(&workspace);
    check
}

/// Enqueue a high-priority manual task, or return the active one for the pair.
pub fn trigger_manual_update(
    store: &Store,
    repository_id: &RepositoryId,
    branch_id: &BranchId,
    priority: i32,
    now: DateTime<Utc>,
) -> Result<EnqueueOutcome, SyncError> {
    let outcome = store
        .enqueue_task(
            NewTask {
                repository_id: repository_id.clone(),
                branch_id: branch_id.clone(),
                priority,
                is_manual_trigger: true,
            },
            now,
        )
        .map_err(store_err)?;
    if outcome.created {
        tracing::info!(task_id = %outcome.task.id, priority, "manual update queued");
    } else {
        tracing::info!(
            task_id = %outcome.task.id,
            status = %outcome.task.status,
            "update already queued; returning existing task"
        );
    }
    Ok(outcome)
}

fn load_pair(
    store: &Store,
    repository_id: &RepositoryId,
    branch_id: &BranchId,
) -> Result<(Repository, Branch), SyncError> {
    let repository = store.repository(repository_id).map_err(store_err)?;
    let branch = store.branch(branch_id).map_err(store_err)?;
    if branch.repository_id != repository.id {
        return Err(SyncError::not_found("branch", branch_id.0.clone()));
    }
    Ok((repository, branch))
}

fn inspect(
    workspaces: &WorkspaceManager,
    branch: &Branch,
    workspace: &Workspace,
) -> Result<UpdateCheck, SyncError> {
    let previous = branch
        .last_commit_id
        .clone()
        .filter(|commit| !commit.is_empty());
    let current = workspace.commit_id.clone();

    if previous.as_deref() == Some(current.as_str()) {
        tracing::debug!(branch = %branch.name, commit = %current, "already at checkpoint");
        return Ok(UpdateCheck {
            needs_update: false,
            previous_commit_id: previous,
            current_commit_id: current,
            changed_files: Vec::new(),
        });
    }

    let changed_files = workspaces.changed_files(workspace, previous.as_deref(), &current)?;
    Ok(UpdateCheck {
        needs_update: !changed_files.is_empty() || previous.is_none(),
        previous_commit_id: previous,
        current_commit_id: current,
        changed_files,
    })
}
