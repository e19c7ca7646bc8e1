//! Durable store for repositories, branches and update tasks.
//!
//! # Storage layout
//!
//! ```text
//! ~/.wikisync/
//!   config.yaml   (optional, see crate::config)
//!   state.json    (repositories + branches + tasks: mode 0600)
//! ```
//!
//! # Write protocol
//!
//! Every mutation runs under two locks: the in-process mutex, then an advisory
//! lock on `state.lock` shared with every other process on the same home (the
//! daemon and one-shot CLI invocations). Under both: read `state.json`, apply
//! the change, write `state.json.<pid>.tmp`, `chmod 0600`, `rename`.
//! Re-reading on each operation keeps a long-running daemon in step with
//! one-shot CLI writes. Conditional transitions (dedup-then-insert,
//! `Pending -> Processing` claim, checkpoint + task completion) happen inside a
//! single mutation, so they are atomic with respect to every other writer.
//!
//! Tests must use [`Store::open_at`] with a `TempDir`, never [`Store::open`].

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use fslock::LockFile;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{io_err, StoreError};
use crate::paths;
use crate::types::{
    parse_git_url, Branch, BranchId, Credentials, Repository, RepositoryId, RepositoryStatus,
    TaskId, TaskKind, TaskStatus, UpdateTask,
};

const STATE_VERSION: u32 = 1;

/// On-disk payload of `state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub repositories: Vec<Repository>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub tasks: Vec<UpdateTask>,
}

/// Input for [`Store::add_repository`].
#[derive(Debug, Clone, Default)]
pub struct NewRepository {
    pub git_url: String,
    pub credentials: Option<Credentials>,
    pub is_public: bool,
    pub update_interval_minutes: Option<u32>,
}

/// Input for [`Store::enqueue_task`].
#[derive(Debug, Clone)]
pub struct NewTask {
    pub repository_id: RepositoryId,
    pub branch_id: BranchId,
    pub priority: i32,
    pub is_manual_trigger: bool,
}

/// Result of a deduplicated enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub task: UpdateTask,
    /// `false` when an active task already existed and was returned instead.
    pub created: bool,
}

/// A fully processed commit to record for a branch.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub repository_id: RepositoryId,
    pub branch_id: BranchId,
    pub commit_id: String,
    pub processed_at: DateTime<Utc>,
    /// Task completed in the same write, when the run belongs to one.
    pub task_id: Option<TaskId>,
}

/// File-backed store. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct Store {
    path: PathBuf,
    lock_path: PathBuf,
    lock: Mutex<()>,
}

impl Store {
    /// Open (or lazily create) the store under `<home>/.wikisync/`.
    pub fn open_at(home: &Path) -> Result<Self, StoreError> {
        let root = paths::wikisync_root(home);
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
            set_dir_permissions(&root)?;
        }
        Ok(Self {
            path: paths::state_path(home),
            lock_path: paths::state_lock_path(home),
            lock: Mutex::new(()),
        })
    }

    /// `open_at` convenience wrapper.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(&paths::home()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent copy of the whole state.
    pub fn snapshot(&self) -> Result<StateFile, StoreError> {
        let _guard = self.guard();
        self.read()
    }

    // -----------------------------------------------------------------------
    // Repositories
    // -----------------------------------------------------------------------

    /// Register a repository. Idempotent on `git_url`.
    pub fn add_repository(
        &self,
        new: NewRepository,
        now: DateTime<Utc>,
    ) -> Result<Repository, StoreError> {
        let (org_name, repo_name) = parse_git_url(&new.git_url)?;
        self.mutate(|state| {
            if let Some(existing) = state
                .repositories
                .iter()
                .find(|r| r.git_url == new.git_url)
            {
                return Ok(existing.clone());
            }
            let repository = Repository {
                id: RepositoryId::generate(),
                git_url: new.git_url,
                org_name,
                repo_name,
                credentials: new.credentials,
                is_public: new.is_public,
                status: RepositoryStatus::Pending,
                update_interval_minutes: new.update_interval_minutes,
                last_update_check_at: None,
                created_at: now,
                updated_at: now,
            };
            state.repositories.push(repository.clone());
            Ok(repository)
        })
    }

    pub fn repository(&self, id: &RepositoryId) -> Result<Repository, StoreError> {
        let state = self.snapshot()?;
        state
            .repositories
            .into_iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| StoreError::not_found("repository", id.0.clone()))
    }

    /// Resolve a repository by id, `org/repo` (case-insensitive) or git URL.
    pub fn resolve_repository(&self, reference: &str) -> Result<Repository, StoreError> {
        let state = self.snapshot()?;
        let wanted = reference.trim();
        state
            .repositories
            .into_iter()
            .find(|r| {
                r.id.0 == wanted
                    || r.git_url == wanted
                    || r.full_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| StoreError::not_found("repository", wanted))
    }

    /// All repositories, oldest first.
    pub fn list_repositories(&self) -> Result<Vec<Repository>, StoreError> {
        let mut repositories = self.snapshot()?.repositories;
        repositories.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(repositories)
    }

    /// Repositories in `status`, oldest first.
    pub fn repositories_with_status(
        &self,
        status: RepositoryStatus,
    ) -> Result<Vec<Repository>, StoreError> {
        let mut repositories = self.list_repositories()?;
        repositories.retain(|r| r.status == status);
        Ok(repositories)
    }

    pub fn set_repository_status(
        &self,
        id: &RepositoryId,
        status: RepositoryStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            let repository = find_repository_mut(state, id)?;
            repository.status = status;
            repository.updated_at = now;
            Ok(())
        })
    }

    /// Record that the scanner looked at this repository.
    pub fn touch_update_check(
        &self,
        id: &RepositoryId,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            let repository = find_repository_mut(state, id)?;
            repository.last_update_check_at = Some(now);
            repository.updated_at = now;
            Ok(())
        })
    }

    /// `Completed` repositories whose recheck interval has elapsed, least
    /// recently checked first, at most `limit`.
    pub fn due_for_recheck(
        &self,
        now: DateTime<Utc>,
        scheduler: &SchedulerConfig,
        limit: usize,
    ) -> Result<Vec<Repository>, StoreError> {
        let mut due: Vec<Repository> = self
            .snapshot()?
            .repositories
            .into_iter()
            .filter(|r| r.status == RepositoryStatus::Completed)
            .filter(|r| match r.last_update_check_at {
                None => true,
                Some(checked) => {
                    let minutes = scheduler.recheck_interval_minutes(r.update_interval_minutes);
                    checked + Duration::minutes(i64::from(minutes)) <= now
                }
            })
            .collect();
        due.sort_by(|a, b| {
            a.last_update_check_at
                .cmp(&b.last_update_check_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    // -----------------------------------------------------------------------
    // Branches
    // -----------------------------------------------------------------------

    /// Add a branch to a repository. Idempotent on name; new languages merge in.
    pub fn add_branch(
        &self,
        repository_id: &RepositoryId,
        name: &str,
        languages: &[String],
        now: DateTime<Utc>,
    ) -> Result<Branch, StoreError> {
        self.mutate(|state| {
            find_repository_mut(state, repository_id)?;
            if let Some(existing) = state
                .branches
                .iter_mut()
                .find(|b| &b.repository_id == repository_id && b.name == name)
            {
                for language in languages {
                    if !existing.languages.contains(language) {
                        existing.languages.push(language.clone());
                    }
                }
                return Ok(existing.clone());
            }
            let mut unique = Vec::new();
            for language in languages {
                if !unique.contains(language) {
                    unique.push(language.clone());
                }
            }
            let branch = Branch {
                id: BranchId::generate(),
                repository_id: repository_id.clone(),
                name: name.to_string(),
                languages: unique,
                last_commit_id: None,
                last_processed_at: None,
                created_at: now,
            };
            state.branches.push(branch.clone());
            Ok(branch)
        })
    }

    pub fn branch(&self, id: &BranchId) -> Result<Branch, StoreError> {
        self.snapshot()?
            .branches
            .into_iter()
            .find(|b| &b.id == id)
            .ok_or_else(|| StoreError::not_found("branch", id.0.clone()))
    }

    pub fn find_branch(
        &self,
        repository_id: &RepositoryId,
        name: &str,
    ) -> Result<Branch, StoreError> {
        self.snapshot()?
            .branches
            .into_iter()
            .find(|b| &b.repository_id == repository_id && b.name == name)
            .ok_or_else(|| StoreError::not_found("branch", name))
    }

    /// Branches of a repository, sorted by name.
    pub fn branches_of(&self, repository_id: &RepositoryId) -> Result<Vec<Branch>, StoreError> {
        let mut branches: Vec<Branch> = self
            .snapshot()?
            .branches
            .into_iter()
            .filter(|b| &b.repository_id == repository_id)
            .collect();
        branches.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(branches)
    }

    /// Advance a branch checkpoint, the repository recheck stamp and,
    /// optionally, complete the owning task, all in one write.
    pub fn commit_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.mutate(|state| {
            let branch = state
                .branches
                .iter_mut()
                .find(|b| b.id == checkpoint.branch_id)
                .ok_or_else(|| StoreError::not_found("branch", checkpoint.branch_id.0.clone()))?;
            branch.last_commit_id = Some(checkpoint.commit_id.clone());
            branch.last_processed_at = Some(checkpoint.processed_at);

            let repository = find_repository_mut(state, &checkpoint.repository_id)?;
            repository.last_update_check_at = Some(checkpoint.processed_at);
            repository.updated_at = checkpoint.processed_at;

            if let Some(task_id) = &checkpoint.task_id {
                let task = find_task_mut(state, task_id)?;
                complete(task, Some(checkpoint.commit_id.clone()), checkpoint.processed_at)?;
            }
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Insert a task unless the pair already has an active one.
    ///
    /// `previous_commit_id` and `kind` are taken from the branch checkpoint at
    /// enqueue time.
    pub fn enqueue_task(
        &self,
        new: NewTask,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, StoreError> {
        self.mutate(|state| {
            let branch = state
                .branches
                .iter()
                .find(|b| b.id == new.branch_id && b.repository_id == new.repository_id)
                .ok_or_else(|| StoreError::not_found("branch", new.branch_id.0.clone()))?;
            let checkpoint = branch.last_commit_id.clone();

            if let Some(existing) = state.tasks.iter().find(|t| {
                t.repository_id == new.repository_id && t.branch_id == new.branch_id && t.is_active()
            }) {
                return Ok(EnqueueOutcome {
                    task: existing.clone(),
                    created: false,
                });
            }

            let task = UpdateTask {
                id: TaskId::generate(),
                repository_id: new.repository_id,
                branch_id: new.branch_id,
                kind: TaskKind::for_checkpoint(checkpoint.as_deref()),
                previous_commit_id: checkpoint,
                target_commit_id: None,
                status: TaskStatus::Pending,
                priority: new.priority,
                is_manual_trigger: new.is_manual_trigger,
                retry_count: 0,
                error_message: None,
                created_at: now,
                started_at: None,
                completed_at: None,
            };
            state.tasks.push(task.clone());
            Ok(EnqueueOutcome {
                task,
                created: true,
            })
        })
    }

    pub fn task(&self, id: &TaskId) -> Result<UpdateTask, StoreError> {
        self.snapshot()?
            .tasks
            .into_iter()
            .find(|t| &t.id == id)
            .ok_or_else(|| StoreError::not_found("task", id.0.clone()))
    }

    /// The `Pending`/`Processing` task for a pair, if any.
    pub fn active_task(
        &self,
        repository_id: &RepositoryId,
        branch_id: &BranchId,
    ) -> Result<Option<UpdateTask>, StoreError> {
        Ok(self.snapshot()?.tasks.into_iter().find(|t| {
            &t.repository_id == repository_id && &t.branch_id == branch_id && t.is_active()
        }))
    }

    pub fn has_active_tasks(&self, repository_id: &RepositoryId) -> Result<bool, StoreError> {
        Ok(self
            .snapshot()?
            .tasks
            .iter()
            .any(|t| &t.repository_id == repository_id && t.is_active()))
    }

    /// `Pending` tasks in drain order: priority descending, then FIFO.
    pub fn pending_tasks(&self) -> Result<Vec<UpdateTask>, StoreError> {
        let mut pending: Vec<UpdateTask> = self
            .snapshot()?
            .tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(pending)
    }

    /// Task history of a repository, newest first.
    pub fn tasks_for_repository(
        &self,
        repository_id: &RepositoryId,
    ) -> Result<Vec<UpdateTask>, StoreError> {
        let mut tasks: Vec<UpdateTask> = self
            .snapshot()?
            .tasks
            .into_iter()
            .filter(|t| &t.repository_id == repository_id)
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    /// Conditional `Pending -> Processing`. Returns `None` when the task is no
    /// longer pending (another worker claimed or finished it).
    pub fn claim_task(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<UpdateTask>, StoreError> {
        self.mutate(|state| {
            let task = find_task_mut(state, id)?;
            if task.status != TaskStatus::Pending {
                return Ok(None);
            }
            task.status = TaskStatus::Processing;
            task.started_at = Some(now);
            task.error_message = None;
            Ok(Some(task.clone()))
        })
    }

    /// `Processing -> Completed`. Completing an already completed task is a no-op.
    pub fn complete_task(
        &self,
        id: &TaskId,
        target_commit_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<UpdateTask, StoreError> {
        self.mutate(|state| {
            let task = find_task_mut(state, id)?;
            complete(task, target_commit_id, now)?;
            Ok(task.clone())
        })
    }

    /// `Processing -> Failed`, incrementing `retry_count`.
    pub fn fail_task(
        &self,
        id: &TaskId,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<UpdateTask, StoreError> {
        self.mutate(|state| {
            let task = find_task_mut(state, id)?;
            match task.status {
                TaskStatus::Processing => {
                    task.status = TaskStatus::Failed;
                    task.retry_count += 1;
                    task.error_message = Some(error_message.to_string());
                    task.completed_at = Some(now);
                    Ok(task.clone())
                }
                TaskStatus::Failed => Ok(task.clone()),
                from => Err(StoreError::InvalidTransition {
                    task: task.id.0.clone(),
                    from,
                    to: TaskStatus::Failed,
                }),
            }
        })
    }

    /// Fail every task left `Processing` by a process that no longer runs.
    ///
    /// Only call this when no scheduler is active against the same state file.
    pub fn recover_interrupted_tasks(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskId>, StoreError> {
        self.mutate(|state| {
            let mut recovered = Vec::new();
            for task in state
                .tasks
                .iter_mut()
                .filter(|t| t.status == TaskStatus::Processing)
            {
                task.status = TaskStatus::Failed;
                task.retry_count += 1;
                task.error_message = Some("interrupted before completion".to_string());
                task.completed_at = Some(now);
                recovered.push(task.id.clone());
            }
            Ok(recovered)
        })
    }

    // -----------------------------------------------------------------------
    // File plumbing
    // -----------------------------------------------------------------------

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut StateFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.guard();
        let _file_lock = self.lock_file()?;
        let mut state = self.read()?;
        let value = apply(&mut state)?;
        self.write(&state)?;
        Ok(value)
    }

    /// Blocks until no other process is mid-mutation. Released on drop.
    fn lock_file(&self) -> Result<LockFile, StoreError> {
        let mut file =
            LockFile::open(self.lock_path.as_path()).map_err(|e| io_err(&self.lock_path, e))?;
        file.lock().map_err(|e| io_err(&self.lock_path, e))?;
        Ok(file)
    }

    fn read(&self) -> Result<StateFile, StoreError> {
        if !self.path.exists() {
            return Ok(StateFile {
                version: STATE_VERSION,
                ..StateFile::default()
            });
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        serde_json::from_str(&contents).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Write flow: serialize → `state.json.<pid>.tmp` → `chmod 0600` → `rename`.
    fn write(&self, state: &StateFile) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
        set_file_permissions(&tmp)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension(format!("json.{}.tmp", std::process::id()))
}

fn find_repository_mut<'a>(
    state: &'a mut StateFile,
    id: &RepositoryId,
) -> Result<&'a mut Repository, StoreError> {
    state
        .repositories
        .iter_mut()
        .find(|r| &r.id == id)
        .ok_or_else(|| StoreError::not_found("repository", id.0.clone()))
}

fn find_task_mut<'a>(
    state: &'a mut StateFile,
    id: &TaskId,
) -> Result<&'a mut UpdateTask, StoreError> {
    state
        .tasks
        .iter_mut()
        .find(|t| &t.id == id)
        .ok_or_else(|| StoreError::not_found("task", id.0.clone()))
}

fn complete(
    task: &mut UpdateTask,
    target_commit_id: Option<String>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match task.status {
        TaskStatus::Processing => {
            task.status = TaskStatus::Completed;
            task.target_commit_id = target_commit_id;
            task.error_message = None;
            task.completed_at = Some(now);
            Ok(())
        }
        TaskStatus::Completed => Ok(()),
        from => Err(StoreError::InvalidTransition {
            task: task.id.0.clone(),
            from,
            to: TaskStatus::Completed,
        }),
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_store() -> (TempDir, Store) {
        let home = TempDir::new().expect("tempdir");
        let store = Store::open_at(home.path()).expect("open");
        (home, store)
    }

    fn seed(store: &Store) -> (Repository, Branch) {
        let now = Utc::now();
        let repo = store
            .add_repository(
                NewRepository {
                    git_url: "https://example.com/acme/widgets.git".into(),
                    is_public: true,
                    ..NewRepository::default()
                },
                now,
            )
            .expect("add repository");
        let branch = store
            .add_branch(&repo.id, "main", &["en".to_string()], now)
            .expect("add branch");
        (repo, branch)
    }

    fn new_task(repo: &Repository, branch: &Branch, priority: i32) -> NewTask {
        NewTask {
            repository_id: repo.id.clone(),
            branch_id: branch.id.clone(),
            priority,
            is_manual_trigger: priority > 0,
        }
    }

    #[test]
    fn empty_store_reads_as_empty_state() {
        let (_home, store) = make_store();
        let state = store.snapshot().expect("snapshot");
        assert_eq!(state.version, STATE_VERSION);
        assert!(state.repositories.is_empty());
        assert!(!store.path().exists(), "reads must not create the file");
    }

    #[test]
    fn add_repository_derives_names_and_is_idempotent() {
        let (_home, store) = make_store();
        let (repo, _) = seed(&store);
        assert_eq!(repo.full_name(), "acme/widgets");
        assert_eq!(repo.status, RepositoryStatus::Pending);

        let again = store
            .add_repository(
                NewRepository {
                    git_url: repo.git_url.clone(),
                    ..NewRepository::default()
                },
                Utc::now(),
            )
            .expect("re-add");
        assert_eq!(again.id, repo.id);
        assert_eq!(store.list_repositories().unwrap().len(), 1);
    }

    #[test]
    fn add_branch_merges_languages() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let merged = store
            .add_branch(&repo.id, "main", &["zh".to_string(), "en".to_string()], Utc::now())
            .expect("re-add branch");
        assert_eq!(merged.id, branch.id);
        assert_eq!(merged.languages, vec!["en".to_string(), "zh".to_string()]);
    }

    #[test]
    fn add_branch_to_unknown_repository_fails() {
        let (_home, store) = make_store();
        let err = store
            .add_branch(&RepositoryId::from("missing"), "main", &[], Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "repository", .. }));
    }

    #[test]
    fn resolve_repository_by_name_id_and_url() {
        let (_home, store) = make_store();
        let (repo, _) = seed(&store);
        assert_eq!(store.resolve_repository("ACME/Widgets").unwrap().id, repo.id);
        assert_eq!(store.resolve_repository(&repo.id.0).unwrap().id, repo.id);
        assert_eq!(store.resolve_repository(&repo.git_url).unwrap().id, repo.id);
        assert!(store.resolve_repository("acme/gadgets").is_err());
    }

    #[test]
    fn enqueue_dedups_active_tasks() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);

        let first = store.enqueue_task(new_task(&repo, &branch, 100), Utc::now()).unwrap();
        let second = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task.id, second.task.id);
        assert_eq!(first.task.kind, TaskKind::Bootstrap);
        assert_eq!(store.snapshot().unwrap().tasks.len(), 1);
    }

    #[test]
    fn enqueue_after_terminal_creates_new_task() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let now = Utc::now();

        let first = store.enqueue_task(new_task(&repo, &branch, 0), now).unwrap().task;
        store.claim_task(&first.id, now).unwrap().expect("claimed");
        store.fail_task(&first.id, "boom", now).unwrap();

        let second = store.enqueue_task(new_task(&repo, &branch, 0), now).unwrap();
        assert!(second.created);
        assert_ne!(second.task.id, first.id);
        assert_eq!(second.task.retry_count, 0);
    }

    #[test]
    fn enqueue_seeds_previous_commit_from_checkpoint() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        store
            .commit_checkpoint(Checkpoint {
                repository_id: repo.id.clone(),
                branch_id: branch.id.clone(),
                commit_id: "c1".into(),
                processed_at: Utc::now(),
                task_id: None,
            })
            .unwrap();

        let task = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap().task;
        assert_eq!(task.previous_commit_id.as_deref(), Some("c1"));
        assert_eq!(task.kind, TaskKind::Incremental);
    }

    #[test]
    fn pending_tasks_are_ordered_by_priority_then_age() {
        let (_home, store) = make_store();
        let (repo, main) = seed(&store);
        let dev = store.add_branch(&repo.id, "dev", &[], Utc::now()).unwrap();
        let docs = store.add_branch(&repo.id, "docs", &[], Utc::now()).unwrap();
        let t0 = Utc::now();

        let scheduled = store.enqueue_task(new_task(&repo, &main, 0), t0).unwrap().task;
        let older_low = store
            .enqueue_task(new_task(&repo, &docs, 0), t0 - Duration::seconds(5))
            .unwrap()
            .task;
        let manual = store
            .enqueue_task(new_task(&repo, &dev, 100), t0 + Duration::seconds(5))
            .unwrap()
            .task;

        let order: Vec<TaskId> = store.pending_tasks().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(order, vec![manual.id, older_low.id, scheduled.id]);
    }

    #[test]
    fn claim_is_conditional() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let task = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap().task;

        let claimed = store.claim_task(&task.id, Utc::now()).unwrap().expect("first claim");
        assert_eq!(claimed.status, TaskStatus::Processing);
        assert!(claimed.started_at.is_some());
        assert!(store.claim_task(&task.id, Utc::now()).unwrap().is_none());
    }

    #[test]
    fn fail_increments_retry_count_once() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let task = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap().task;
        store.claim_task(&task.id, Utc::now()).unwrap();

        let failed = store.fail_task(&task.id, "clone failed", Utc::now()).unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("clone failed"));

        let again = store.fail_task(&task.id, "clone failed", Utc::now()).unwrap();
        assert_eq!(again.retry_count, 1);
    }

    #[test]
    fn completing_a_pending_task_is_rejected() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let task = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap().task;
        let err = store.complete_task(&task.id, None, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }), "got: {err}");
    }

    #[test]
    fn checkpoint_completes_owning_task_in_same_write() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let task = store.enqueue_task(new_task(&repo, &branch, 0), Utc::now()).unwrap().task;
        store.claim_task(&task.id, Utc::now()).unwrap();
        let at = Utc::now();

        store
            .commit_checkpoint(Checkpoint {
                repository_id: repo.id.clone(),
                branch_id: branch.id.clone(),
                commit_id: "c2".into(),
                processed_at: at,
                task_id: Some(task.id.clone()),
            })
            .unwrap();

        let state = store.snapshot().unwrap();
        assert_eq!(state.branches[0].last_commit_id.as_deref(), Some("c2"));
        assert_eq!(state.branches[0].last_processed_at, Some(at));
        assert_eq!(state.repositories[0].last_update_check_at, Some(at));
        assert_eq!(state.tasks[0].status, TaskStatus::Completed);
        assert_eq!(state.tasks[0].target_commit_id.as_deref(), Some("c2"));

        // the scheduler's follow-up completion is a no-op
        let done = store.complete_task(&task.id, Some("c2".into()), Utc::now()).unwrap();
        assert_eq!(done.completed_at, Some(at));
    }

    #[test]
    fn checkpoint_with_unknown_task_changes_nothing() {
        let (_home, store) = make_store();
        let (repo, branch) = seed(&store);
        let err = store
            .commit_checkpoint(Checkpoint {
                repository_id: repo.id.clone(),
                branch_id: branch.id.clone(),
                commit_id: "c9".into(),
                processed_at: Utc::now(),
                task_id: Some(TaskId::from("ghost")),
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "task", .. }));
        assert_eq!(store.branch(&branch.id).unwrap().last_commit_id, None);
    }

    #[test]
    fn due_for_recheck_honours_interval_status_and_limit() {
        let (_home, store) = make_store();
        let scheduler = SchedulerConfig::default();
        let now = Utc::now();

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let repo = store
                .add_repository(
                    NewRepository {
                        git_url: format!("https://example.com/acme/{name}.git"),
                        ..NewRepository::default()
                    },
                    now,
                )
                .unwrap();
            store
                .set_repository_status(&repo.id, RepositoryStatus::Completed, now)
                .unwrap();
            ids.push(repo.id);
        }
        // a: never checked; b: checked 2h ago; c: checked 10 minutes ago
        store.touch_update_check(&ids[1], now - Duration::hours(2)).unwrap();
        store.touch_update_check(&ids[2], now - Duration::minutes(10)).unwrap();

        let due: Vec<RepositoryId> = store
            .due_for_recheck(now, &scheduler, 10)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(due, vec![ids[0].clone(), ids[1].clone()]);

        let limited = store.due_for_recheck(now, &scheduler, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, ids[0]);

        store
            .set_repository_status(&ids[0], RepositoryStatus::Failed, now)
            .unwrap();
        let due = store.due_for_recheck(now, &scheduler, 10).unwrap();
        assert!(due.iter().all(|r| r.id != ids[0]), "failed repos are not rescanned");
    }

    #[test]
    fn recover_interrupted_tasks_fails_processing_only() {
        let (_home, store) = make_store();
        let (repo, main) = seed(&store);
        let dev = store.add_branch(&repo.id, "dev", &[], Utc::now()).unwrap();
        let running = store.enqueue_task(new_task(&repo, &main, 0), Utc::now()).unwrap().task;
        let waiting = store.enqueue_task(new_task(&repo, &dev, 0), Utc::now()).unwrap().task;
        store.claim_task(&running.id, Utc::now()).unwrap();

        let recovered = store.recover_interrupted_tasks(Utc::now()).unwrap();
        assert_eq!(recovered, vec![running.id.clone()]);
        let running = store.task(&running.id).unwrap();
        assert_eq!(running.status, TaskStatus::Failed);
        assert_eq!(running.retry_count, 1);
        assert_eq!(store.task(&waiting.id).unwrap().status, TaskStatus::Pending);
    }

    #[test]
    fn state_file_is_private_and_tmp_is_gone() {
        let (_home, store) = make_store();
        seed(&store);
        let tmp = tmp_path(store.path());
        assert!(!tmp.exists(), ".tmp must be gone after successful save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn second_handle_sees_first_handle_writes() {
        let home = TempDir::new().unwrap();
        let writer = Store::open_at(home.path()).unwrap();
        let reader = Store::open_at(home.path()).unwrap();
        let (repo, _) = seed(&writer);
        assert_eq!(reader.repository(&repo.id).unwrap().full_name(), "acme/widgets");
    }
}
