//! Local working copies of remote repositories.
//!
//! ## Layout
//!
//! ```text
//! <repositories_dir>/<org>/<repo>/tree
//! ```
//!
//! ## `prepare_workspace`: per attempt
//!
//! 1. Check cancellation.
//! 2. No openable repository at the working directory → remove leftovers, clone the branch.
//! 3. Otherwise fetch `origin/<branch>`, fast-forward (or reset) the local branch, check it out.
//! 4. Read HEAD.
//!
//! Failed attempts are retried with exponential backoff; a corrupted copy is
//! wiped first so the next attempt is a fresh clone. A missing branch is final.

use std::path::{Path, PathBuf};

use git2::Repository as GitRepository;
use tokio_util::sync::CancellationToken;

use wikisync_core::config::WorkspaceConfig;
use wikisync_core::Repository;

use crate::diff::changed_paths;
use crate::error::{io_err, SyncError};
use crate::git;
use crate::retry::{sleep_cancellable, RetryPolicy};

/// A prepared working copy at a known HEAD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub organization: String,
    pub repository_name: String,
    pub branch: String,
    pub git_url: String,
    pub working_directory: PathBuf,
    /// HEAD after preparation.
    pub commit_id: String,
    /// Checkpoint the workspace was prepared against.
    pub previous_commit_id: Option<String>,
}

impl Workspace {
    pub fn is_incremental(&self) -> bool {
        self.previous_commit_id
            .as_deref()
            .is_some_and(|commit| !commit.is_empty())
    }
}

/// Owns the repositories directory and the clone/fetch retry policy.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    repositories_dir: PathBuf,
    cleanup_after_processing: bool,
    retry: RetryPolicy,
}

impl WorkspaceManager {
    pub fn new(repositories_dir: impl Into<PathBuf>, config: &WorkspaceConfig) -> Self {
        Self {
            repositories_dir: repositories_dir.into(),
            cleanup_after_processing: config.cleanup_after_processing,
            retry: RetryPolicy::from_config(config),
        }
    }

    pub fn repositories_dir(&self) -> &Path {
        &self.repositories_dir
    }

    /// `<repositories_dir>/<org>/<repo>/tree` with both names sanitized.
    pub fn working_directory(&self, organization: &str, repository: &str) -> Result<PathBuf, SyncError> {
        Ok(self
            .repositories_dir
            .join(sanitize_component(organization)?)
            .join(sanitize_component(repository)?)
            .join("tree"))
    }

    /// Clone or update the working copy for `branch` and report its HEAD.
    pub fn prepare_workspace(
        &self,
        repository: &Repository,
        branch: &str,
        previous_commit_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Workspace, SyncError> {
        let workdir = self.working_directory(&repository.org_name, &repository.repo_name)?;
        let max_attempts = self.retry.max_attempts;

        let mut attempt = 0;
        let commit_id = loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match self.prepare_once(repository, branch, &workdir, cancel) {
                Ok(commit_id) => break commit_id,
                Err(_) if cancel.is_cancelled() => return Err(SyncError::Cancelled),
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        repository = %repository.full_name(),
                        branch,
                        attempt,
                        max_attempts,
                        error = %err,
                        "workspace preparation failed"
                    );
                    if matches!(err, SyncError::WorkspaceCorrupted { .. }) {
                        remove_dir_forcefully(&workdir)?;
                    }
                    if attempt >= max_attempts {
                        return Err(SyncError::WorkspaceUnavailable {
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    if !sleep_cancellable(self.retry.delay_after(attempt), cancel) {
                        return Err(SyncError::Cancelled);
                    }
                }
            }
        };

        tracing::info!(
            repository = %repository.full_name(),
            branch,
            commit = %commit_id,
            attempts = attempt,
            "workspace ready"
        );
        Ok(Workspace {
            organization: repository.org_name.clone(),
            repository_name: repository.repo_name.clone(),
            branch: branch.to_string(),
            git_url: repository.git_url.clone(),
            working_directory: workdir,
            commit_id,
            previous_commit_id: previous_commit_id
                .filter(|commit| !commit.is_empty())
                .map(str::to_string),
        })
    }

    fn prepare_once(
        &self,
        repository: &Repository,
        branch: &str,
        workdir: &Path,
        cancel: &CancellationToken,
    ) -> Result<String, SyncError> {
        let credentials = repository.credentials.as_ref();
        let classify = |err: git2::Error| git::classify(err, workdir, branch);

        let repo = match GitRepository::open(workdir) {
            Ok(repo) => {
                tracing::debug!(path = %workdir.display(), branch, "updating existing working copy");
                git::update_branch(&repo, branch, credentials, cancel).map_err(classify)?;
                repo
            }
            Err(_) => {
                if workdir.exists() {
                    tracing::debug!(path = %workdir.display(), "removing unusable directory before clone");
                    remove_dir_forcefully(workdir)?;
                }
                if let Some(parent) = workdir.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                tracing::info!(url = %repository.git_url, branch, path = %workdir.display(), "cloning");
                git::clone_branch(&repository.git_url, branch, workdir, credentials, cancel)
                    .map_err(classify)?
            }
        };
        git::head_commit_id(&repo).map_err(classify)
    }

    /// Paths changed between `from` and `to` in the workspace's repository.
    pub fn changed_files(
        &self,
        workspace: &Workspace,
        from: Option<&str>,
        to: &str,
    ) -> Result<Vec<String>, SyncError> {
        let repo = GitRepository::open(&workspace.working_directory)?;
        let (files, stats) = changed_paths(&repo, from, to)?;
        tracing::debug!(
            repository = %format!("{}/{}", workspace.organization, workspace.repository_name),
            branch = %workspace.branch,
            changed = files.len(),
            deleted = stats.deleted,
            "changed files computed"
        );
        Ok(files)
    }

    /// Remove the working directory when the cleanup policy asks for it.
    /// Failures are logged, never returned.
    pub fn cleanup_workspace(&self, workspace: &Workspace) {
        if !self.cleanup_after_processing {
            return;
        }
        match remove_dir_forcefully(&workspace.working_directory) {
            Ok(()) => tracing::debug!(path = %workspace.working_directory.display(), "workspace removed"),
            Err(err) => tracing::warn!(
                path = %workspace.working_directory.display(),
                error = %err,
                "workspace cleanup failed"
            ),
        }
    }
}

/// Turn an organization or repository name into a single safe path segment.
///
/// `/`, `\` and `..` become `_`; surrounding whitespace is trimmed.
pub fn sanitize_component(raw: &str) -> Result<String, SyncError> {
    if raw.trim().is_empty() {
        return Err(SyncError::InvalidPathComponent(raw.to_string()));
    }
    let cleaned = raw.replace(['/', '\\'], "_").replace("..", "_");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(SyncError::InvalidPathComponent(raw.to_string()));
    }
    Ok(cleaned.to_string())
}

/// `remove_dir_all` after clearing read-only bits (git pack files are 0444).
fn remove_dir_forcefully(path: &Path) -> Result<(), SyncError> {
    if !path.exists() {
        return Ok(());
    }
    clear_readonly(path);
    std::fs::remove_dir_all(path).map_err(|e| io_err(path, e))
}

fn clear_readonly(path: &Path) {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };
    if metadata.file_type().is_symlink() {
        return;
    }
    let mut permissions = metadata.permissions();
    if permissions.readonly() {
        #[allow(clippy::permissions_set_readonly_false)]
        permissions.set_readonly(false);
        let _ = std::fs::set_permissions(path, permissions);
    }
    if metadata.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                clear_readonly(&entry.path());
            }
        }
    }
}
