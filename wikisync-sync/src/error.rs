//! Error types for wikisync-sync.

use std::path::PathBuf;

use thiserror::Error;

use wikisync_core::error::StoreError;

/// All errors that can arise from workspace preparation and update runs.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A git operation failed; clone/fetch failures of this kind are retried.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// The working copy is damaged; the directory is wiped before the next attempt.
    #[error("workspace at {path} is corrupted: {message}")]
    WorkspaceCorrupted { path: PathBuf, message: String },

    /// Clone/fetch kept failing until the retry budget ran out.
    #[error("workspace unavailable after {attempts} attempt(s): {source}")]
    WorkspaceUnavailable {
        attempts: u32,
        #[source]
        source: Box<SyncError>,
    },

    /// A repository, branch or commit that does not exist.
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// The generator failed for one language variant.
    #[error("generator failed for language '{language}': {message}")]
    Generator { language: String, message: String },

    /// An error from the task store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An organization or repository name that cannot become a directory name.
    #[error("invalid path component: '{0}'")]
    InvalidPathComponent(String),

    /// Shutdown was requested while the run was in flight.
    #[error("operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        SyncError::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Whether a clone/fetch failure is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Git(_) | SyncError::WorkspaceCorrupted { .. } | SyncError::Io { .. }
        )
    }
}

/// Map a store error, keeping "not found" distinct from storage failures.
pub(crate) fn store_err(err: StoreError) -> SyncError {
    match err {
        StoreError::NotFound { kind, id } => SyncError::NotFound { kind, name: id },
        other => SyncError::Store(other),
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
