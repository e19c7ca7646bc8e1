//! git2 plumbing: clone, fetch + fast-forward, HEAD, error classification.

use std::path::Path;

use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{Cred, ErrorClass, ErrorCode, FetchOptions, RemoteCallbacks, Repository};
use tokio_util::sync::CancellationToken;

use wikisync_core::Credentials;

use crate::SyncError;

/// Error message fragments that mean the local copy cannot be trusted.
const CORRUPTION_MARKERS: [&str; 6] = [
    "corrupt",
    "not a git repository",
    "bad object",
    "broken",
    "invalid object",
    "object not found",
];

/// Credential callbacks are invoked again after a rejected login.
const MAX_CREDENTIAL_CALLS: u32 = 3;

pub(crate) fn is_corruption(message: &str) -> bool {
    let lower = message.to_lowercase();
    CORRUPTION_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Translate a git2 failure at the workspace boundary.
pub(crate) fn classify(err: git2::Error, workdir: &Path, branch: &str) -> SyncError {
    if err.class() == ErrorClass::Reference && err.code() == ErrorCode::NotFound {
        return SyncError::not_found("branch", branch);
    }
    if is_corruption(err.message()) {
        return SyncError::WorkspaceCorrupted {
            path: workdir.to_path_buf(),
            message: err.message().to_string(),
        };
    }
    SyncError::Git(err)
}

fn fetch_options<'a>(
    credentials: Option<&'a Credentials>,
    cancel: &'a CancellationToken,
) -> FetchOptions<'a> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(credentials) = credentials {
        let mut calls = 0u32;
        callbacks.credentials(move |_url, _username_from_url, _allowed| {
            calls += 1;
            if calls > MAX_CREDENTIAL_CALLS {
                return Err(git2::Error::from_str("credentials rejected by remote"));
            }
            Cred::userpass_plaintext(&credentials.username, &credentials.password)
        });
    }
    // Returning false aborts the transfer.
    callbacks.transfer_progress(move |_| !cancel.is_cancelled());

    let mut options = FetchOptions::new();
    options.remote_callbacks(callbacks);
    options
}

/// Clone a single branch into `dest`. Submodules are not initialised.
pub(crate) fn clone_branch(
    url: &str,
    branch: &str,
    dest: &Path,
    credentials: Option<&Credentials>,
    cancel: &CancellationToken,
) -> Result<Repository, git2::Error> {
    let mut builder = RepoBuilder::new();
    builder
        .branch(branch)
        .fetch_options(fetch_options(credentials, cancel));
    builder.clone(url, dest)
}

/// Fetch `origin/<branch>` and move the local branch to it.
///
/// Creates the local branch (tracking `origin/<branch>`) when only the remote
/// one exists. A local branch that is not an ancestor of the remote tip is
/// reset to the remote tip.
pub(crate) fn update_branch(
    repo: &Repository,
    branch: &str,
    credentials: Option<&Credentials>,
    cancel: &CancellationToken,
) -> Result<(), git2::Error> {
    let mut remote = repo.find_remote("origin")?;
    let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
    let mut options = fetch_options(credentials, cancel);
    remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;

    let remote_commit = repo
        .find_reference(&format!("refs/remotes/origin/{branch}"))?
        .peel_to_commit()?;
    let remote_oid = remote_commit.id();
    let local_ref = format!("refs/heads/{branch}");

    let mut checkout = CheckoutBuilder::new();
    checkout.force();

    match repo.find_reference(&local_ref) {
        Ok(mut reference) => {
            let local_oid = reference.peel_to_commit()?.id();
            if local_oid != remote_oid {
                if repo.graph_descendant_of(remote_oid, local_oid)? {
                    tracing::debug!(branch, from = %local_oid, to = %remote_oid, "fast-forward");
                } else {
                    tracing::warn!(
                        branch,
                        local = %local_oid,
                        remote = %remote_oid,
                        "local branch diverged from origin; resetting to remote tip"
                    );
                }
                repo.checkout_tree(remote_commit.as_object(), Some(&mut checkout))?;
                reference.set_target(remote_oid, "wikisync: update to origin")?;
            }
        }
        Err(err) if err.code() == ErrorCode::NotFound => {
            repo.checkout_tree(remote_commit.as_object(), Some(&mut checkout))?;
            let mut local = repo.branch(branch, &remote_commit, false)?;
            local.set_upstream(Some(&format!("origin/{branch}")))?;
            tracing::debug!(branch, "created local tracking branch");
        }
        Err(err) => return Err(err),
    }

    repo.set_head(&local_ref)?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    Ok(())
}

pub(crate) fn head_commit_id(repo: &Repository) -> Result<String, git2::Error> {
    Ok(repo.head()?.peel_to_commit()?.id().to_string())
}
