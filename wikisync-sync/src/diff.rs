//! Changed-path computation between two commits.
//!
//! With no usable `from` commit (never processed, or not in the object
//! database after a force-push) every tracked file at `to` counts as changed,
//! which is what turns the first run into a full generation.

use git2::{Delta, DiffFindOptions, ObjectType, Oid, Repository, TreeWalkMode, TreeWalkResult};

use crate::SyncError;

/// Counts reported alongside the changed paths, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub modified: usize,
    pub renamed: usize,
    pub copied: usize,
    pub deleted: usize,
}

/// Paths (relative, `/`-separated) that were added, modified, renamed or
/// copied between `from` and `to`, sorted and without duplicates. Deleted
/// paths are not returned.
pub fn changed_paths(
    repo: &Repository,
    from: Option<&str>,
    to: &str,
) -> Result<(Vec<String>, DiffStats), SyncError> {
    let to_commit = find_commit(repo, to).ok_or_else(|| SyncError::not_found("commit", to))?;
    let to_tree = to_commit.tree()?;

    let from_commit = from
        .filter(|commit| !commit.is_empty())
        .and_then(|commit| find_commit(repo, commit));
    let Some(from_commit) = from_commit else {
        if let Some(unknown) = from.filter(|commit| !commit.is_empty()) {
            tracing::warn!(
                from = unknown,
                "previous commit not found in repository; treating every tracked file as changed"
            );
        }
        let mut files = tracked_files(&to_tree)?;
        files.sort();
        let stats = DiffStats {
            added: files.len(),
            ..DiffStats::default()
        };
        return Ok((files, stats));
    };

    let from_tree = from_commit.tree()?;
    let mut diff = repo.diff_tree_to_tree(Some(&from_tree), Some(&to_tree), None)?;
    let mut find = DiffFindOptions::new();
    find.renames(true).copies(true);
    diff.find_similar(Some(&mut find))?;

    let mut stats = DiffStats::default();
    let mut files = Vec::new();
    for delta in diff.deltas() {
        let counter = match delta.status() {
            Delta::Added => &mut stats.added,
            Delta::Modified => &mut stats.modified,
            Delta::Renamed => &mut stats.renamed,
            Delta::Copied => &mut stats.copied,
            Delta::Deleted => {
                stats.deleted += 1;
                continue;
            }
            _ => continue,
        };
        if let Some(path) = delta.new_file().path() {
            *counter += 1;
            files.push(normalize(&path.to_string_lossy()));
        }
    }
    tracing::debug!(
        added = stats.added,
        modified = stats.modified,
        renamed = stats.renamed,
        copied = stats.copied,
        deleted = stats.deleted,
        "tree diff"
    );
    files.sort();
    files.dedup();
    Ok((files, stats))
}

fn find_commit<'r>(repo: &'r Repository, id: &str) -> Option<git2::Commit<'r>> {
    let oid = Oid::from_str(id).ok()?;
    repo.find_commit(oid).ok()
}

fn tracked_files(tree: &git2::Tree<'_>) -> Result<Vec<String>, SyncError> {
    let mut files = Vec::new();
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            if let Some(name) = entry.name() {
                files.push(format!("{root}{name}"));
            }
        }
        TreeWalkResult::Ok
    })?;
    Ok(files)
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}
