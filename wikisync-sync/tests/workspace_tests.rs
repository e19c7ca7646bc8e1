//! Workspace Manager behaviour against local git remotes.

mod support;

use std::path::PathBuf;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use wikisync_core::config::WorkspaceConfig;
use wikisync_sync::SyncError;

use support::{Fixture, Remote};

#[test]
fn clone_then_update_follows_the_remote() {
    let remote = Remote::init();
    remote.write("README.md", "hello\n");
    let c1 = remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let cancel = CancellationToken::new();

    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("clone");
    assert_eq!(workspace.commit_id, c1);
    assert_eq!(
        workspace.working_directory,
        fixture.repositories_dir().join("acme").join("widgets").join("tree")
    );
    assert!(!workspace.is_incremental());

    remote.write("docs/guide.md", "guide\n");
    let c2 = remote.commit("second");
    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", Some(&c1), &cancel)
        .expect("update");
    assert_eq!(workspace.commit_id, c2);
    assert!(workspace.is_incremental());
    assert!(workspace.working_directory.join("docs/guide.md").exists());
}

#[test]
fn rewritten_upstream_history_resets_local_branch() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    let c1 = remote.commit("first");
    remote.write("b.txt", "b\n");
    remote.commit("second");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let cancel = CancellationToken::new();
    manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("clone");

    remote.reset_hard(&c1);
    remote.write("c.txt", "c\n");
    let rewritten = remote.commit("second, rewritten");

    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("update after force push");
    assert_eq!(workspace.commit_id, rewritten);
    assert!(workspace.working_directory.join("c.txt").exists());
    assert!(!workspace.working_directory.join("b.txt").exists());
}

#[test]
fn second_branch_gets_a_local_tracking_branch() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    let c1 = remote.commit("first");
    remote.branch("release");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let cancel = CancellationToken::new();
    manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("clone main");

    let workspace = manager
        .prepare_workspace(&fixture.repository, "release", None, &cancel)
        .expect("switch to release");
    assert_eq!(workspace.commit_id, c1);

    let local = git2::Repository::open(&workspace.working_directory).unwrap();
    let branch = local.find_branch("release", git2::BranchType::Local).expect("local branch");
    assert_eq!(branch.upstream().unwrap().name().unwrap(), Some("origin/release"));
    assert_eq!(local.head().unwrap().shorthand(), Some("release"));
}

#[test]
fn unopenable_working_directory_is_recloned() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    let c1 = remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let cancel = CancellationToken::new();
    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("clone");

    std::fs::remove_dir_all(workspace.working_directory.join(".git")).unwrap();
    std::fs::write(workspace.working_directory.join("stray.txt"), "leftover").unwrap();

    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &cancel)
        .expect("reclone");
    assert_eq!(workspace.commit_id, c1);
    assert!(!workspace.working_directory.join("stray.txt").exists());
}

/// Clone `main`, leave an untracked marker, then overwrite the local branch
/// ref with garbage. The repository still opens; resolving the branch fails.
fn corrupt_branch_ref(fixture: &Fixture, manager: &wikisync_sync::WorkspaceManager) -> PathBuf {
    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &CancellationToken::new())
        .expect("clone");
    let workdir = workspace.working_directory;
    std::fs::write(workdir.join("marker.txt"), "from before the wipe").unwrap();
    std::fs::write(workdir.join(".git/refs/heads/main"), "not-a-commit-id\n").unwrap();
    assert!(git2::Repository::open(&workdir).is_ok(), "corruption must not prevent open");
    workdir
}

#[test]
fn corrupted_branch_ref_is_classified_and_wiped() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces_with(WorkspaceConfig {
        max_retry_attempts: 1,
        retry_base_delay_ms: 1,
        ..WorkspaceConfig::default()
    });
    let workdir = corrupt_branch_ref(&fixture, &manager);

    let err = manager
        .prepare_workspace(&fixture.repository, "main", None, &CancellationToken::new())
        .unwrap_err();
    match err {
        SyncError::WorkspaceUnavailable { attempts, source } => {
            assert_eq!(attempts, 1);
            assert!(
                matches!(*source, SyncError::WorkspaceCorrupted { .. }),
                "got: {source}"
            );
        }
        other => panic!("expected WorkspaceUnavailable, got: {other}"),
    }
    assert!(!workdir.exists(), "corrupted working copy is removed");
}

#[test]
fn corrupted_branch_ref_is_recloned_within_the_retry_budget() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let workdir = corrupt_branch_ref(&fixture, &manager);
    remote.write("b.txt", "b\n");
    let tip = remote.commit("second");

    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &CancellationToken::new())
        .expect("reclone after corruption");

    assert_eq!(workspace.commit_id, tip);
    assert_eq!(workspace.working_directory, workdir);
    assert!(workdir.join("b.txt").exists());
    assert!(!workdir.join("marker.txt").exists(), "the copy was wiped, not patched");
}

#[test]
fn missing_branch_is_not_found_without_retrying() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces_with(WorkspaceConfig {
        max_retry_attempts: 3,
        retry_base_delay_ms: 10_000,
        ..WorkspaceConfig::default()
    });

    let started = Instant::now();
    let err = manager
        .prepare_workspace(&fixture.repository, "does-not-exist", None, &CancellationToken::new())
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound { kind: "branch", .. }), "got: {err}");
    assert!(started.elapsed().as_secs() < 10, "a missing branch must not back off");
}

#[test]
fn unreachable_remote_exhausts_retries() {
    let missing = tempfile::TempDir::new().unwrap();
    let url = missing.path().join("acme").join("ghost").to_string_lossy().into_owned();
    let fixture = Fixture::new(&url, &["en"]);
    let manager = fixture.workspaces();

    let err = manager
        .prepare_workspace(&fixture.repository, "main", None, &CancellationToken::new())
        .unwrap_err();
    match err {
        SyncError::WorkspaceUnavailable { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(!source.to_string().is_empty());
        }
        other => panic!("expected WorkspaceUnavailable, got: {other}"),
    }
}

#[test]
fn changed_files_handles_renames_deletes_and_unknown_base() {
    let remote = Remote::init();
    remote.write("src/lib.rs", "pub mod a;\n");
    remote.write("src/a.rs", "pub fn a() {}\n");
    remote.write("src/old_name.rs", "pub fn keep() { /* long enough to be similar */ }\n");
    remote.write("obsolete.txt", "bye\n");
    let c1 = remote.commit("first");
    remote.rename("src/old_name.rs", "src/new_name.rs");
    remote.remove("obsolete.txt");
    remote.write("src/a.rs", "pub fn a() -> u8 { 1 }\n");
    remote.write("src/b.rs", "pub fn b() {}\n");
    let c2 = remote.commit("second");

    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", Some(&c1), &CancellationToken::new())
        .expect("clone");

    // Returned in path order, no sorting needed by callers.
    let changed = manager.changed_files(&workspace, Some(&c1), &c2).unwrap();
    assert_eq!(changed, vec!["src/a.rs", "src/b.rs", "src/new_name.rs"]);

    let everything = manager.changed_files(&workspace, None, &c2).unwrap();
    assert_eq!(everything, vec!["src/a.rs", "src/b.rs", "src/lib.rs", "src/new_name.rs"]);

    let unknown_base = manager
        .changed_files(&workspace, Some("0123456789abcdef0123456789abcdef01234567"), &c2)
        .unwrap();
    assert_eq!(unknown_base, everything);

    let empty_base = manager.changed_files(&workspace, Some(""), &c2).unwrap();
    assert_eq!(empty_base, everything);
}

#[test]
fn changed_files_rejects_unknown_target() {
    let remote = Remote::init();
    remote.write("a.txt", "a\n");
    let c1 = remote.commit("first");
    let fixture = Fixture::new(&remote.url(), &["en"]);
    let manager = fixture.workspaces();
    let workspace = manager
        .prepare_workspace(&fixture.repository, "main", None, &CancellationToken::new())
        .expect("clone");

    let err = manager
        .changed_files(&workspace, Some(&c1), "0123456789abcdef0123456789abcdef01234567")
        .unwrap_err();
    assert!(matches!(err, SyncError::NotFound { kind: "commit", .. }), "got: {err}");
}
