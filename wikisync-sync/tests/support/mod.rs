//! Shared fixtures: local git remotes, an isolated store and a recording generator.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use git2::{IndexAddOption, Repository, RepositoryInitOptions, ResetType, Signature};
use tempfile::TempDir;

use wikisync_core::config::WorkspaceConfig;
use wikisync_core::{Branch, NewRepository, Repository as WikiRepository, Store};
use wikisync_sync::{WikiGenerator, Workspace, WorkspaceManager};

/// A non-bare repository at `<tmp>/acme/widgets` acting as `origin`.
pub struct Remote {
    _dir: TempDir,
    path: PathBuf,
    pub repo: Repository,
}

impl Remote {
    pub fn init() -> Self {
        let dir = TempDir::new().expect("remote tempdir");
        let path = dir.path().join("acme").join("widgets");
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(&path, &opts).expect("init remote");
        Self {
            _dir: dir,
            path,
            repo,
        }
    }

    pub fn url(&self) -> String {
        self.path.to_string_lossy().into_owned()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let file = self.path.join(relative);
        std::fs::create_dir_all(file.parent().expect("parent")).expect("mkdir");
        std::fs::write(file, content).expect("write");
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.path.join(relative)).expect("remove");
    }

    pub fn rename(&self, from: &str, to: &str) {
        std::fs::rename(self.path.join(from), self.path.join(to)).expect("rename");
    }

    /// Stage everything (including deletions) and commit on HEAD.
    pub fn commit(&self, message: &str) -> String {
        let mut index = self.repo.index().expect("index");
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .expect("add_all");
        index.update_all(["*"].iter(), None).expect("update_all");
        index.write().expect("index write");
        let tree_id = index.write_tree().expect("write_tree");
        let tree = self.repo.find_tree(tree_id).expect("tree");
        let signature = Signature::now("Fixture", "fixture@example.com").expect("signature");
        let parent = self.repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)
            .expect("commit")
            .to_string()
    }

    pub fn head(&self) -> String {
        self.repo
            .head()
            .expect("head")
            .peel_to_commit()
            .expect("commit")
            .id()
            .to_string()
    }

    /// Point a new branch at the current HEAD commit.
    pub fn branch(&self, name: &str) {
        let head = self.repo.head().expect("head").peel_to_commit().expect("commit");
        self.repo.branch(name, &head, false).expect("branch");
    }

    /// Hard-reset HEAD to `commit`, discarding later history.
    pub fn reset_hard(&self, commit: &str) {
        let oid = git2::Oid::from_str(commit).expect("oid");
        let object = self.repo.find_object(oid, None).expect("object");
        self.repo.reset(&object, ResetType::Hard, None).expect("reset");
    }
}

/// An isolated `~/.wikisync` with one repository and a `main` branch.
pub struct Fixture {
    pub home: TempDir,
    pub store: Arc<Store>,
    pub repository: WikiRepository,
    pub branch: Branch,
}

impl Fixture {
    pub fn new(url: &str, languages: &[&str]) -> Self {
        let home = TempDir::new().expect("home");
        let store = Arc::new(Store::open_at(home.path()).expect("store"));
        let repository = store
            .add_repository(
                NewRepository {
                    git_url: url.to_string(),
                    is_public: true,
                    ..NewRepository::default()
                },
                Utc::now(),
            )
            .expect("repository");
        let languages: Vec<String> = languages.iter().map(|l| l.to_string()).collect();
        let branch = store
            .add_branch(&repository.id, "main", &languages, Utc::now())
            .expect("branch");
        Self {
            home,
            store,
            repository,
            branch,
        }
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.home.path().join("repos")
    }

    pub fn workspaces(&self) -> WorkspaceManager {
        self.workspaces_with(WorkspaceConfig {
            retry_base_delay_ms: 1,
            ..WorkspaceConfig::default()
        })
    }

    pub fn workspaces_with(&self, config: WorkspaceConfig) -> WorkspaceManager {
        WorkspaceManager::new(self.repositories_dir(), &config)
    }

    pub fn checkpoint(&self) -> Option<String> {
        self.store
            .branch(&self.branch.id)
            .expect("branch")
            .last_commit_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorCall {
    Full { language: String },
    Incremental { language: String, files: Vec<String> },
}

/// Records every call; fails for `fail_language` when set.
#[derive(Default)]
pub struct RecordingGenerator {
    pub calls: Mutex<Vec<GeneratorCall>>,
    pub fail_language: Mutex<Option<String>>,
}

impl RecordingGenerator {
    pub fn failing_for(language: &str) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_language: Mutex::new(Some(language.to_string())),
        }
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn heal(&self) {
        *self.fail_language.lock().expect("fail") = None;
    }

    fn check(&self, workspace: &Workspace, language: &str) -> anyhow::Result<()> {
        assert!(
            Path::new(&workspace.working_directory).join(".git").exists(),
            "generator must run against a prepared working copy"
        );
        if self.fail_language.lock().expect("fail").as_deref() == Some(language) {
            anyhow::bail!("model unavailable for {language}");
        }
        Ok(())
    }
}

impl WikiGenerator for RecordingGenerator {
    fn generate_full(&self, workspace: &Workspace, language: &str) -> anyhow::Result<()> {
        self.check(workspace, language)?;
        self.calls.lock().expect("calls").push(GeneratorCall::Full {
            language: language.to_string(),
        });
        Ok(())
    }

    fn apply_incremental(
        &self,
        workspace: &Workspace,
        language: &str,
        changed_files: &[String],
    ) -> anyhow::Result<()> {
        self.check(workspace, language)?;
        let mut files = changed_files.to_vec();
        files.sort();
        self.calls.lock().expect("calls").push(GeneratorCall::Incremental {
            language: language.to_string(),
            files,
        });
        Ok(())
    }
}
