//! `wikisync check`: fetch and diff without generating anything.
//!
//! Fetching rewrites the shared working copy, so this refuses to run while a
//! daemon owns the working copies. Use `wikisync trigger` instead.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use wikisync_daemon::daemon_running;
use wikisync_sync::{check_for_updates, WorkspaceManager};

use super::{home, load_config, open_store, short_commit};

/// Changed paths printed per branch before eliding the rest.
const PREVIEW_LIMIT: usize = 20;

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Repository id, git URL or `org/repo`.
    pub repo: String,

    /// Only this branch; every tracked branch when omitted.
    #[arg(long, short = 'b')]
    pub branch: Option<String>,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        if daemon_running(&home) {
            bail!(
                "the daemon is running and owns the working copies; \
                 use `wikisync trigger {}` or stop the daemon first",
                self.repo
            );
        }
        let config = load_config(&home)?;
        let store = open_store(&home)?;
        let workspaces = WorkspaceManager::new(
            config.workspace.repositories_dir_at(&home),
            &config.workspace,
        );

        let repository = store
            .resolve_repository(&self.repo)
            .with_context(|| format!("unknown repository '{}'", self.repo))?;
        let branches = match &self.branch {
            Some(name) => vec![store
                .find_branch(&repository.id, name)
                .with_context(|| format!("'{}' does not track branch '{name}'", repository.full_name()))?],
            None => store.branches_of(&repository.id)?,
        };

        let cancel = CancellationToken::new();
        for branch in branches {
            let check = check_for_updates(&store, &workspaces, &repository.id, &branch.id, &cancel)
                .with_context(|| {
                    format!(
                        "update check failed for '{}' branch '{}'",
                        repository.full_name(),
                        branch.name
                    )
                })?;

            let state = if check.needs_update {
                "update available".yellow().bold()
            } else {
                "up to date".green().bold()
            };
            println!(
                "{} {} {} → {} ({} changed file(s))",
                format!("{}@{}", repository.full_name(), branch.name).bold(),
                state,
                short_commit(check.previous_commit_id.as_deref()),
                short_commit(Some(&check.current_commit_id)),
                check.changed_files.len()
            );
            for path in check.changed_files.iter().take(PREVIEW_LIMIT) {
                println!("  ~  {path}");
            }
            if check.changed_files.len() > PREVIEW_LIMIT {
                println!("  … +{} more", check.changed_files.len() - PREVIEW_LIMIT);
            }
        }
        Ok(())
    }
}
