//! `wikisync trigger`: queue a manual update.
//!
//! With a running daemon the request goes over its socket so the scheduler
//! wakes immediately; otherwise the task is written to the store and picked
//! up on the daemon's next start.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use serde_json::Value;

use wikisync_daemon::{request_trigger, DaemonError};
use wikisync_sync::trigger_manual_update;

use super::{home, load_config, open_store};

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Repository id, git URL or `org/repo`.
    pub repo: String,

    /// Only this branch; every tracked branch when omitted.
    #[arg(long, short = 'b')]
    pub branch: Option<String>,
}

impl TriggerArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        match request_trigger(&home, self.repo.clone(), self.branch.clone()) {
            Ok(data) => {
                print_daemon_tasks(&data);
                Ok(())
            }
            Err(DaemonError::DaemonNotRunning { .. }) => self.enqueue_offline(&home),
            Err(err) => Err(err).context("daemon rejected trigger"),
        }
    }

    fn enqueue_offline(&self, home: &std::path::Path) -> Result<()> {
        let config = load_config(home)?;
        let store = open_store(home)?;
        let repository = store
            .resolve_repository(&self.repo)
            .with_context(|| format!("unknown repository '{}'", self.repo))?;
        let branches = match &self.branch {
            Some(name) => vec![store
                .find_branch(&repository.id, name)
                .with_context(|| format!("'{}' does not track branch '{name}'", repository.full_name()))?],
            None => store.branches_of(&repository.id)?,
        };
        if branches.is_empty() {
            println!("'{}' has no tracked branches.", repository.full_name());
            return Ok(());
        }

        for branch in branches {
            let outcome = trigger_manual_update(
                &store,
                &repository.id,
                &branch.id,
                config.scheduler.manual_trigger_priority,
                Utc::now(),
            )
            .with_context(|| format!("failed to queue update for '{}'", branch.name))?;
            print_task(
                &repository.full_name(),
                &branch.name,
                &outcome.task.id.0,
                outcome.created,
            );
        }
        println!("daemon is not running; tasks run on its next start");
        Ok(())
    }
}

fn print_daemon_tasks(data: &Value) {
    let Some(tasks) = data.get("tasks").and_then(Value::as_array) else {
        return;
    };
    for task in tasks {
        print_task(
            task["repository"].as_str().unwrap_or("?"),
            task["branch"].as_str().unwrap_or("?"),
            task["task_id"].as_str().unwrap_or("?"),
            task["created"].as_bool().unwrap_or(false),
        );
    }
}

fn print_task(repository: &str, branch: &str, task_id: &str, created: bool) {
    if created {
        println!("✓ queued update for '{repository}' branch '{branch}' (task {task_id})");
    } else {
        println!("· update already queued for '{repository}' branch '{branch}' (task {task_id})");
    }
}
