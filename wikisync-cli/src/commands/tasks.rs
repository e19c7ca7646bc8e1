//! `wikisync tasks <repo>`: update task history, newest first.

use std::collections::HashMap;

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use super::{format_age, home, open_store, short_commit};

#[derive(Args, Debug)]
pub struct TasksArgs {
    /// Repository id, git URL or `org/repo`.
    pub repo: String,

    /// Number of tasks to show.
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "created")]
    created: String,
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "priority")]
    priority: String,
    #[tabled(rename = "commits")]
    commits: String,
    #[tabled(rename = "retries")]
    retries: u32,
    #[tabled(rename = "error")]
    error: String,
}

impl TasksArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let store = open_store(&home)?;
        let repository = store
            .resolve_repository(&self.repo)
            .with_context(|| format!("unknown repository '{}'", self.repo))?;
        let branch_names: HashMap<_, _> = store
            .branches_of(&repository.id)?
            .into_iter()
            .map(|branch| (branch.id, branch.name))
            .collect();

        let mut tasks = store.tasks_for_repository(&repository.id)?;
        let total = tasks.len();
        tasks.truncate(self.limit);
        if tasks.is_empty() {
            println!("No tasks recorded for '{}'.", repository.full_name());
            return Ok(());
        }

        let rows: Vec<TaskRow> = tasks
            .into_iter()
            .map(|task| TaskRow {
                created: format_age(Some(task.created_at)),
                branch: branch_names
                    .get(&task.branch_id)
                    .cloned()
                    .unwrap_or_else(|| task.branch_id.0.clone()),
                kind: task.kind.to_string(),
                status: task.status.to_string(),
                priority: if task.is_manual_trigger {
                    format!("{} (manual)", task.priority)
                } else {
                    task.priority.to_string()
                },
                commits: format!(
                    "{} → {}",
                    short_commit(task.previous_commit_id.as_deref()),
                    short_commit(task.target_commit_id.as_deref())
                ),
                retries: task.retry_count,
                error: task.error_message.unwrap_or_default(),
            })
            .collect();

        println!(
            "{} | showing {} of {} tasks",
            repository.full_name(),
            rows.len(),
            total
        );
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
