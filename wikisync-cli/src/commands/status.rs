//! `wikisync status`: repositories, branch checkpoints and queued work.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use wikisync_core::{Repository, RepositoryStatus, Store, UpdateTask};

use super::{format_age, home, open_store, short_commit};

/// Arguments for `wikisync status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only this repository (id, git URL or `org/repo`).
    #[arg(long)]
    pub repo: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let store = open_store(&home)?;

        let repositories = match &self.repo {
            Some(reference) => vec![store
                .resolve_repository(reference)
                .with_context(|| format!("unknown repository '{reference}'"))?],
            None => store.list_repositories()?,
        };
        let report = build_report(&store, repositories)?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RepositoryStatusJson {
    id: String,
    repository: String,
    status: RepositoryStatus,
    last_update_check_at: Option<DateTime<Utc>>,
    branches: Vec<BranchStatusJson>,
}

#[derive(Debug, Serialize)]
struct BranchStatusJson {
    name: String,
    languages: Vec<String>,
    last_commit_id: Option<String>,
    last_processed_at: Option<DateTime<Utc>>,
    active_task: Option<ActiveTaskJson>,
}

#[derive(Debug, Serialize)]
struct ActiveTaskJson {
    id: String,
    kind: String,
    status: String,
    priority: i32,
    is_manual_trigger: bool,
}

impl From<UpdateTask> for ActiveTaskJson {
    fn from(task: UpdateTask) -> Self {
        Self {
            id: task.id.0,
            kind: task.kind.to_string(),
            status: task.status.to_string(),
            priority: task.priority,
            is_manual_trigger: task.is_manual_trigger,
        }
    }
}

#[derive(Tabled)]
struct BranchRow {
    #[tabled(rename = "branch")]
    branch: String,
    #[tabled(rename = "languages")]
    languages: String,
    #[tabled(rename = "checkpoint")]
    checkpoint: String,
    #[tabled(rename = "processed")]
    processed: String,
    #[tabled(rename = "active task")]
    active_task: String,
}

fn build_report(
    store: &Store,
    repositories: Vec<Repository>,
) -> Result<Vec<RepositoryStatusJson>> {
    let mut report = Vec::with_capacity(repositories.len());
    for repository in repositories {
        let mut branches = Vec::new();
        for branch in store.branches_of(&repository.id)? {
            let active_task = store
                .active_task(&repository.id, &branch.id)?
                .map(ActiveTaskJson::from);
            branches.push(BranchStatusJson {
                name: branch.name,
                languages: branch.languages,
                last_commit_id: branch.last_commit_id,
                last_processed_at: branch.last_processed_at,
                active_task,
            });
        }
        report.push(RepositoryStatusJson {
            id: repository.id.0.clone(),
            repository: repository.full_name(),
            status: repository.status,
            last_update_check_at: repository.last_update_check_at,
            branches,
        });
    }
    Ok(report)
}

fn print_table(report: Vec<RepositoryStatusJson>) {
    let active: usize = report
        .iter()
        .flat_map(|r| r.branches.iter())
        .filter(|b| b.active_task.is_some())
        .count();
    println!(
        "wikisync v{} | {} repositories | {} active tasks",
        env!("CARGO_PKG_VERSION"),
        report.len(),
        active
    );

    if report.is_empty() {
        println!("No repositories tracked.");
        return;
    }

    let separator = "■".repeat(67).bright_black().to_string();
    println!("{separator}");
    for repository in report {
        println!(
            "{} {}",
            repository.repository.bold(),
            status_label(repository.status)
        );
        if repository.branches.is_empty() {
            println!("  no tracked branches");
            println!("{separator}");
            continue;
        }
        let rows: Vec<BranchRow> = repository
            .branches
            .into_iter()
            .map(|branch| BranchRow {
                branch: branch.name,
                languages: branch.languages.join(", "),
                checkpoint: short_commit(branch.last_commit_id.as_deref()),
                processed: format_age(branch.last_processed_at),
                active_task: branch
                    .active_task
                    .map(|task| format!("{} {} (p{})", task.status, task.kind, task.priority))
                    .unwrap_or_else(|| "-".to_string()),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{separator}");
    }
}

fn status_label(status: RepositoryStatus) -> String {
    let label = format!("[{status}]");
    match status {
        RepositoryStatus::Pending => label.bright_black().bold().to_string(),
        RepositoryStatus::Processing => label.yellow().bold().to_string(),
        RepositoryStatus::Completed => label.green().bold().to_string(),
        RepositoryStatus::Failed => label.red().bold().to_string(),
    }
}
