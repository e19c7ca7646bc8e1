//! `wikisync repo add` and `wikisync repo list`

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use wikisync_core::{Credentials, NewRepository};

use super::{format_age, home, load_config, open_store};

#[derive(Subcommand, Debug)]
pub enum RepoCommand {
    /// Register a git repository and the branches to document.
    Add(AddArgs),

    /// List tracked repositories.
    List(ListArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Clone URL (https, ssh or a local path).
    pub url: String,

    /// Branch to track; repeatable. Defaults to `main`.
    #[arg(long = "branch", short = 'b', value_name = "NAME")]
    pub branches: Vec<String>,

    /// Language variant to generate; repeatable. Defaults to `default_language`.
    #[arg(long = "language", short = 'l', value_name = "CODE")]
    pub languages: Vec<String>,

    /// Username for authenticated fetches.
    #[arg(long, requires = "password")]
    pub username: Option<String>,

    /// Password or access token for authenticated fetches.
    #[arg(long, requires = "username")]
    pub password: Option<String>,

    /// Mark the repository as private.
    #[arg(long)]
    pub private: bool,

    /// Recheck interval in minutes (overrides the scheduler default).
    #[arg(long, value_name = "MINUTES")]
    pub interval: Option<u32>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: RepoCommand) -> Result<()> {
    match command {
        RepoCommand::Add(args) => add(args),
        RepoCommand::List(args) => list(args),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = home()?;
    let config = load_config(&home)?;
    let store = open_store(&home)?;

    let credentials = match (args.username, args.password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        _ => None,
    };
    let now = Utc::now();
    let repository = store
        .add_repository(
            NewRepository {
                git_url: args.url.clone(),
                credentials,
                is_public: !args.private,
                update_interval_minutes: args.interval,
            },
            now,
        )
        .with_context(|| format!("failed to add repository '{}'", args.url))?;

    let branches = if args.branches.is_empty() {
        vec!["main".to_string()]
    } else {
        args.branches
    };
    let languages = if args.languages.is_empty() {
        vec![config.default_language.clone()]
    } else {
        args.languages
    };
    for name in &branches {
        store
            .add_branch(&repository.id, name, &languages, now)
            .with_context(|| format!("failed to add branch '{name}'"))?;
    }

    println!(
        "✓ Tracking '{}' ({}) branches: {} languages: {}",
        repository.full_name(),
        repository.id,
        branches.join(", "),
        languages.join(", ")
    );
    Ok(())
}

#[derive(Serialize)]
struct RepositoryJson {
    id: String,
    repository: String,
    git_url: String,
    status: String,
    is_public: bool,
    update_interval_minutes: Option<u32>,
    last_update_check_at: Option<String>,
    branches: Vec<String>,
}

#[derive(Tabled)]
struct RepositoryRow {
    #[tabled(rename = "repository")]
    repository: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "branches")]
    branches: String,
    #[tabled(rename = "last check")]
    last_check: String,
    #[tabled(rename = "id")]
    id: String,
}

fn list(args: ListArgs) -> Result<()> {
    let home = home()?;
    let store = open_store(&home)?;
    let repositories = store
        .list_repositories()
        .context("failed to read repositories")?;

    let mut rows = Vec::with_capacity(repositories.len());
    for repository in repositories {
        let branches: Vec<String> = store
            .branches_of(&repository.id)?
            .into_iter()
            .map(|branch| branch.name)
            .collect();
        rows.push((repository, branches));
    }

    if args.json {
        let payload: Vec<RepositoryJson> = rows
            .into_iter()
            .map(|(repository, branches)| RepositoryJson {
                id: repository.id.0.clone(),
                repository: repository.full_name(),
                git_url: repository.git_url,
                status: repository.status.to_string(),
                is_public: repository.is_public,
                update_interval_minutes: repository.update_interval_minutes,
                last_update_check_at: repository.last_update_check_at.map(|t| t.to_rfc3339()),
                branches,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&payload).context("failed to serialize repositories")?
        );
        return Ok(());
    }

    if rows.is_empty() {
        println!("No repositories tracked.");
        println!("Run: wikisync repo add <url> --branch <name>");
        return Ok(());
    }

    let table_rows: Vec<RepositoryRow> = rows
        .into_iter()
        .map(|(repository, branches)| RepositoryRow {
            repository: repository.full_name(),
            status: repository.status.to_string(),
            branches: branches.join(", "),
            last_check: format_age(repository.last_update_check_at),
            id: repository.id.0,
        })
        .collect();
    let mut table = Table::new(table_rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}
