//! `wikisync branch add <repo> <branch>`

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Subcommand};

use super::{home, load_config, open_store};

#[derive(Subcommand, Debug)]
pub enum BranchCommand {
    /// Track another branch, or add languages to a tracked one.
    Add(AddArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Repository id, git URL or `org/repo`.
    pub repo: String,

    /// Branch name.
    pub branch: String,

    /// Language variant to generate; repeatable. Defaults to `default_language`.
    #[arg(long = "language", short = 'l', value_name = "CODE")]
    pub languages: Vec<String>,
}

pub fn run(command: BranchCommand) -> Result<()> {
    match command {
        BranchCommand::Add(args) => add(args),
    }
}

fn add(args: AddArgs) -> Result<()> {
    let home = home()?;
    let config = load_config(&home)?;
    let store = open_store(&home)?;

    let repository = store
        .resolve_repository(&args.repo)
        .with_context(|| format!("unknown repository '{}'", args.repo))?;
    let languages = if args.languages.is_empty() {
        vec![config.default_language]
    } else {
        args.languages
    };
    let branch = store
        .add_branch(&repository.id, &args.branch, &languages, Utc::now())
        .with_context(|| format!("failed to add branch '{}'", args.branch))?;

    println!(
        "✓ '{}' branch '{}' languages: {}",
        repository.full_name(),
        branch.name,
        branch.languages.join(", ")
    );
    Ok(())
}
