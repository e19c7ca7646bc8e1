//! wikisync: keep generated wikis in step with their git repositories.
//!
//! # Usage
//!
//! ```text
//! wikisync repo add <url> [--branch <name>]... [--language <code>]... [--private] [--interval <min>]
//! wikisync repo list [--json]
//! wikisync branch add <repo> <branch> [--language <code>]...
//! wikisync trigger <repo> [--branch <name>]
//! wikisync check <repo> [--branch <name>]
//! wikisync status [--repo <repo>] [--json]
//! wikisync tasks <repo> [--limit <n>]
//! wikisync daemon start|stop|status
//! ```
//!
//! `<repo>` accepts a repository id, its git URL or `org/repo`.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    branch::BranchCommand, check::CheckArgs, daemon::DaemonCommand, repo::RepoCommand,
    status::StatusArgs, tasks::TasksArgs, trigger::TriggerArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "wikisync",
    version,
    about = "Track git repositories and keep their generated wikis up to date",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register and list tracked repositories.
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Manage tracked branches and their languages.
    Branch {
        #[command(subcommand)]
        command: BranchCommand,
    },

    /// Queue a high-priority update for a repository.
    Trigger(TriggerArgs),

    /// Fetch a repository and list files changed since its checkpoint.
    Check(CheckArgs),

    /// Show repositories, branch checkpoints and active tasks.
    Status(StatusArgs),

    /// Show the update task history of a repository.
    Tasks(TasksArgs),

    /// Run or control the background scheduler.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    if !matches!(cli.command, Commands::Daemon { .. }) {
        init_cli_tracing();
    }
    match cli.command {
        Commands::Repo { command } => commands::repo::run(command),
        Commands::Branch { command } => commands::branch::run(command),
        Commands::Trigger(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Tasks(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}

/// Library warnings on stderr; the daemon installs its own subscriber.
fn init_cli_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
