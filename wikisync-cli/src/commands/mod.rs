pub mod branch;
pub mod check;
pub mod daemon;
pub mod repo;
pub mod status;
pub mod tasks;
pub mod trigger;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use wikisync_core::{Config, Store};

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

pub(crate) fn load_config(home: &std::path::Path) -> Result<Config> {
    Config::load_at(home).context("failed to load ~/.wikisync/config.yaml")
}

pub(crate) fn open_store(home: &std::path::Path) -> Result<Store> {
    Store::open_at(home).context("failed to open ~/.wikisync state")
}

/// First 8 characters of a commit id, `-` when absent.
pub(crate) fn short_commit(commit: Option<&str>) -> String {
    match commit {
        Some(commit) => commit.chars().take(8).collect(),
        None => "-".to_string(),
    }
}

/// `42s`, `5m`, `3h`, `2d` ago; `never` when absent.
pub(crate) fn format_age(timestamp: Option<DateTime<Utc>>) -> String {
    let Some(timestamp) = timestamp else {
        return "never".to_string();
    };
    let seconds = Utc::now()
        .signed_duration_since(timestamp)
        .num_seconds()
        .max(0) as u64;
    let age = if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 60 * 60 {
        format!("{}m", seconds / 60)
    } else if seconds < 60 * 60 * 24 {
        format!("{}h", seconds / (60 * 60))
    } else {
        format!("{}d", seconds / (60 * 60 * 24))
    };
    format!("{age} ago")
}
