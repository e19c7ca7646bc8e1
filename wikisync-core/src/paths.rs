use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub const STATE_FILE: &str = "state.json";
pub const STATE_LOCK_FILE: &str = "state.lock";
pub const CONFIG_FILE: &str = "config.yaml";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn wikisync_root(home: &Path) -> PathBuf {
    home.join(".wikisync")
}

pub fn state_path(home: &Path) -> PathBuf {
    wikisync_root(home).join(STATE_FILE)
}

/// Advisory lock held around every read-modify-write of `state.json`.
pub fn state_lock_path(home: &Path) -> PathBuf {
    wikisync_root(home).join(STATE_LOCK_FILE)
}

pub fn config_path(home: &Path) -> PathBuf {
    wikisync_root(home).join(CONFIG_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    wikisync_root(home).join(DAEMON_SOCKET)
}

/// Default parent of all working copies when `workspace.repositories_dir` is unset.
pub fn default_repositories_dir(home: &Path) -> PathBuf {
    wikisync_root(home).join("repos")
}

pub fn home() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}
