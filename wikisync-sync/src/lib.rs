//! # wikisync-sync
//!
//! Working copies, change detection and update orchestration.
//!
//! [`WorkspaceManager`] clones or fast-forwards a branch and diffs two
//! commits; [`Orchestrator::process_update`] turns the diff into generator
//! calls and advances the branch checkpoint only when every language variant
//! succeeded.

pub mod diff;
pub mod error;
mod git;
pub mod generator;
pub mod notify;
pub mod orchestrator;
pub mod retry;
pub mod workspace;

pub use error::SyncError;
pub use generator::{CommandGenerator, WikiGenerator};
pub use notify::{LogNotifier, Notifier, Notifiers, UpdateNotification, WebhookNotifier};
pub use orchestrator::{
    check_for_updates, trigger_manual_update, Orchestrator, UpdateCheck, UpdateMode, UpdateOutcome,
};
pub use retry::RetryPolicy;
pub use workspace::{sanitize_component, Workspace, WorkspaceManager};
