//! wikisync core library: domain types, configuration, durable task store.
//!
//! Public API surface:
//! - [`types`]: newtypes and domain structs
//! - [`config`]: `config.yaml` loading and validation
//! - [`paths`]: `~/.wikisync/` layout
//! - [`store`]: repositories, branches and update tasks persisted in `state.json`
//! - [`error`]: [`StoreError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::StoreError;
pub use store::{Checkpoint, EnqueueOutcome, NewRepository, NewTask, Store};
pub use types::{
    Branch, BranchId, Credentials, Repository, RepositoryId, RepositoryStatus, TaskId, TaskKind,
    TaskStatus, UpdateTask,
};
