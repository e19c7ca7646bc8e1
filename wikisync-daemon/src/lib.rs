//! wikisync daemon: polling scheduler plus a Unix-socket control surface.
//!
//! - [`scheduler`]: drain queued update tasks, enqueue due rechecks
//! - [`runtime`]: tokio runtime, control socket, signal handling
//! - [`protocol`]: newline-delimited JSON client used by the CLI

pub mod error;
pub mod protocol;
pub mod runtime;
pub mod scheduler;

pub use error::DaemonError;
pub use protocol::{
    daemon_running, request_status, request_stop, request_trigger, send_request, DaemonRequest,
    DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking};
pub use scheduler::{Clock, IterationReport, Scheduler, TaskProcessor};
