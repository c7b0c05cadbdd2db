//! Sync daemon: directory watcher, retry driver and socket server.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_escalations, request_events, request_health, request_resolve, request_status,
    request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking};
