//! Long-running sync service: a [`LifecycleController`] driving cycles on
//! an interval, on source-directory changes and on request over a Unix
//! control socket, with bounded graceful shutdown.

mod error;
pub mod lifecycle;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use lifecycle::{
    ControllerStatus, CycleJob, CycleRunner, LifecycleController, ShutdownReport, Trigger,
};
pub use protocol::{
    request_status, request_stop, request_sync, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking, RuntimeSettings};
