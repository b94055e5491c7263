//! Wire contract between the safesh supervisor and the sandboxed child.
//!
//! The child talks back to its parent over stderr using line-prefixed
//! markers; blocked commands are additionally persisted as a pending-command
//! record so the supervisor can re-drive the script after the user decides.
//! Everything in this crate is plain data: rendering for humans lives in the
//! host layer.

mod markers;
mod pending;

pub use markers::CMD_ERROR_MARKER_PREFIX;
pub use markers::CmdErrorMarker;
pub use markers::INIT_ERROR_MARKER_PREFIX;
pub use markers::InitErrorMarker;
pub use markers::JOB_MARKER_PREFIX;
pub use markers::JobMarker;
pub use markers::JobMarkerKind;
pub use markers::Marker;
pub use markers::parse_marker_line;
pub use pending::DenyRetryRequest;
pub use pending::PendingCommand;
pub use pending::RetryChoice;
