//! ProxyEnvSync - keeps shell proxy variables in step with the OS proxy.
//!
//! This crate holds the host-side pieces of the `proxyenv` binary:
//!
//! - Host lifecycle hooks (enter, normal exit, forced exit)
//! - The status report printed by the command line

pub mod lifecycle;
pub mod status;

pub use lifecycle::{ExitKind, HostSession};
pub use status::StatusReport;
