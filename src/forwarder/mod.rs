//! Per-account forwarders and their supervisor.
//!
//! Each running account gets one background task that polls its Saved
//! Messages and forwards new entries to every group it belongs to. The
//! [`Supervisor`] guarantees at most one such task per account.

mod error;
mod registry;
mod runner;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ForwarderError, PolicyViolation, SupervisorError};
pub use supervisor::{RunningForwarder, Supervisor};
