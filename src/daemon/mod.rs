//! Process-level plumbing for the long-running sync supervisor.

#[cfg(feature = "daemon")]
pub mod signals;
