//! Offline analysis of a collected inspection.

pub mod engine;
pub mod pipeline;
#[cfg(feature = "sqlite")]
pub mod sink;
pub mod slow_query;
