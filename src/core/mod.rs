//! Core types: errors, configuration, filesystem layout.

pub mod config;
pub mod errors;
pub mod paths;
