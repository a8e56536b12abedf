#![forbid(unsafe_code)]

//! Cluster diagnostics (cdiag): log mirroring, time-window retrieval and
//! offline analysis for TiDB clusters.
//!
//! - **Retrieval** ([`logs`]): per-format head parsers, windowed file
//!   iteration with binary seek, k-way merge and resumable searches.
//! - **Slicing** ([`splitter`]): copy the lines of a log tree that fall in a
//!   time window.
//! - **Analysis** ([`analyzer`]): a dependency-resolved task engine and the
//!   standard inspection pipeline.
//! - **Sync** ([`syncer`]): rsync lanes per component, rebuilt whenever the
//!   topology directory changes.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use cluster_diag::prelude::*;
//! ```

pub mod prelude;

pub mod analyzer;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod logs;
pub mod splitter;
pub mod syncer;
pub mod values;
