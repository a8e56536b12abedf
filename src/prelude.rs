//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use cluster_diag::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{DiagError, Result};

// Values
pub use crate::values::float_series::FloatSeries;
pub use crate::values::tagged::{TaggedFloat, TaggedScalar};

// Logs
pub use crate::logs::descriptor::{FileDescriptor, resolve_dir};
pub use crate::logs::item::{Level, LogItem, LogKind, Timestamp};
pub use crate::logs::iterator::{FileIterator, LogStream};
pub use crate::logs::merge::MergeSequence;
pub use crate::logs::searcher::{SearchSession, Searcher};

// Splitter
pub use crate::splitter::{SplitReport, split_dir};

// Analyzer
pub use crate::analyzer::engine::{AnalysisTask, Engine, ResolutionMode, RunReport, TaskOutcome, Wiring};
pub use crate::analyzer::pipeline::{AnalysisOutcome, AnalysisReport, AnalyzeRequest, analyze};

// Syncer
pub use crate::syncer::cancel::{CancelSource, CancelToken};
pub use crate::syncer::task_manager::TaskManager;
pub use crate::syncer::topology::{ClusterTopology, SyncTask, load_tasks};
