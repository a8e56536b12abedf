//! Log mirroring from cluster hosts: topology descriptors, rsync lanes,
//! directory watching and the optional disk guard.

pub mod cancel;
pub mod gc;
#[cfg(feature = "daemon")]
pub mod supervisor;
pub mod task_manager;
pub mod topology;
pub mod watcher;
