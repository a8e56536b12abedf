//! Activity logging: JSONL append-only log plus an optional SQLite mirror.

pub mod dual;
pub mod jsonl;
#[cfg(feature = "sqlite")]
pub mod sqlite;
