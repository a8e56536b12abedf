//! Filesystem layout of the toolkit's own state, and path normalization.

use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "cdiag";

fn home() -> PathBuf {
    env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
}

/// `$HOME/.config/cdiag/config.toml`
pub fn default_config_path() -> PathBuf {
    home().join(".config").join(APP_DIR).join("config.toml")
}

/// `$HOME/.local/share/cdiag`
pub fn data_dir() -> PathBuf {
    home().join(".local/share").join(APP_DIR)
}

pub fn default_jsonl_path() -> PathBuf {
    data_dir().join("activity.jsonl")
}

pub fn default_sqlite_path() -> PathBuf {
    data_dir().join("activity.sqlite3")
}

/// Analysis database under a diagnosis home.
pub fn analysis_db_path(home: &Path) -> PathBuf {
    home.join("diag.sqlite3")
}

/// Drop trailing separators (`/a/b/` → `/a/b`); the root stays `/`.
pub fn strip_trailing_slash(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() && s.starts_with('/') {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_stripped() {
        assert_eq!(strip_trailing_slash(Path::new("/data/topo/")), PathBuf::from("/data/topo"));
        assert_eq!(strip_trailing_slash(Path::new("/data/topo//")), PathBuf::from("/data/topo"));
        assert_eq!(strip_trailing_slash(Path::new("rel")), PathBuf::from("rel"));
        assert_eq!(strip_trailing_slash(Path::new("/")), PathBuf::from("/"));
    }

    #[test]
    fn layout_lives_under_app_dir() {
        assert!(default_jsonl_path().ends_with("cdiag/activity.jsonl"));
        assert!(default_config_path().ends_with(".config/cdiag/config.toml"));
        assert_eq!(analysis_db_path(Path::new("/h")), PathBuf::from("/h/diag.sqlite3"));
    }
}
