//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::analyzer::engine::ResolutionMode;
use crate::core::errors::{DiagError, Result};
use crate::core::paths;

/// Full diagnostic toolkit configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub search: SearchConfig,
    pub sync: SyncConfig,
    pub gc: GcConfig,
    pub analyze: AnalyzeConfig,
}

/// Filesystem paths used by the toolkit itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub jsonl_log: PathBuf,
    pub jsonl_fallback: Option<PathBuf>,
    pub sqlite_db: PathBuf,
}

/// Log search session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SearchConfig {
    /// Sessions untouched for this long are reaped.
    pub idle_timeout_secs: u64,
    pub page_size: usize,
}

/// Log sync supervisor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding `{uuid}.json` topology descriptors.
    pub topo_dir: PathBuf,
    /// Local root under which logs are mirrored.
    pub target_dir: PathBuf,
    pub interval_secs: u64,
    /// Forwarded verbatim to `rsync --bwlimit`.
    pub bwlimit: u64,
    pub rsync_program: String,
    /// Quiet period after a topology change before the reload runs.
    pub watch_settle_ms: u64,
    /// Time a cancelled child gets between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
}

/// Disk guard over the sync mirror tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,
    pub threshold_gib: u64,
    pub interval_secs: u64,
}

/// Analysis pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnalyzeConfig {
    pub default_mode: ResolutionMode,
    /// Empty means `<home>/diag.sqlite3`.
    pub database: PathBuf,
    pub top_slow_queries: usize,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: paths::default_config_path(),
            jsonl_log: paths::default_jsonl_path(),
            jsonl_fallback: Some(PathBuf::from("/tmp/cdiag-activity.jsonl")),
            sqlite_db: paths::default_sqlite_path(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            page_size: 100,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            topo_dir: PathBuf::from("/var/lib/cdiag/topology"),
            target_dir: PathBuf::from("/var/lib/cdiag/remote-log"),
            interval_secs: 60,
            bwlimit: 10_000,
            rsync_program: "rsync".to_string(),
            watch_settle_ms: 200,
            kill_grace_ms: 2_000,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_gib: 100,
            interval_secs: 3_600,
        }
    }
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            default_mode: ResolutionMode::Strict,
            database: PathBuf::new(),
            top_slow_queries: 10,
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| DiagError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(DiagError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(|name| env::var(name).ok())?;
        cfg.normalize_paths();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for activity logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut var = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        if let Some(raw) = var("DIAG_SYNC_TOPO_DIR") {
            self.sync.topo_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("DIAG_SYNC_TARGET_DIR") {
            self.sync.target_dir = PathBuf::from(raw);
        }
        if let Some(raw) = var("DIAG_SYNC_INTERVAL_SECS") {
            self.sync.interval_secs = parse_env_u64("DIAG_SYNC_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = var("DIAG_SYNC_BWLIMIT") {
            self.sync.bwlimit = parse_env_u64("DIAG_SYNC_BWLIMIT", &raw)?;
        }
        if let Some(raw) = var("DIAG_SYNC_RSYNC_PROGRAM") {
            self.sync.rsync_program = raw;
        }
        if let Some(raw) = var("DIAG_SEARCH_IDLE_TIMEOUT_SECS") {
            self.search.idle_timeout_secs = parse_env_u64("DIAG_SEARCH_IDLE_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("DIAG_GC_ENABLED") {
            self.gc.enabled = parse_env_bool("DIAG_GC_ENABLED", &raw)?;
        }
        if let Some(raw) = var("DIAG_GC_THRESHOLD_GIB") {
            self.gc.threshold_gib = parse_env_u64("DIAG_GC_THRESHOLD_GIB", &raw)?;
        }
        if let Some(raw) = var("DIAG_ANALYZE_DEFAULT_MODE") {
            self.analyze.default_mode =
                raw.parse::<ResolutionMode>()
                    .map_err(|details| DiagError::ConfigParse {
                        context: "env",
                        details: format!("DIAG_ANALYZE_DEFAULT_MODE={raw:?}: {details}"),
                    })?;
        }
        if let Some(raw) = var("DIAG_PATHS_JSONL_LOG") {
            self.paths.jsonl_log = PathBuf::from(raw);
        }
        Ok(())
    }

    /// Strip trailing slashes so task keys and mirror paths compare cleanly.
    fn normalize_paths(&mut self) {
        self.sync.topo_dir = paths::strip_trailing_slash(&self.sync.topo_dir);
        self.sync.target_dir = paths::strip_trailing_slash(&self.sync.target_dir);
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.idle_timeout_secs == 0 {
            return Err(DiagError::InvalidConfig {
                details: "search.idle_timeout_secs must be > 0".to_string(),
            });
        }
        if self.search.page_size == 0 {
            return Err(DiagError::InvalidConfig {
                details: "search.page_size must be > 0".to_string(),
            });
        }
        if self.sync.interval_secs == 0 {
            return Err(DiagError::InvalidConfig {
                details: "sync.interval_secs must be > 0".to_string(),
            });
        }
        if self.sync.rsync_program.trim().is_empty() {
            return Err(DiagError::InvalidConfig {
                details: "sync.rsync_program must not be empty".to_string(),
            });
        }
        if self.gc.enabled && self.gc.threshold_gib == 0 {
            return Err(DiagError::InvalidConfig {
                details: "gc.threshold_gib must be > 0 when gc is enabled".to_string(),
            });
        }
        if self.gc.interval_secs == 0 {
            return Err(DiagError::InvalidConfig {
                details: "gc.interval_secs must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|error| DiagError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim()
        .parse::<bool>()
        .map_err(|error| DiagError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::{Config, DiagError, ResolutionMode};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.search.idle_timeout_secs, 60);
        assert_eq!(cfg.analyze.default_mode, ResolutionMode::Strict);
    }

    #[test]
    fn zero_interval_rejected() {
        let mut cfg = Config::default();
        cfg.sync.interval_secs = 0;
        let err = cfg.validate().expect_err("expected invalid interval");
        match err {
            DiagError::InvalidConfig { details } => assert!(details.contains("interval_secs")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn gc_threshold_checked_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.gc.threshold_gib = 0;
        assert!(cfg.validate().is_ok());
        cfg.gc.enabled = true;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env = vars(&[
            ("DIAG_SYNC_INTERVAL_SECS", "5"),
            ("DIAG_SYNC_BWLIMIT", "42"),
            ("DIAG_SYNC_TARGET_DIR", "/data/mirror/"),
            ("DIAG_GC_ENABLED", "true"),
            ("DIAG_ANALYZE_DEFAULT_MODE", "tolerant"),
            ("DIAG_SEARCH_IDLE_TIMEOUT_SECS", " "),
        ]);
        let mut cfg = Config::default();
        cfg.apply_env_overrides_from(|name| env.get(name).cloned())
            .expect("overrides");
        cfg.normalize_paths();

        assert_eq!(cfg.sync.interval_secs, 5);
        assert_eq!(cfg.sync.bwlimit, 42);
        assert_eq!(cfg.sync.target_dir, PathBuf::from("/data/mirror"));
        assert!(cfg.gc.enabled);
        assert_eq!(cfg.analyze.default_mode, ResolutionMode::Tolerant);
        // Blank values are ignored.
        assert_eq!(cfg.search.idle_timeout_secs, 60);
    }

    #[test]
    fn env_invalid_number_rejected() {
        let env = vars(&[("DIAG_SYNC_BWLIMIT", "fast")]);
        let mut cfg = Config::default();
        let err = cfg
            .apply_env_overrides_from(|name| env.get(name).cloned())
            .expect_err("expected parse error");
        assert_eq!(err.code(), "DIAG-1003");
        assert!(err.to_string().contains("DIAG_SYNC_BWLIMIT"));
    }

    #[test]
    fn env_invalid_mode_rejected() {
        let env = vars(&[("DIAG_ANALYZE_DEFAULT_MODE", "lenient")]);
        let mut cfg = Config::default();
        assert!(
            cfg.apply_env_overrides_from(|name| env.get(name).cloned())
                .is_err()
        );
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/cdiag/config.toml")));
        assert!(matches!(result, Err(DiagError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[sync]\ninterval_secs = 7\ntopo_dir = \"/srv/topo/\"\n\n[analyze]\ndefault_mode = \"tolerant\"\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.sync.interval_secs, 7);
        assert_eq!(cfg.sync.topo_dir, PathBuf::from("/srv/topo"));
        assert_eq!(cfg.sync.bwlimit, 10_000);
        assert_eq!(cfg.analyze.default_mode, ResolutionMode::Tolerant);
        assert_eq!(cfg.paths.config_file, path);
    }

    #[test]
    fn stable_hash_changes_when_config_changes() {
        let cfg = Config::default();
        let before = cfg.stable_hash().expect("hash");
        assert_eq!(before, cfg.stable_hash().expect("hash"));

        let mut changed = cfg;
        changed.sync.bwlimit += 1;
        assert_ne!(before, changed.stable_hash().expect("hash"));
    }
}
