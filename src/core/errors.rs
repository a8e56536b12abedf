//! DIAG-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, DiagError>;

/// Top-level error type for the diagnostic toolkit.
#[derive(Debug, Error)]
pub enum DiagError {
    #[error("[DIAG-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[DIAG-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[DIAG-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[DIAG-2001] malformed {context}: {details}")]
    ParseMalformed {
        context: &'static str,
        details: String,
    },

    #[error("[DIAG-2002] log record in {file} exceeds {limit} bytes")]
    ContentOverflow { file: String, limit: usize },

    #[error("[DIAG-2003] cannot classify log kind for component {component:?}")]
    UnknownComponent { component: String },

    #[error("[DIAG-2101] unknown search token {token:?}")]
    UnknownToken { token: String },

    #[error("[DIAG-2201] invalid task {task:?}: {reason}")]
    InvalidTask { task: String, reason: String },

    #[error("[DIAG-2301] copy failed for {key}: {details}")]
    CopyFailed { key: String, details: String },

    #[error("[DIAG-3001] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[DIAG-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[DIAG-3003] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[DIAG-3004] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[DIAG-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl DiagError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "DIAG-1001",
            Self::MissingConfig { .. } => "DIAG-1002",
            Self::ConfigParse { .. } => "DIAG-1003",
            Self::ParseMalformed { .. } => "DIAG-2001",
            Self::ContentOverflow { .. } => "DIAG-2002",
            Self::UnknownComponent { .. } => "DIAG-2003",
            Self::UnknownToken { .. } => "DIAG-2101",
            Self::InvalidTask { .. } => "DIAG-2201",
            Self::CopyFailed { .. } => "DIAG-2301",
            Self::Serialization { .. } => "DIAG-3001",
            Self::Io { .. } => "DIAG-3002",
            Self::Sql { .. } => "DIAG-3003",
            Self::ChannelClosed { .. } => "DIAG-3004",
            Self::Runtime { .. } => "DIAG-3900",
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Convenience constructor for malformed input.
    #[must_use]
    pub fn malformed(context: &'static str, details: impl Into<String>) -> Self {
        Self::ParseMalformed {
            context,
            details: details.into(),
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for DiagError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for DiagError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for DiagError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<DiagError> {
        vec![
            DiagError::InvalidConfig {
                details: String::new(),
            },
            DiagError::MissingConfig {
                path: PathBuf::new(),
            },
            DiagError::ConfigParse {
                context: "",
                details: String::new(),
            },
            DiagError::malformed("", ""),
            DiagError::ContentOverflow {
                file: String::new(),
                limit: 0,
            },
            DiagError::UnknownComponent {
                component: String::new(),
            },
            DiagError::UnknownToken {
                token: String::new(),
            },
            DiagError::InvalidTask {
                task: String::new(),
                reason: String::new(),
            },
            DiagError::CopyFailed {
                key: String::new(),
                details: String::new(),
            },
            DiagError::Serialization {
                context: "",
                details: String::new(),
            },
            DiagError::io("", std::io::Error::other("test")),
            DiagError::Sql {
                context: "",
                details: String::new(),
            },
            DiagError::ChannelClosed { component: "" },
            DiagError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = all_variants();
        let codes: Vec<&str> = errors.iter().map(DiagError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_codes_have_diag_prefix_and_appear_in_display() {
        for err in all_variants() {
            assert!(
                err.code().starts_with("DIAG-"),
                "code {} must start with DIAG-",
                err.code()
            );
            assert!(
                err.to_string().contains(err.code()),
                "display should contain error code: {err}"
            );
        }
    }

    #[test]
    fn io_convenience_constructor() {
        let err = DiagError::io(
            "/tmp/test.log",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "DIAG-3002");
        assert!(err.to_string().contains("/tmp/test.log"));
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: DiagError = sql_err.into();
        assert_eq!(err.code(), "DIAG-3003");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: DiagError = json_err.into();
        assert_eq!(err.code(), "DIAG-3001");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: DiagError = toml_err.into();
        assert_eq!(err.code(), "DIAG-1003");
    }
}
