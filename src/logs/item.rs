//! Parsed log records and their classification.

#![allow(missing_docs)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::core::errors::{DiagError, Result};

/// Wall-clock instant carrying the offset it was written with.
pub type Timestamp = DateTime<FixedOffset>;

/// Upper bound on a record's assembled content.
pub const MAX_CONTENT_SIZE: usize = 1024 * 1024;

/// File name that marks a TiDB slow-query log.
pub const SLOW_QUERY_FILE_NAME: &str = "tidb_slow_query.log";

/// Normalized log level. `Invalid` marks formats without a level and, as a
/// search filter, means "any level".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Invalid,
}

impl Level {
    /// Case-insensitive level token normalization.
    pub fn from_token(token: &[u8]) -> Self {
        let upper = token.to_ascii_uppercase();
        match upper.as_slice() {
            b"CRITICAL" | b"FATAL" => Self::Fatal,
            b"ERROR" | b"ERRO" => Self::Error,
            b"WARNING" | b"WARN" => Self::Warn,
            b"INFO" => Self::Info,
            b"DEBUG" => Self::Debug,
            _ => Self::Invalid,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Invalid => "INVALID",
        }
    }

    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = DiagError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("any") || s.eq_ignore_ascii_case("invalid") {
            return Ok(Self::Invalid);
        }
        match Self::from_token(s.as_bytes()) {
            Self::Invalid => Err(DiagError::malformed("log level", s)),
            level => Ok(level),
        }
    }
}

/// Which component produced a log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogKind {
    TiDB,
    TiKV,
    PD,
    TiDBSlowQuery,
    Prometheus,
    TiFlashErr,
    Invalid,
}

impl LogKind {
    /// Classify by component name, with the slow-query file name override.
    pub fn classify(component: &str, filename: &str) -> Self {
        match component {
            "tidb" if filename == SLOW_QUERY_FILE_NAME => Self::TiDBSlowQuery,
            "tidb" => Self::TiDB,
            "tikv" => Self::TiKV,
            "pd" => Self::PD,
            "prometheus" => Self::Prometheus,
            "tiflash" => Self::TiFlashErr,
            _ => Self::Invalid,
        }
    }
}

/// One log record. `content` holds the head line followed by any
/// continuation lines, joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogItem {
    pub host: String,
    pub port: String,
    pub component: String,
    pub file: String,
    pub time: Timestamp,
    pub level: Level,
    pub kind: LogKind,
    pub content: Vec<u8>,
}

impl LogItem {
    /// Append a continuation line.
    pub fn append_content(&mut self, line: &[u8]) -> Result<()> {
        if self.content.len() + 1 + line.len() > MAX_CONTENT_SIZE {
            return Err(DiagError::ContentOverflow {
                file: self.file.clone(),
                limit: MAX_CONTENT_SIZE,
            });
        }
        self.content.push(b'\n');
        self.content.extend_from_slice(line);
        Ok(())
    }

    pub fn content_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(content: &[u8]) -> LogItem {
        LogItem {
            host: "h".to_string(),
            port: "4000".to_string(),
            component: "tidb".to_string(),
            file: "tidb.log".to_string(),
            time: DateTime::parse_from_rfc3339("2022-12-04T21:37:15.834+08:00").unwrap(),
            level: Level::Info,
            kind: LogKind::TiDB,
            content: content.to_vec(),
        }
    }

    #[test]
    fn level_tokens_normalize_case_insensitively() {
        assert_eq!(Level::from_token(b"critical"), Level::Fatal);
        assert_eq!(Level::from_token(b"FATAL"), Level::Fatal);
        assert_eq!(Level::from_token(b"erro"), Level::Error);
        assert_eq!(Level::from_token(b"Error"), Level::Error);
        assert_eq!(Level::from_token(b"warning"), Level::Warn);
        assert_eq!(Level::from_token(b"WARN"), Level::Warn);
        assert_eq!(Level::from_token(b"info"), Level::Info);
        assert_eq!(Level::from_token(b"Debug"), Level::Debug);
        assert_eq!(Level::from_token(b"trace"), Level::Invalid);
        assert_eq!(Level::from_token(b""), Level::Invalid);
    }

    #[test]
    fn level_from_str_accepts_any() {
        assert_eq!("any".parse::<Level>().unwrap(), Level::Invalid);
        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert!("verbose".parse::<Level>().is_err());
    }

    #[test]
    fn kind_classification_uses_slow_query_override() {
        assert_eq!(LogKind::classify("tidb", "tidb.log"), LogKind::TiDB);
        assert_eq!(
            LogKind::classify("tidb", SLOW_QUERY_FILE_NAME),
            LogKind::TiDBSlowQuery
        );
        assert_eq!(
            LogKind::classify("tikv", SLOW_QUERY_FILE_NAME),
            LogKind::TiKV
        );
        assert_eq!(LogKind::classify("pd", "pd.log"), LogKind::PD);
        assert_eq!(LogKind::classify("grafana", "x.log"), LogKind::Invalid);
    }

    #[test]
    fn append_joins_with_newline() {
        let mut it = item(b"head");
        it.append_content(b"tail").unwrap();
        assert_eq!(it.content, b"head\ntail");
    }

    #[test]
    fn append_rejects_overflow() {
        let mut it = item(&vec![b'x'; MAX_CONTENT_SIZE - 4]);
        it.append_content(b"ab").unwrap();
        let err = it.append_content(b"c").unwrap_err();
        assert_eq!(err.code(), "DIAG-2002");
        assert_eq!(it.content.len(), MAX_CONTENT_SIZE - 1);
    }
}
