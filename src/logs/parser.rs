//! Head-line recognizers for every supported log shape.
//!
//! A head is the first line of a record; every other line is a continuation
//! of the most recent head. Parsers never fail: an unrecognized line simply
//! yields [`Head::NONE`].

#![allow(missing_docs)]

use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::logs::item::{Level, Timestamp};
use crate::logs::timefmt;

/// Result of polling one parser against one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Head {
    pub time: Option<Timestamp>,
    pub level: Level,
}

impl Head {
    /// "Not a head".
    pub const NONE: Self = Self {
        time: None,
        level: Level::Invalid,
    };

    fn at(time: Timestamp, level: Level) -> Self {
        Self {
            time: Some(time),
            level,
        }
    }

    /// Head that must carry a recognized level.
    fn leveled(time: Option<Timestamp>, level: Level) -> Self {
        match time {
            Some(t) if level.is_valid() => Self::at(t, level),
            _ => Self::NONE,
        }
    }

    pub const fn is_head(&self) -> bool {
        self.time.is_some()
    }
}

/// A pure predicate over one line.
pub trait HeadParser: Send {
    fn name(&self) -> &'static str;
    fn parse_head(&self, line: &[u8]) -> Head;
}

// ──────────────────── patterns ────────────────────

fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(err) => {
            eprintln!("[DIAG-PARSER] failed to compile head pattern {pattern:?}: {err}");
            None
        }
    }
}

static UNIFIED_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r"^\[([^\[\]]*)\]\s\[([^\[\]]*)\]"));

static PD_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{3})\s[^\s]*\s\[([^\[\]]*)\]")
});

static TIKV_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r"^(\d{4}/\d{2}/\d{2} \d{2}:\d{2}:\d{2}\.\d{3})(?: ([+-]\d{2}:\d{2}))? ([^\s]+)")
});

static TIFLASH_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r"^(\d{4}\.\d{2}\.\d{2} \d{2}:\d{2}:\d{2}\.\d{6})\s\[\s*\d+\s*\]\s<(\w+)>")
});

static SLOW_QUERY_RE: LazyLock<Option<Regex>> = LazyLock::new(|| compile(r"^# Time: (.*)$"));

fn captures<'a>(re: &LazyLock<Option<Regex>>, line: &'a [u8]) -> Option<regex::bytes::Captures<'a>> {
    re.as_ref()?.captures(line)
}

// ──────────────────── parsers ────────────────────

/// `[2019/03/04 17:04:24.614 +08:00] [INFO] ...`
#[derive(Debug, Default, Clone, Copy)]
pub struct UnifiedParser;

impl HeadParser for UnifiedParser {
    fn name(&self) -> &'static str {
        "unified"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(caps) = captures(&UNIFIED_RE, line) else {
            return Head::NONE;
        };
        Head::leveled(
            timefmt::parse_unified(&caps[1]),
            Level::from_token(&caps[2]),
        )
    }
}

/// `2019/07/18 11:04:29.314 server.go:12: [info] ...`
#[derive(Debug, Default, Clone, Copy)]
pub struct PdParser;

impl HeadParser for PdParser {
    fn name(&self) -> &'static str {
        "pd"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(caps) = captures(&PD_RE, line) else {
            return Head::NONE;
        };
        Head::leveled(timefmt::parse_former(&caps[1]), Level::from_token(&caps[2]))
    }
}

/// `2019/07/18 11:04:29.314 [+08:00] INFO ...`
#[derive(Debug, Default, Clone, Copy)]
pub struct TikvParser;

impl HeadParser for TikvParser {
    fn name(&self) -> &'static str {
        "tikv"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(caps) = captures(&TIKV_RE, line) else {
            return Head::NONE;
        };
        let offset = caps.get(2).map(|m| m.as_bytes());
        Head::leveled(
            timefmt::parse_former_with_offset(&caps[1], offset),
            Level::from_token(&caps[3]),
        )
    }
}

/// `level=warn ts=2019-08-22T10:46:31.818Z caller=...`
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusParser;

impl HeadParser for PrometheusParser {
    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        if !(line.starts_with(b"level=") || line.starts_with(b"ts=")) {
            return Head::NONE;
        }
        let mut time = None;
        let mut level = Level::Invalid;
        for token in line.split(|b| *b == b' ') {
            if let Some(v) = token.strip_prefix(b"ts=") {
                time = timefmt::parse_rfc3339(trim_quotes(v));
            } else if let Some(v) = token.strip_prefix(b"level=") {
                level = Level::from_token(trim_quotes(v));
            }
            if time.is_some() && level.is_valid() {
                break;
            }
        }
        Head::leveled(time, level)
    }
}

fn trim_quotes(v: &[u8]) -> &[u8] {
    v.strip_prefix(b"\"")
        .and_then(|s| s.strip_suffix(b"\""))
        .unwrap_or(v)
}

/// `2019.07.18 11:04:29.314159 [ 42 ] <Error> ...`
#[derive(Debug, Default, Clone, Copy)]
pub struct TiFlashErrParser;

impl HeadParser for TiFlashErrParser {
    fn name(&self) -> &'static str {
        "tiflash"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(caps) = captures(&TIFLASH_RE, line) else {
            return Head::NONE;
        };
        // TiFlash spells out its own level names.
        let level = match caps[2].to_ascii_uppercase().as_slice() {
            b"INFORMATION" => Level::Info,
            b"TRACE" => Level::Debug,
            other => Level::from_token(other),
        };
        Head::leveled(timefmt::parse_tiflash(&caps[1]), level)
    }
}

/// `# Time: 2019-08-22T10:46:31.818+08:00`; carries no level.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlowQueryParser;

impl HeadParser for SlowQueryParser {
    fn name(&self) -> &'static str {
        "slow_query"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(caps) = captures(&SLOW_QUERY_RE, line) else {
            return Head::NONE;
        };
        match timefmt::parse_slow_query_time(&caps[1]) {
            Some(t) => Head::at(t, Level::Invalid),
            None => Head::NONE,
        }
    }
}

fn json_object(line: &[u8]) -> Option<serde_json::Map<String, serde_json::Value>> {
    if line.first() != Some(&b'{') {
        return None;
    }
    match serde_json::from_slice::<serde_json::Value>(line).ok()? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// `{"level":"INFO","time":"2022/01/14 08:09:55.307 +01:00",...}`
#[derive(Debug, Default, Clone, Copy)]
pub struct UnifiedJsonParser;

impl HeadParser for UnifiedJsonParser {
    fn name(&self) -> &'static str {
        "unified_json"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(map) = json_object(line) else {
            return Head::NONE;
        };
        let time = map
            .get("time")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| timefmt::parse_unified(s.as_bytes()));
        let level = map
            .get("level")
            .and_then(serde_json::Value::as_str)
            .map_or(Level::Invalid, |s| Level::from_token(s.as_bytes()));
        Head::leveled(time, level)
    }
}

/// `{"TIME":"2025/06/12 09:58:40.697 +02:00","EVENT":["QUERY"],...}`
#[derive(Debug, Default, Clone, Copy)]
pub struct AuditJsonParser;

impl HeadParser for AuditJsonParser {
    fn name(&self) -> &'static str {
        "audit_json"
    }

    fn parse_head(&self, line: &[u8]) -> Head {
        let Some(map) = json_object(line) else {
            return Head::NONE;
        };
        if !map.contains_key("EVENT") {
            return Head::NONE;
        }
        match map
            .get("TIME")
            .and_then(serde_json::Value::as_str)
            .and_then(|s| timefmt::parse_unified(s.as_bytes()))
        {
            Some(t) => Head::at(t, Level::Invalid),
            None => Head::NONE,
        }
    }
}

// ──────────────────── MRU set ────────────────────

/// Ordered parser list owned by a single iterator. A parser that recognizes
/// a head is moved to the front so homogeneous files hit on the first poll.
pub struct ParserSet {
    parsers: Vec<Box<dyn HeadParser>>,
}

impl ParserSet {
    pub fn new(parsers: Vec<Box<dyn HeadParser>>) -> Self {
        Self { parsers }
    }

    /// Every known shape.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(UnifiedParser),
            Box::new(UnifiedJsonParser),
            Box::new(TikvParser),
            Box::new(PdParser),
            Box::new(SlowQueryParser),
            Box::new(PrometheusParser),
            Box::new(TiFlashErrParser),
            Box::new(AuditJsonParser),
        ])
    }

    /// Poll parsers in MRU order; swap the hitting one to the front.
    pub fn parse(&mut self, line: &[u8]) -> Option<(Timestamp, Level)> {
        for idx in 0..self.parsers.len() {
            let head = self.parsers[idx].parse_head(line);
            if let Some(time) = head.time {
                self.parsers.swap(0, idx);
                return Some((time, head.level));
            }
        }
        None
    }

    pub fn order(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }
}

impl Default for ParserSet {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for ParserSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.order()).finish()
    }
}
