//! Timestamp shapes found at the head of component logs.
//!
//! | shape | example | zone |
//! |---|---|---|
//! | unified | `2019/03/04 17:04:24.614 +08:00` | explicit |
//! | former | `2019/07/18 11:04:29.314` | Asia/Chongqing |
//! | TiFlash | `2019.07.18 11:04:29.314159` | process local |
//! | RFC3339Nano | `2019-08-22T10:46:31.818+08:00` | explicit |
//! | old slow-query | `2019-08-22-10:46:31.818 +0800` | explicit |

#![allow(missing_docs)]

use chrono::{DateTime, FixedOffset, Local, NaiveDateTime, TimeZone};

use crate::core::errors::{DiagError, Result};
use crate::logs::item::Timestamp;

const UNIFIED_LAYOUT: &str = "%Y/%m/%d %H:%M:%S%.f %:z";
const FORMER_LAYOUT: &str = "%Y/%m/%d %H:%M:%S%.f";
const TIFLASH_LAYOUT: &str = "%Y.%m.%d %H:%M:%S%.f";
const OLD_SLOW_QUERY_LAYOUT: &str = "%Y-%m-%d-%H:%M:%S%.f %z";
const DASHED_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Asia/Chongqing has been a fixed UTC+08:00 zone since 1991.
const CHONGQING: FixedOffset = match FixedOffset::east_opt(8 * 3600) {
    Some(offset) => offset,
    None => panic!("UTC+08:00 is a valid offset"),
};

pub const fn chongqing() -> FixedOffset {
    CHONGQING
}

fn as_str(b: &[u8]) -> Option<&str> {
    std::str::from_utf8(b).ok()
}

/// `YYYY/MM/DD HH:MM:SS.mmm ±HH:MM`
pub fn parse_unified(b: &[u8]) -> Option<Timestamp> {
    DateTime::parse_from_str(as_str(b)?.trim(), UNIFIED_LAYOUT).ok()
}

/// `YYYY/MM/DD HH:MM:SS.mmm` in Asia/Chongqing.
pub fn parse_former(b: &[u8]) -> Option<Timestamp> {
    let naive = NaiveDateTime::parse_from_str(as_str(b)?, FORMER_LAYOUT).ok()?;
    chongqing().from_local_datetime(&naive).single()
}

/// Former layout with an optional trailing `±HH:MM` offset.
pub fn parse_former_with_offset(b: &[u8], offset: Option<&[u8]>) -> Option<Timestamp> {
    match offset {
        Some(off) => {
            let mut joined = Vec::with_capacity(b.len() + off.len() + 1);
            joined.extend_from_slice(b);
            joined.push(b' ');
            joined.extend_from_slice(off);
            parse_unified(&joined)
        }
        None => parse_former(b),
    }
}

/// `YYYY.MM.DD HH:MM:SS.ffffff` in the process-local zone.
pub fn parse_tiflash(b: &[u8]) -> Option<Timestamp> {
    let naive = NaiveDateTime::parse_from_str(as_str(b)?, TIFLASH_LAYOUT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.fixed_offset())
}

/// RFC3339 with optional nanoseconds.
pub fn parse_rfc3339(b: &[u8]) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(as_str(b)?.trim()).ok()
}

/// Slow-query `# Time:` value: RFC3339Nano, or the pre-3.0 dashed layout.
pub fn parse_slow_query_time(b: &[u8]) -> Option<Timestamp> {
    parse_rfc3339(b)
        .or_else(|| DateTime::parse_from_str(as_str(b)?.trim(), OLD_SLOW_QUERY_LAYOUT).ok())
}

/// Time given on the command line: RFC3339, unified, or a zone-less
/// `YYYY/MM/DD HH:MM:SS` / `YYYY-MM-DD HH:MM:SS` read as Asia/Chongqing.
pub fn parse_user_time(raw: &str) -> Result<Timestamp> {
    let trimmed = raw.trim();
    let b = trimmed.as_bytes();
    if let Some(t) = parse_rfc3339(b).or_else(|| parse_unified(b)).or_else(|| parse_former(b)) {
        return Ok(t);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, DASHED_LAYOUT)
        && let Some(t) = chongqing().from_local_datetime(&naive).single()
    {
        return Ok(t);
    }
    Err(DiagError::malformed(
        "timestamp",
        format!("{raw:?} is neither RFC3339 nor YYYY/MM/DD HH:MM:SS"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rfc(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn unified_keeps_explicit_offset() {
        let t = parse_unified(b"2022/12/04 21:37:15.834 +08:00").unwrap();
        assert_eq!(t, rfc("2022-12-04T21:37:15.834+08:00"));
        assert_eq!(t.offset().local_minus_utc(), 8 * 3600);
        assert!(parse_unified(b"2022/12/04 21:37:15.834").is_none());
    }

    #[test]
    fn former_is_read_in_chongqing() {
        let t = parse_former(b"2019/07/18 11:04:29.314").unwrap();
        assert_eq!(t, rfc("2019-07-18T03:04:29.314Z"));
        assert!(parse_former(b"2019-07-18 11:04:29.314").is_none());
    }

    #[test]
    fn former_with_offset_prefers_explicit_zone() {
        let t = parse_former_with_offset(b"2019/07/18 11:04:29.314", Some(b"+00:00")).unwrap();
        assert_eq!(t, rfc("2019-07-18T11:04:29.314Z"));
        let t = parse_former_with_offset(b"2019/07/18 11:04:29.314", None).unwrap();
        assert_eq!(t, rfc("2019-07-18T03:04:29.314Z"));
    }

    #[test]
    fn rfc3339_nano_and_old_slow_query() {
        let t = parse_slow_query_time(b"2019-08-22T10:46:31.818123456+08:00").unwrap();
        assert_eq!(t.timestamp_subsec_nanos(), 818_123_456);
        let old = parse_slow_query_time(b"2019-08-22-10:46:31.818 +0800").unwrap();
        assert_eq!(old, rfc("2019-08-22T10:46:31.818+08:00"));
        assert!(parse_slow_query_time(b"yesterday").is_none());
    }

    #[test]
    fn tiflash_parses_microseconds() {
        let t = parse_tiflash(b"2019.07.18 11:04:29.314159").unwrap();
        assert_eq!(t.timestamp_subsec_micros(), 314_159);
    }

    #[test]
    fn user_time_accepts_several_layouts() {
        let expected = rfc("2019-07-18T03:04:29Z");
        assert_eq!(parse_user_time("2019-07-18T11:04:29+08:00").unwrap(), expected);
        assert_eq!(parse_user_time("2019/07/18 11:04:29").unwrap(), expected);
        assert_eq!(parse_user_time("2019-07-18 11:04:29").unwrap(), expected);
        assert_eq!(
            parse_user_time("2019/07/18 11:04:29.000 +08:00").unwrap(),
            expected
        );
        assert_eq!(parse_user_time("soon").unwrap_err().code(), "DIAG-2001");
    }
}
