//! TiDB slow-query record parsing.
//!
//! A record is the `# Time:` head, any number of `# Key: value ...` lines,
//! then the SQL. On a field line a token ending in `:` starts a key; the
//! tokens up to the next key form its value, joined by single spaces.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::errors::{DiagError, Result};
use crate::logs::item::Timestamp;
use crate::logs::timefmt;

const TIME_PREFIX: &str = "# Time:";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SlowQueryRecord {
    pub time: Option<Timestamp>,
    pub txn_start_ts: u64,
    pub user: String,
    pub host: String,
    pub conn_id: u64,
    pub query_time: f64,
    pub process_time: f64,
    pub wait_time: f64,
    pub backoff_time: f64,
    pub request_count: u64,
    pub total_keys: u64,
    pub process_keys: u64,
    pub db: String,
    pub index_ids: String,
    pub is_internal: bool,
    pub digest: String,
    pub stats: String,
    pub cop_proc_avg: f64,
    pub cop_proc_p90: f64,
    pub cop_proc_max: f64,
    pub cop_proc_addr: String,
    pub cop_wait_avg: f64,
    pub cop_wait_p90: f64,
    pub cop_wait_max: f64,
    pub cop_wait_addr: String,
    pub mem_max: i64,
    pub succ: bool,
    pub sql: String,
}

fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| DiagError::malformed("slow query field", format!("{key}: {value:?}")))
}

fn boolean(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(DiagError::malformed(
            "slow query field",
            format!("{key}: {value:?}"),
        )),
    }
}

impl SlowQueryRecord {
    /// Parse one assembled record. Unknown keys are ignored.
    pub fn parse(content: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(content);
        let mut lines = text.lines();
        let head = lines.next().unwrap_or_default();
        let Some(raw_time) = head.strip_prefix(TIME_PREFIX) else {
            return Err(DiagError::malformed(
                "slow query record",
                format!("expected `{TIME_PREFIX}` head, got {head:?}"),
            ));
        };
        let time = timefmt::parse_slow_query_time(raw_time.trim().as_bytes()).ok_or_else(|| {
            DiagError::malformed("slow query time", raw_time.trim().to_string())
        })?;

        let mut record = Self {
            time: Some(time.with_timezone(&timefmt::chongqing())),
            ..Self::default()
        };
        let mut sql: Vec<&str> = Vec::new();
        for line in lines {
            if let Some(fields) = line.strip_prefix('#') {
                if sql.is_empty() {
                    for (key, value) in split_fields(fields) {
                        record.set(key, &value)?;
                    }
                }
                continue;
            }
            if !line.is_empty() {
                sql.push(line);
            }
        }
        record.sql = sql.join("\n");
        Ok(record)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "Txn_start_ts" => self.txn_start_ts = number(key, value)?,
            "User" => {
                let (user, host) = value.split_once('@').unwrap_or((value, ""));
                self.user = user.to_string();
                self.host = host.to_string();
            }
            "Conn_ID" => self.conn_id = number(key, value)?,
            "Query_time" => self.query_time = number(key, value)?,
            "Process_time" => self.process_time = number(key, value)?,
            "Wait_time" => self.wait_time = number(key, value)?,
            "Backoff_time" => self.backoff_time = number(key, value)?,
            "Request_count" => self.request_count = number(key, value)?,
            "Total_keys" => self.total_keys = number(key, value)?,
            "Process_keys" => self.process_keys = number(key, value)?,
            "DB" => self.db = value.to_string(),
            "Index_ids" => self.index_ids = value.to_string(),
            "Is_internal" => self.is_internal = boolean(key, value)?,
            "Digest" => self.digest = value.to_string(),
            "Stats" => self.stats = value.to_string(),
            "Cop_proc_avg" => self.cop_proc_avg = number(key, value)?,
            "Cop_proc_p90" => self.cop_proc_p90 = number(key, value)?,
            "Cop_proc_max" => self.cop_proc_max = number(key, value)?,
            "Cop_proc_addr" => self.cop_proc_addr = value.to_string(),
            "Cop_wait_avg" => self.cop_wait_avg = number(key, value)?,
            "Cop_wait_p90" => self.cop_wait_p90 = number(key, value)?,
            "Cop_wait_max" => self.cop_wait_max = number(key, value)?,
            "Cop_wait_addr" => self.cop_wait_addr = value.to_string(),
            "Mem_max" => self.mem_max = number(key, value)?,
            "Succ" => self.succ = boolean(key, value)?,
            _ => {}
        }
        Ok(())
    }
}

/// `Key1: a b Key2: c` → `[("Key1", "a b"), ("Key2", "c")]`.
fn split_fields(line: &str) -> Vec<(&str, String)> {
    let mut out: Vec<(&str, String)> = Vec::new();
    for token in line.split(' ').filter(|t| !t.is_empty()) {
        if let Some(key) = token.strip_suffix(':')
            && !key.is_empty()
        {
            out.push((key, String::new()));
            continue;
        }
        if let Some((_, value)) = out.last_mut() {
            if !value.is_empty() {
                value.push(' ');
            }
            value.push_str(token);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    #[test]
    fn parses_canonical_record() {
        let content = b"# Time: 2019-08-22T10:46:31.818+08:00\n# Txn_start_ts: 410\n# Query_time: 0.5\nSELECT 1;";
        let rec = SlowQueryRecord::parse(content).unwrap();
        assert_eq!(
            rec.time,
            Some(DateTime::parse_from_rfc3339("2019-08-22T10:46:31.818+08:00").unwrap())
        );
        assert_eq!(rec.txn_start_ts, 410);
        assert!((rec.query_time - 0.5).abs() < f64::EPSILON);
        assert_eq!(rec.sql, "SELECT 1;");
    }

    #[test]
    fn multi_field_lines_and_user_host() {
        let content = b"# Time: 2019-08-22T10:46:31.818123+08:00\n\
# User: root@127.0.0.1\n\
# Conn_ID: 7\n\
# Process_time: 0.1 Wait_time: 0.2 Request_count: 3 Total_keys: 100\n\
# Is_internal: false\n\
# Digest: abc123\n\
# Stats: t:pseudo idx:1\n\
# Succ: true\n\
select * from t where a = 1;";
        let rec = SlowQueryRecord::parse(content).unwrap();
        assert_eq!(rec.user, "root");
        assert_eq!(rec.host, "127.0.0.1");
        assert_eq!(rec.conn_id, 7);
        assert_eq!(rec.request_count, 3);
        assert_eq!(rec.total_keys, 100);
        assert!((rec.wait_time - 0.2).abs() < f64::EPSILON);
        assert!(!rec.is_internal);
        assert!(rec.succ);
        assert_eq!(rec.digest, "abc123");
        assert_eq!(rec.stats, "t:pseudo idx:1");
    }

    #[test]
    fn old_time_layout_is_accepted() {
        let rec = SlowQueryRecord::parse(b"# Time: 2019-08-22-10:46:31.818 +0800\nselect 1;").unwrap();
        assert!(rec.time.is_some());
    }

    #[test]
    fn bad_numeric_value_is_malformed() {
        let err = SlowQueryRecord::parse(b"# Time: 2019-08-22T10:46:31+08:00\n# Query_time: fast\nselect 1;")
            .unwrap_err();
        assert_eq!(err.code(), "DIAG-2001");
    }

    #[test]
    fn record_without_head_is_malformed() {
        assert!(SlowQueryRecord::parse(b"select 1;").is_err());
    }

    #[test]
    fn field_splitter_joins_value_tokens() {
        assert_eq!(
            split_fields(" Plan_digest: x  y Succ: true"),
            vec![("Plan_digest", "x y".to_string()), ("Succ", "true".to_string())]
        );
    }
}
