//! Paginated, filtered search over a collected log tree.
//!
//! A search opens a [`MergeSequence`] over every file under a directory and
//! keeps it alive in a session keyed by an opaque token, so later pages
//! resume where the previous page stopped. Sessions idle for longer than the
//! deadline are removed and their files closed by a per-session reaper.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use memchr::memmem;
use parking_lot::Mutex;
use rand::random;

use crate::core::errors::{DiagError, Result};
use crate::logs::descriptor::resolve_dir;
use crate::logs::item::{Level, LogItem, Timestamp};
use crate::logs::iterator::LogStream;
use crate::logs::merge::MergeSequence;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct SessionState {
    sequence: Option<MergeSequence>,
    last_access: Instant,
}

/// One resumable search.
pub struct SearchSession {
    token: String,
    substring: Vec<u8>,
    level: Level,
    state: Mutex<SessionState>,
}

impl SearchSession {
    fn new(token: String, sequence: MergeSequence, substring: &str, level: Level) -> Self {
        Self {
            token,
            substring: substring.as_bytes().to_vec(),
            level,
            state: Mutex::new(SessionState {
                sequence: Some(sequence),
                last_access: Instant::now(),
            }),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn matches(&self, item: &LogItem) -> bool {
        (self.level == Level::Invalid || item.level == self.level)
            && memmem::find(&item.content, &self.substring).is_some()
    }

    fn next_locked(&self, state: &mut SessionState) -> Result<Option<LogItem>> {
        let Some(sequence) = state.sequence.as_mut() else {
            return Ok(None);
        };
        while let Some(item) = sequence.next_item()? {
            if self.matches(&item) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    /// Next matching record. A closed session behaves as exhausted.
    pub fn next(&self) -> Result<Option<LogItem>> {
        let mut state = self.state.lock();
        state.last_access = Instant::now();
        self.next_locked(&mut state)
    }

    /// Up to `n` matching records.
    pub fn next_page(&self, n: usize) -> Result<Vec<LogItem>> {
        let mut state = self.state.lock();
        state.last_access = Instant::now();
        let mut page = Vec::with_capacity(n.min(1024));
        while page.len() < n {
            match self.next_locked(&mut state)? {
                Some(item) => page.push(item),
                None => break,
            }
        }
        Ok(page)
    }

    /// Close every file of the session. Closing twice is a no-op.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(mut sequence) = state.sequence.take() {
            sequence.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().sequence.is_none()
    }

    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_access.elapsed()
    }
}

impl std::fmt::Debug for SearchSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchSession")
            .field("token", &self.token)
            .field("level", &self.level)
            .field("substring", &String::from_utf8_lossy(&self.substring))
            .finish_non_exhaustive()
    }
}

/// Registry of live sessions. Cloning shares the registry.
#[derive(Clone)]
pub struct Searcher {
    sessions: Arc<Mutex<HashMap<String, Arc<SearchSession>>>>,
    idle_timeout: Duration,
}

impl Default for Searcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Searcher {
    pub fn new() -> Self {
        Self::with_idle_timeout(DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Start a new search (`token == None`) or resume an existing one.
    pub fn search(
        &self,
        dir: &Path,
        begin: Timestamp,
        end: Timestamp,
        level: Level,
        substring: &str,
        token: Option<&str>,
    ) -> Result<(Arc<SearchSession>, String)> {
        if let Some(token) = token {
            return self.get(token).map(|session| (session, token.to_string()));
        }

        let descriptors = resolve_dir(dir)?;
        let sequence = MergeSequence::open(&descriptors, begin, end);
        let token = self.fresh_token();
        let session = Arc::new(SearchSession::new(
            token.clone(),
            sequence,
            substring,
            level,
        ));
        self.sessions
            .lock()
            .insert(token.clone(), Arc::clone(&session));

        if let Err(err) = self.spawn_reaper(Arc::clone(&session)) {
            self.sessions.lock().remove(&token);
            session.close();
            return Err(err);
        }
        Ok((session, token))
    }

    pub fn get(&self, token: &str) -> Result<Arc<SearchSession>> {
        self.sessions
            .lock()
            .get(token)
            .cloned()
            .ok_or_else(|| DiagError::UnknownToken {
                token: token.to_string(),
            })
    }

    /// Remove and close a session. Returns whether the token was known.
    pub fn close(&self, token: &str) -> bool {
        let removed = self.sessions.lock().remove(token);
        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    fn fresh_token(&self) -> String {
        let sessions = self.sessions.lock();
        loop {
            let token = format!("{:032x}", random::<u128>());
            if !sessions.contains_key(&token) {
                return token;
            }
        }
    }

    fn spawn_reaper(&self, session: Arc<SearchSession>) -> Result<()> {
        let sessions = Arc::clone(&self.sessions);
        let deadline = self.idle_timeout;
        let name = format!("diag-reaper-{}", &session.token[..8]);
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                loop {
                    if session.is_closed() {
                        break;
                    }
                    let idle = session.idle_for();
                    if idle >= deadline {
                        sessions.lock().remove(&session.token);
                        session.close();
                        break;
                    }
                    thread::sleep(deadline - idle);
                }
            })
            .map(drop)
            .map_err(|source| DiagError::Runtime {
                details: format!("failed to spawn session reaper: {source}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::{Duration as TimeDelta, TimeZone, Utc};
    use tempfile::TempDir;

    use super::*;

    fn base() -> Timestamp {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .unwrap()
            .fixed_offset()
    }

    fn line(secs: i64, level: &str, msg: &str) -> String {
        let t = base() + TimeDelta::seconds(secs);
        format!(
            "[{}] [{level}] {msg}\n",
            t.format("%Y/%m/%d %H:%M:%S%.3f %:z")
        )
    }

    fn tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let tidb = tmp.path().join("h1/tidb-4000");
        let tikv = tmp.path().join("h2/tikv-20160");
        fs::create_dir_all(&tidb).unwrap();
        fs::create_dir_all(&tikv).unwrap();
        let mut a = String::new();
        let mut b = String::new();
        for i in 0..10 {
            a.push_str(&line(i * 2 + 1, "INFO", &format!("tidb conn {i}")));
            b.push_str(&line(i * 2 + 2, if i % 2 == 0 { "WARN" } else { "INFO" }, &format!("tikv region {i}")));
        }
        fs::write(tidb.join("tidb.log"), a).unwrap();
        fs::write(tikv.join("tikv.log"), b).unwrap();
        tmp
    }

    fn window() -> (Timestamp, Timestamp) {
        (base(), base() + TimeDelta::hours(1))
    }

    #[test]
    fn pages_resume_through_token() {
        let tmp = tree();
        let searcher = Searcher::new();
        let (begin, end) = window();
        let (session, token) = searcher
            .search(tmp.path(), begin, end, Level::Invalid, "", None)
            .unwrap();
        let first = session.next_page(5).unwrap();
        assert_eq!(first.len(), 5);

        let (resumed, same) = searcher
            .search(tmp.path(), begin, end, Level::Invalid, "", Some(&token))
            .unwrap();
        assert_eq!(same, token);
        let rest = resumed.next_page(100).unwrap();
        assert_eq!(rest.len(), 15);
        let all: Vec<_> = first.iter().chain(rest.iter()).collect();
        for pair in all.windows(2) {
            assert!(pair[0].time <= pair[1].time);
        }
    }

    #[test]
    fn substring_and_level_filters_apply() {
        let tmp = tree();
        let searcher = Searcher::new();
        let (begin, end) = window();
        let (session, _) = searcher
            .search(tmp.path(), begin, end, Level::Warn, "region", None)
            .unwrap();
        let items = session.next_page(100).unwrap();
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.level == Level::Warn && i.component == "tikv"));
    }

    #[test]
    fn unknown_token_is_distinct_error() {
        let searcher = Searcher::new();
        let (begin, end) = window();
        let err = searcher
            .search(Path::new("/nonexistent"), begin, end, Level::Invalid, "", Some("nope"))
            .unwrap_err();
        assert_eq!(err.code(), "DIAG-2101");
    }

    #[test]
    fn close_is_idempotent_and_removes_session() {
        let tmp = tree();
        let searcher = Searcher::new();
        let (begin, end) = window();
        let (session, token) = searcher
            .search(tmp.path(), begin, end, Level::Invalid, "", None)
            .unwrap();
        assert_eq!(searcher.len(), 1);
        assert!(searcher.close(&token));
        assert!(!searcher.close(&token));
        session.close();
        assert!(session.is_closed());
        assert!(session.next().unwrap().is_none());
        assert!(searcher.is_empty());
    }

    #[test]
    fn idle_session_is_reaped() {
        let tmp = tree();
        let searcher = Searcher::with_idle_timeout(Duration::from_millis(200));
        let (begin, end) = window();
        let (session, token) = searcher
            .search(tmp.path(), begin, end, Level::Invalid, "", None)
            .unwrap();
        assert!(session.next().unwrap().is_some());

        thread::sleep(Duration::from_millis(700));
        let err = searcher.get(&token).unwrap_err();
        assert_eq!(err.code(), "DIAG-2101");
        assert!(session.is_closed());
    }

    #[test]
    fn access_postpones_reaping() {
        let tmp = tree();
        let searcher = Searcher::with_idle_timeout(Duration::from_millis(400));
        let (begin, end) = window();
        let (session, token) = searcher
            .search(tmp.path(), begin, end, Level::Invalid, "", None)
            .unwrap();
        for _ in 0..4 {
            thread::sleep(Duration::from_millis(150));
            session.next().unwrap();
        }
        assert!(searcher.get(&token).is_ok());
    }
}
