//! In-memory registry of connected and recently disconnected sessions.
//!
//! Keyed by session ID, safe under concurrent access, with an optional
//! retention window for disconnected entries. With a finite window a
//! background reaper deletes entries once they have been disconnected longer
//! than the window; with no policy, termination deletes immediately; with
//! `forever`, disconnected entries are kept until the process exits.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::session::Session;

/// Longest pause between reaper scans, regardless of the window size.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Error returned for an unparseable retention policy string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid retention policy {0:?}: expected \"none\", \"forever\" or a duration like 30s/5m/1h/7d")]
pub struct RetentionParseError(pub String);

/// What happens to a session entry when its agent disconnects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Retention {
    /// Delete the entry as soon as the session terminates.
    #[default]
    None,
    /// Keep the entry for the given window after disconnect.
    Keep(Duration),
    /// Keep disconnected entries until the process exits.
    Forever,
}

impl FromStr for Retention {
    type Err = RetentionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("none") {
            return Ok(Retention::None);
        }
        if s.eq_ignore_ascii_case("forever") {
            return Ok(Retention::Forever);
        }
        parse_duration_literal(s)
            .map(Retention::Keep)
            .ok_or_else(|| RetentionParseError(s.to_string()))
    }
}

impl TryFrom<String> for Retention {
    type Error = RetentionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Retention> for String {
    fn from(r: Retention) -> Self {
        r.to_string()
    }
}

impl fmt::Display for Retention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Retention::None => f.write_str("none"),
            Retention::Forever => f.write_str("forever"),
            Retention::Keep(window) => {
                let secs = window.as_secs();
                if secs > 0 && secs % 86_400 == 0 {
                    write!(f, "{}d", secs / 86_400)
                } else if secs > 0 && secs % 3_600 == 0 {
                    write!(f, "{}h", secs / 3_600)
                } else if secs > 0 && secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{}s", secs)
                }
            }
        }
    }
}

fn parse_duration_literal(s: &str) -> Option<Duration> {
    let unit_start = s.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = s.split_at(unit_start);
    let n: u64 = number.parse().ok()?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3_600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

/// Concurrency-safe session registry.
pub struct SessionRepository {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    retention: Retention,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionRepository {
    /// Create a repository with the given retention policy.
    ///
    /// A finite window spawns the reaper task; it stops on its own once the
    /// repository is dropped. Must be called from within a tokio runtime
    /// when the policy is `Keep`.
    pub fn new(retention: Retention) -> Arc<Self> {
        let repo = Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            retention,
            reaper: Mutex::new(None),
        });

        if let Retention::Keep(window) = retention {
            let handle = tokio::spawn(reap_loop(Arc::downgrade(&repo), window));
            *repo.reaper.lock().unwrap() = Some(handle);
        }
        repo
    }

    /// The configured retention policy.
    pub fn retention(&self) -> Retention {
        self.retention
    }

    /// Insert or replace the entry under the session's ID.
    pub fn save(&self, session: Arc<Session>) {
        let id = session.id.clone();
        let replaced = self.sessions.write().unwrap().insert(id.clone(), session);
        if replaced.is_some() {
            debug!(session_id = %id, "Replaced existing session entry");
        }
    }

    /// Remove the entry for this session. No-op when absent.
    pub fn delete(&self, session: &Session) {
        self.sessions.write().unwrap().remove(&session.id);
    }

    /// Any session, connected or disconnected.
    pub fn get_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(id).cloned()
    }

    /// Only a connected session.
    pub fn get_active_by_id(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap()
            .get(id)
            .filter(|s| s.disconnected_at().is_none())
            .cloned()
    }

    /// Snapshot of every entry; safe to iterate without the lock. Order is
    /// unspecified.
    pub fn get_all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    /// Number of entries, disconnected ones included.
    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Delete every disconnected entry older than the retention window.
    fn reap_obsolete(&self, window: Duration) {
        let obsolete: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|s| s.obsolete(window))
                .cloned()
                .collect()
        };
        for session in obsolete {
            info!(session_id = %session.id, "Removing obsolete disconnected session");
            self.delete(&session);
        }
    }
}

impl Drop for SessionRepository {
    fn drop(&mut self) {
        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Periodic scan for obsolete entries. Holds only a weak handle so the
/// repository's drop ends the loop.
async fn reap_loop(repo: Weak<SessionRepository>, window: Duration) {
    let poll = (window / 2).clamp(Duration::from_millis(10), MAX_REAP_INTERVAL);
    let mut ticker = tokio::time::interval(poll);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(repo) = repo.upgrade() else {
            break;
        };
        repo.reap_obsolete(window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use culvert_proto::ConnectionRequest;
    use culvert_transport::memory::MemoryTransport;
    use culvert_transport::AgentTransport;
    use tokio_util::sync::CancellationToken;

    fn make_session(id: &str) -> Arc<Session> {
        let (memory, _rx) = MemoryTransport::new("192.0.2.5:42000".parse().unwrap());
        Session::new(
            id,
            ConnectionRequest::default(),
            memory as Arc<dyn AgentTransport>,
            "auth",
            CancellationToken::new(),
        )
    }

    #[test]
    fn retention_parsing() {
        assert_eq!("".parse::<Retention>().unwrap(), Retention::None);
        assert_eq!("none".parse::<Retention>().unwrap(), Retention::None);
        assert_eq!("forever".parse::<Retention>().unwrap(), Retention::Forever);
        assert_eq!(
            "90s".parse::<Retention>().unwrap(),
            Retention::Keep(Duration::from_secs(90))
        );
        assert_eq!(
            "30m".parse::<Retention>().unwrap(),
            Retention::Keep(Duration::from_secs(1_800))
        );
        assert_eq!(
            "1h".parse::<Retention>().unwrap(),
            Retention::Keep(Duration::from_secs(3_600))
        );
        assert_eq!(
            "7d".parse::<Retention>().unwrap(),
            Retention::Keep(Duration::from_secs(604_800))
        );

        assert!("5x".parse::<Retention>().is_err());
        assert!("h".parse::<Retention>().is_err());
        assert!("1.5h".parse::<Retention>().is_err());
    }

    #[test]
    fn retention_display_roundtrips() {
        for s in ["none", "forever", "45s", "30m", "12h", "7d"] {
            let r: Retention = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
            assert_eq!(r.to_string().parse::<Retention>().unwrap(), r);
        }
    }

    #[tokio::test]
    async fn save_get_delete() {
        let repo = SessionRepository::new(Retention::None);
        let session = make_session("a");

        repo.save(Arc::clone(&session));
        assert_eq!(repo.count(), 1);
        assert!(repo.get_by_id("a").is_some());
        assert!(repo.get_by_id("b").is_none());
        assert_eq!(repo.get_all().len(), 1);

        repo.delete(&session);
        assert_eq!(repo.count(), 0);
        // Idempotent.
        repo.delete(&session);
        assert_eq!(repo.count(), 0);
    }

    #[tokio::test]
    async fn save_with_same_id_replaces() {
        let repo = SessionRepository::new(Retention::None);
        let first = make_session("x");
        let second = make_session("x");

        repo.save(Arc::clone(&first));
        repo.save(Arc::clone(&second));

        assert_eq!(repo.count(), 1);
        assert!(Arc::ptr_eq(&repo.get_by_id("x").unwrap(), &second));
    }

    #[tokio::test]
    async fn active_lookup_filters_disconnected() {
        let repo = SessionRepository::new(Retention::Forever);
        let session = make_session("a");
        repo.save(Arc::clone(&session));

        assert!(repo.get_active_by_id("a").is_some());
        session.set_disconnected(Utc::now());
        assert!(repo.get_active_by_id("a").is_none());
        // Still visible to the unfiltered lookup.
        assert!(repo.get_by_id("a").is_some());
    }

    #[tokio::test]
    async fn reaper_removes_obsolete_entries() {
        let repo = SessionRepository::new(Retention::Keep(Duration::from_millis(100)));
        let session = make_session("a");
        repo.save(Arc::clone(&session));
        session.set_disconnected(Utc::now());

        assert!(repo.get_by_id("a").is_some());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while repo.get_by_id("a").is_some() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "reaper never removed the obsolete session"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn reaper_keeps_connected_and_fresh_entries() {
        let repo = SessionRepository::new(Retention::Keep(Duration::from_secs(3_600)));
        let connected = make_session("connected");
        let fresh = make_session("fresh");
        repo.save(Arc::clone(&connected));
        repo.save(Arc::clone(&fresh));
        fresh.set_disconnected(Utc::now());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(repo.count(), 2);
    }
}
