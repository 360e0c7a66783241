//! Session registry indexed by internal id and by device serial number.
//!
//! A single read/write lock guards both indices; every mutation takes the
//! exclusive hold so the two maps can never disagree.

use super::Session;
use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Point-in-time view of one session, for the heartbeat loop and HTTP layer.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub sn: String,
    pub appid: String,
    pub remote_addr: String,
    pub login_at: DateTime<Local>,
    /// Unix seconds.
    pub last_ping: i64,
    pub meta: HashMap<String, String>,
}

#[derive(Default)]
struct Indices {
    by_id: HashMap<String, Arc<Session>>,
    sn_to_id: HashMap<String, String>,
}

/// Tracks live sessions. At most one session per SN exists at any instant:
/// a device reconnecting after a transient failure must be able to take over
/// its SN slot, so `add` evicts the prior holder instead of refusing.
#[derive(Default)]
pub struct SessionManager {
    inner: RwLock<Indices>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session. If it carries an SN already held by another session,
    /// the prior holder is closed and dropped from both indices first.
    pub fn add(&self, session: Arc<Session>) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(sn) = session.sn() {
            if let Some(old_id) = inner.sn_to_id.get(sn).cloned() {
                if let Some(old) = inner.by_id.remove(&old_id) {
                    warn!(sn = %sn, old_session = %old_id, new_session = %session.id, "evicting duplicate SN session");
                    old.close();
                }
            }
            inner.sn_to_id.insert(sn.to_string(), session.id.clone());
        }

        inner.by_id.insert(session.id.clone(), session);
    }

    /// Close and drop a session. Safe if the id is unknown.
    pub fn remove(&self, session_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(session) = inner.by_id.remove(session_id) {
            session.close();
            if let Some(sn) = session.sn() {
                // Only unlink the SN slot if it still points at us; a newer
                // session may have taken it over.
                if inner.sn_to_id.get(sn).map(String::as_str) == Some(session_id) {
                    inner.sn_to_id.remove(sn);
                }
            }
            debug!(session_id = %session_id, "session removed");
        }
    }

    /// Lookup by internal id. Does not filter closed sessions; the server's
    /// own read loop relies on that during teardown.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.by_id.get(session_id).cloned()
    }

    /// Lookup by serial number. Never returns a closed session.
    pub fn get_by_sn(&self, sn: &str) -> Option<Arc<Session>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let id = inner.sn_to_id.get(sn)?;
        inner
            .by_id
            .get(id)
            .filter(|session| !session.is_closed())
            .cloned()
    }

    /// Snapshot of the serial numbers currently online.
    pub fn online_devices(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.sn_to_id.keys().cloned().collect()
    }

    /// Snapshot of every known session.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .by_id
            .values()
            .map(|s| {
                let identity = s.identity();
                SessionInfo {
                    id: s.id.clone(),
                    sn: identity.map(|i| i.sn.clone()).unwrap_or_default(),
                    appid: identity.map(|i| i.appid.clone()).unwrap_or_default(),
                    remote_addr: s.remote_addr.to_string(),
                    login_at: s.login_at,
                    last_ping: s.last_ping(),
                    meta: identity.map(|i| i.meta.clone()).unwrap_or_default(),
                }
            })
            .collect()
    }

    /// Close and drop every session whose last liveness refresh is older than
    /// `timeout`. Returns how many were dropped.
    pub fn cleanup_expired(&self, timeout: Duration) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        let expired: Vec<String> = inner
            .by_id
            .values()
            .filter(|s| s.is_expired(timeout))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = inner.by_id.remove(id) {
                info!(session_id = %id, sn = %session.sn().unwrap_or(""), "session expired");
                session.close();
                if let Some(sn) = session.sn() {
                    if inner.sn_to_id.get(sn).map(String::as_str) == Some(id.as_str()) {
                        inner.sn_to_id.remove(sn);
                    }
                }
            }
        }

        expired.len()
    }

    /// Close every session and clear both indices.
    pub fn shutdown(&self) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for session in inner.by_id.values() {
            session.close();
        }
        inner.by_id.clear();
        inner.sn_to_id.clear();
    }

    pub fn count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::Identity;
    use super::*;
    use std::collections::HashMap;
    use tokio::net::{TcpListener, TcpStream};

    struct TestConn {
        session: Arc<Session>,
        _read_half: tokio::net::tcp::OwnedReadHalf,
        _peer: TcpStream,
    }

    async fn authed_session(manager: &SessionManager, sn: &str) -> TestConn {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        let (session, read_half) = Session::new(stream, remote);
        session
            .set_identity(Identity {
                sn: sn.to_string(),
                appid: "A1".to_string(),
                meta: HashMap::new(),
            })
            .unwrap();
        manager.add(Arc::clone(&session));
        TestConn {
            session,
            _read_half: read_half,
            _peer: peer,
        }
    }

    #[tokio::test]
    async fn duplicate_sn_evicts_prior_session() {
        let manager = SessionManager::new();
        let a = authed_session(&manager, "SN1").await;
        let b = authed_session(&manager, "SN1").await;

        assert!(a.session.is_closed());
        assert!(!b.session.is_closed());

        let found = manager.get_by_sn("SN1").expect("SN1 should be online");
        assert_eq!(found.id, b.session.id);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn get_by_sn_filters_closed_sessions() {
        let manager = SessionManager::new();
        let a = authed_session(&manager, "SN2").await;

        a.session.close();
        assert!(manager.get_by_sn("SN2").is_none());
        // get(id) deliberately does not filter.
        assert!(manager.get(&a.session.id).is_some());
    }

    #[tokio::test]
    async fn remove_clears_both_indices() {
        let manager = SessionManager::new();
        let a = authed_session(&manager, "SN3").await;

        manager.remove(&a.session.id);
        assert!(a.session.is_closed());
        assert!(manager.get(&a.session.id).is_none());
        assert!(manager.get_by_sn("SN3").is_none());
        assert!(manager.online_devices().is_empty());

        // Safe if absent.
        manager.remove(&a.session.id);
    }

    #[tokio::test]
    async fn remove_of_evicted_session_keeps_successor_routable() {
        let manager = SessionManager::new();
        let a = authed_session(&manager, "SN4").await;
        let b = authed_session(&manager, "SN4").await;

        // The reader task of the evicted session cleans up after itself.
        manager.remove(&a.session.id);

        let found = manager.get_by_sn("SN4").expect("successor must stay routable");
        assert_eq!(found.id, b.session.id);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_sessions() {
        let manager = SessionManager::new();
        let _fresh = authed_session(&manager, "SN-FRESH").await;
        let stale = authed_session(&manager, "SN-STALE").await;

        // Forge staleness by rolling last_ping far into the past.
        stale
            .session
            .last_ping
            .store(dgw_core::unix_now() - 3600, std::sync::atomic::Ordering::Relaxed);

        let removed = manager.cleanup_expired(Duration::from_secs(90));
        assert_eq!(removed, 1);
        assert!(manager.get_by_sn("SN-STALE").is_none());
        assert!(manager.get_by_sn("SN-FRESH").is_some());
    }

    #[tokio::test]
    async fn shutdown_closes_everything() {
        let manager = SessionManager::new();
        let a = authed_session(&manager, "SN5").await;
        let b = authed_session(&manager, "SN6").await;

        manager.shutdown();
        assert!(a.session.is_closed());
        assert!(b.session.is_closed());
        assert_eq!(manager.count(), 0);
        assert!(manager.online_devices().is_empty());
    }
}
