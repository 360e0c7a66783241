//! A single device connection and its metadata.
//!
//! Writes are serialised through a per-session lock; reads happen on exactly
//! one task (the server's per-connection reader). Close is idempotent and
//! wakes the reader so eviction does not wait out the read deadline.

pub mod manager;

pub use manager::{SessionInfo, SessionManager};

use chrono::{DateTime, Local};
use dgw_core::messages::{CommandPayload, Message, MsgType, PingPayload};
use dgw_core::{unix_now, write_message, GatewayError, GatewayResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Identity assigned to a session by a successful handshake.
#[derive(Debug, Clone)]
pub struct Identity {
    pub sn: String,
    pub appid: String,
    pub meta: HashMap<String, String>,
}

/// An accepted connection. Anonymous until authenticated.
pub struct Session {
    /// Server-generated opaque id.
    pub id: String,
    pub remote_addr: SocketAddr,
    pub login_at: DateTime<Local>,
    /// Unix seconds of the last inbound Ping/Pong.
    last_ping: AtomicI64,
    /// Set exactly once, on successful authentication.
    identity: OnceLock<Identity>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Session {
    /// Split the stream; the read half goes to the caller's reader task.
    pub fn new(stream: TcpStream, remote_addr: SocketAddr) -> (Arc<Self>, OwnedReadHalf) {
        let (read_half, write_half) = stream.into_split();
        let session = Arc::new(Self {
            id: generate_session_id(),
            remote_addr,
            login_at: Local::now(),
            last_ping: AtomicI64::new(unix_now()),
            identity: OnceLock::new(),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });
        (session, read_half)
    }

    /// The authenticated identity, if the handshake has completed.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.get()
    }

    /// The device serial number, once authenticated.
    pub fn sn(&self) -> Option<&str> {
        self.identity.get().map(|i| i.sn.as_str())
    }

    /// Record the handshake result. Returns an error if already set.
    pub fn set_identity(&self, identity: Identity) -> GatewayResult<()> {
        self.identity
            .set(identity)
            .map_err(|_| GatewayError::InvalidMessage("session already authenticated".into()))
    }

    /// Send one framed message under the write lock.
    pub async fn send_message(&self, msg: &Message) -> GatewayResult<()> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        let mut writer = self.writer.lock().await;
        // Re-check under the lock: close may have won the race.
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        write_message(&mut *writer, msg).await
    }

    pub async fn send_command(&self, cmd: &CommandPayload) -> GatewayResult<()> {
        self.send_message(&Message::new(MsgType::Cmd, cmd)?).await
    }

    pub async fn send_ping(&self) -> GatewayResult<()> {
        let ping = PingPayload {
            timestamp: unix_now(),
        };
        self.send_message(&Message::new(MsgType::Ping, &ping)?).await
    }

    /// Refresh liveness after an inbound Ping or Pong.
    pub fn touch_ping(&self) {
        self.last_ping.store(unix_now(), Ordering::Relaxed);
    }

    /// Unix seconds of the last liveness refresh.
    pub fn last_ping(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        unix_now() - self.last_ping() > timeout.as_secs() as i64
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the session has been closed. Used by the reader task so
    /// eviction unblocks it immediately.
    pub async fn closed_signal(&self) {
        if self.is_closed() {
            return;
        }
        self.close_notify.notified().await;
    }

    /// Close the session: mark it, wake the reader, and shut the socket down.
    /// Idempotent.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.close_notify.notify_one();

        let session = Arc::clone(self);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(session_id = %session.id, error = %e, "socket shutdown");
            }
        });
    }
}

/// Generate a random session id (hex-encoded, 16 bytes = 32 hex chars).
fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dgw_core::messages::PongPayload;
    use dgw_core::read_message;
    use tokio::net::TcpListener;

    async fn session_pair() -> (Arc<Session>, OwnedReadHalf, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = TcpStream::connect(addr).await.unwrap();
        let (stream, remote) = listener.accept().await.unwrap();
        let (session, read_half) = Session::new(stream, remote);
        (session, read_half, peer)
    }

    #[tokio::test]
    async fn writes_reach_the_peer() {
        let (session, _read_half, mut peer) = session_pair().await;

        let msg = Message::new(MsgType::Pong, &PongPayload { timestamp: 7 }).unwrap();
        session.send_message(&msg).await.unwrap();

        let received = read_message(&mut peer).await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_writes() {
        let (session, _read_half, _peer) = session_pair().await;

        session.close();
        session.close();
        assert!(session.is_closed());

        let msg = Message::new(MsgType::Pong, &PongPayload { timestamp: 0 }).unwrap();
        let err = session.send_message(&msg).await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionClosed));
    }

    #[tokio::test]
    async fn close_unblocks_waiters() {
        let (session, _read_half, _peer) = session_pair().await;

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed_signal().await })
        };
        session.close();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed_signal should resolve after close")
            .unwrap();
    }

    #[tokio::test]
    async fn identity_is_set_once() {
        let (session, _read_half, _peer) = session_pair().await;
        assert!(session.sn().is_none());

        session
            .set_identity(Identity {
                sn: "SN1".into(),
                appid: "A1".into(),
                meta: HashMap::new(),
            })
            .unwrap();
        assert_eq!(session.sn(), Some("SN1"));

        let again = session.set_identity(Identity {
            sn: "SN2".into(),
            appid: "A1".into(),
            meta: HashMap::new(),
        });
        assert!(again.is_err());
        assert_eq!(session.sn(), Some("SN1"));
    }

    #[tokio::test]
    async fn expiry_tracks_last_ping() {
        let (session, _read_half, _peer) = session_pair().await;
        assert!(!session.is_expired(Duration::from_secs(60)));

        session.last_ping.store(unix_now() - 120, Ordering::Relaxed);
        assert!(session.is_expired(Duration::from_secs(60)));

        session.touch_ping();
        assert!(!session.is_expired(Duration::from_secs(60)));
    }
}
