//! Core TCP server: accepts device connections and dispatches framed
//! messages to type-specific handlers.
//!
//! Owns the session manager, authenticator + nonce store, and ACK waiter.
//! Runs one reader task per connection plus a heartbeat tick and an expiry
//! sweep tick; everything observes a broadcast shutdown signal.

use crate::ack::AckWaiter;
use crate::session::{Identity, Session, SessionManager};
use dgw_core::messages::{
    AckPayload, AuthOkPayload, AuthPayload, ErrorPayload, Message, MsgType, PingPayload,
    PongPayload,
};
use dgw_core::{
    read_message, unix_now, Authenticator, GatewayError, GatewayResult, MemoryNonceStore,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Numeric code carried in Err frames for handler failures.
const ERR_CODE_INTERNAL: i32 = 500;

/// Period of the expiry sweep (sessions and nonces).
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Parameters for a [`GatewayServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address.
    pub addr: String,
    /// Server-initiated ping period.
    pub heartbeat_interval: Duration,
    /// Peer-inactivity bound; also the per-read deadline. Must be at least
    /// twice the heartbeat interval so one missed ping does not evict.
    pub session_timeout: Duration,
    /// appid → shared secret.
    pub keys: HashMap<String, String>,
    /// Auth clock window in seconds.
    pub time_window_secs: i64,
}

/// An async handler for one message type.
pub type MessageHandler =
    Arc<dyn Fn(Arc<Session>, Message) -> BoxFuture<'static, GatewayResult<()>> + Send + Sync>;

pub struct GatewayServer {
    addr: String,
    heartbeat_interval: Duration,
    session_timeout: Duration,
    sessions: Arc<SessionManager>,
    authenticator: Arc<Authenticator>,
    nonce_store: Arc<MemoryNonceStore>,
    ack_waiter: Arc<AckWaiter>,
    handlers: RwLock<HashMap<MsgType, MessageHandler>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl GatewayServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let nonce_store = Arc::new(MemoryNonceStore::new());
        let authenticator = Arc::new(Authenticator::new(
            config.keys,
            config.time_window_secs,
            nonce_store.clone() as Arc<dyn dgw_core::NonceStore>,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        let server = Arc::new(Self {
            addr: config.addr,
            heartbeat_interval: config.heartbeat_interval,
            session_timeout: config.session_timeout,
            sessions: Arc::new(SessionManager::new()),
            authenticator,
            nonce_store,
            ack_waiter: Arc::new(AckWaiter::new()),
            handlers: RwLock::new(HashMap::new()),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        server.register_default_handlers();
        server
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn ack_waiter(&self) -> Arc<AckWaiter> {
        Arc::clone(&self.ack_waiter)
    }

    /// Register a handler for a message type. Replaces any existing one;
    /// callers may use this for Report or to override the built-ins.
    pub fn register_handler(&self, msg_type: MsgType, handler: MessageHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg_type, handler);
    }

    fn register_default_handlers(self: &Arc<Self>) {
        let authenticator = Arc::clone(&self.authenticator);
        let sessions = Arc::clone(&self.sessions);
        self.register_handler(
            MsgType::Auth,
            Arc::new(move |session, msg| {
                let authenticator = Arc::clone(&authenticator);
                let sessions = Arc::clone(&sessions);
                async move { handle_auth(authenticator, sessions, session, msg).await }.boxed()
            }),
        );

        self.register_handler(
            MsgType::Ping,
            Arc::new(|session, msg| async move { handle_ping(session, msg).await }.boxed()),
        );

        self.register_handler(
            MsgType::Pong,
            Arc::new(|session, _msg| {
                async move {
                    session.touch_ping();
                    Ok(())
                }
                .boxed()
            }),
        );

        let ack_waiter = Arc::clone(&self.ack_waiter);
        self.register_handler(
            MsgType::Ack,
            Arc::new(move |_session, msg| {
                let ack_waiter = Arc::clone(&ack_waiter);
                async move {
                    let ack: AckPayload = msg.decode_payload()?;
                    let cmd_id = ack.cmd_id.clone();
                    ack_waiter.notify(&cmd_id, ack);
                    Ok(())
                }
                .boxed()
            }),
        );
    }

    /// Bind the listener and spawn the accept, heartbeat, and cleanup loops.
    /// Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> GatewayResult<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "TCP server listening");

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.push(tokio::spawn(Arc::clone(self).accept_loop(listener)));
        tasks.push(tokio::spawn(Arc::clone(self).heartbeat_loop()));
        tasks.push(tokio::spawn(Arc::clone(self).cleanup_loop()));

        Ok(local_addr)
    }

    /// Signal shutdown, close every session, and join the background loops.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.sessions.shutdown();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("TCP server stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        tokio::spawn(Arc::clone(&self).handle_connection(stream, remote_addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote_addr: SocketAddr) {
        let (session, mut read_half) = Session::new(stream, remote_addr);
        info!(remote = %remote_addr, session_id = %session.id, "connection accepted");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = session.closed_signal() => break,
                result = tokio::time::timeout(self.session_timeout, read_message(&mut read_half)) => {
                    let msg = match result {
                        Err(_) => {
                            debug!(session_id = %session.id, "read deadline exceeded");
                            break;
                        }
                        Ok(Err(GatewayError::UnknownType(t))) => {
                            // Frame consumed, stream still aligned: reply and keep reading.
                            self.send_error(&session, ERR_CODE_INTERNAL, &format!("unknown message type: {t}"))
                                .await;
                            continue;
                        }
                        Ok(Err(e)) => {
                            debug!(session_id = %session.id, error = %e, "read error");
                            break;
                        }
                        Ok(Ok(msg)) => msg,
                    };

                    if let Err(e) = self.dispatch(Arc::clone(&session), msg).await {
                        match e {
                            GatewayError::AuthFailed(reason) => {
                                warn!(session_id = %session.id, remote = %remote_addr, reason = %reason, "auth failed");
                                break;
                            }
                            e => {
                                warn!(session_id = %session.id, error = %e, "handler error");
                                self.send_error(&session, ERR_CODE_INTERNAL, &e.to_string()).await;
                            }
                        }
                    }
                }
            }
        }

        session.close();
        self.sessions.remove(&session.id);
        debug!(session_id = %session.id, "connection closed");
    }

    /// Route a message to its handler, isolating panics so a crashing
    /// handler cannot take down the server.
    async fn dispatch(&self, session: Arc<Session>, msg: Message) -> GatewayResult<()> {
        let msg_type = msg.msg_type;
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&msg_type)
            .cloned();

        let Some(handler) = handler else {
            return Err(GatewayError::InvalidMessage(format!(
                "no handler for message type {}",
                u8::from(msg_type)
            )));
        };

        match AssertUnwindSafe(handler(session, msg)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Other(format!(
                "handler for message type {} panicked",
                u8::from(msg_type)
            ))),
        }
    }

    async fn send_error(&self, session: &Arc<Session>, code: i32, message: &str) {
        let payload = ErrorPayload {
            code,
            message: message.to_string(),
        };
        let msg = match Message::new(MsgType::Err, &payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "failed to encode error frame");
                return;
            }
        };
        if let Err(e) = session.send_message(&msg).await {
            debug!(session_id = %session.id, error = %e, "failed to send error frame");
        }
    }

    /// Server-initiated pings keep half-open connections from lingering: the
    /// session timeout is driven by peer inactivity, so a peer that cannot
    /// receive our pings fails the send and is evicted immediately.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    for info in self.sessions.snapshot() {
                        if info.sn.is_empty() {
                            continue;
                        }
                        let Some(session) = self.sessions.get(&info.id) else {
                            continue;
                        };
                        if let Err(e) = session.send_ping().await {
                            warn!(sn = %info.sn, error = %e, "heartbeat ping failed");
                            self.sessions.remove(&info.id);
                        }
                    }
                }
            }
        }
        debug!("heartbeat loop stopped");
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    let expired = self.sessions.cleanup_expired(self.session_timeout);
                    if expired > 0 {
                        info!(count = expired, "cleaned up expired sessions");
                    }
                    let swept = self.nonce_store.sweep_expired();
                    if swept > 0 {
                        debug!(count = swept, "evicted expired nonces");
                    }
                }
            }
        }
        debug!("cleanup loop stopped");
    }
}

async fn handle_auth(
    authenticator: Arc<Authenticator>,
    sessions: Arc<SessionManager>,
    session: Arc<Session>,
    msg: Message,
) -> GatewayResult<()> {
    let auth: AuthPayload = match msg.decode_payload() {
        Ok(auth) => auth,
        Err(e) => {
            let reason = format!("invalid auth payload: {e}");
            send_auth_result(&session, false, &reason).await;
            return Err(GatewayError::AuthFailed(reason));
        }
    };

    if let Err(e) = authenticator.verify(&auth.appid, &auth.sn, auth.ts, &auth.nonce, &auth.sign) {
        let reason = match &e {
            GatewayError::AuthFailed(reason) => reason.clone(),
            other => other.to_string(),
        };
        send_auth_result(&session, false, &reason).await;
        return Err(GatewayError::AuthFailed(reason));
    }

    session.set_identity(Identity {
        sn: auth.sn.clone(),
        appid: auth.appid.clone(),
        meta: auth.meta,
    })?;
    sessions.add(Arc::clone(&session));
    send_auth_result(&session, true, "authenticated").await;

    info!(sn = %auth.sn, appid = %auth.appid, session_id = %session.id, "device authenticated");
    Ok(())
}

async fn handle_ping(session: Arc<Session>, msg: Message) -> GatewayResult<()> {
    let _ping: PingPayload = msg.decode_payload()?;
    session.touch_ping();

    let pong = PongPayload {
        timestamp: unix_now(),
    };
    session.send_message(&Message::new(MsgType::Pong, &pong)?).await
}

async fn send_auth_result(session: &Arc<Session>, success: bool, message: &str) {
    let payload = AuthOkPayload {
        success,
        message: message.to_string(),
    };
    let msg = match Message::new(MsgType::AuthOk, &payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "failed to encode auth result");
            return;
        }
    };
    if let Err(e) = session.send_message(&msg).await {
        warn!(session_id = %session.id, error = %e, "failed to send auth result");
    }
}
