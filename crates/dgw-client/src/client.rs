//! The device-side gateway client.
//!
//! `DeviceClient` manages the connection lifecycle: dial with backoff, HMAC
//! auth handshake, heartbeat, and command dispatch. Commands run on a
//! blocking task so a slow or panicking handler never stalls the read loop;
//! a panic is answered with an `error` ACK.

use dgw_core::messages::{
    AckPayload, AuthOkPayload, AuthPayload, CommandPayload, ErrorPayload, Message, MsgType,
    PingPayload, PongPayload,
};
use dgw_core::{read_message, unix_now, write_message, Authenticator, GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Dial and auth-response deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Client-initiated ping period. Below the server default heartbeat so the
/// session stays fresh even if server pings are lost.
const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Per-read deadline while connected.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a device connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub appid: String,
    pub sn: String,
    /// Shared secret for the appid.
    pub key: String,
    /// Initial reconnect backoff.
    pub reconnect_min: Duration,
    /// Backoff cap.
    pub reconnect_max: Duration,
    /// Informational metadata sent with the handshake.
    pub meta: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:9001".to_string(),
            appid: String::new(),
            sn: String::new(),
            key: String::new(),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(15),
            meta: HashMap::new(),
        }
    }
}

/// What a command handler reports back; sent to the gateway as the ACK.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub status: String,
    pub detail: String,
}

impl CommandOutcome {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            status: "ok".to_string(),
            detail: detail.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            detail: detail.into(),
        }
    }
}

/// User callback invoked for every CMD frame. Runs on a blocking task.
pub type CommandHandler = Arc<dyn Fn(&CommandPayload) -> CommandOutcome + Send + Sync>;

/// Callback invoked on connection state transitions.
pub type ConnectedCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Connection state shared between the client handle and its tasks.
struct Shared {
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
    on_connected: std::sync::Mutex<Option<ConnectedCallback>>,
}

impl Shared {
    async fn send_message(&self, msg: &Message) -> GatewayResult<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => write_message(writer, msg).await,
            None => Err(GatewayError::Other("not connected".to_string())),
        }
    }

    async fn send_ack(&self, cmd_id: &str, status: &str, detail: &str) -> GatewayResult<()> {
        let ack = AckPayload {
            cmd_id: cmd_id.to_string(),
            status: status.to_string(),
            detail: detail.to_string(),
        };
        self.send_message(&Message::new(MsgType::Ack, &ack)?).await
    }

    async fn send_ping(&self) -> GatewayResult<()> {
        let ping = PingPayload {
            timestamp: unix_now(),
        };
        self.send_message(&Message::new(MsgType::Ping, &ping)?).await
    }

    async fn close_connection(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            self.last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
        }
        let callback = self
            .on_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(connected);
        }
    }

    fn set_error(&self, err: &GatewayError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }
}

/// A reconnecting device client.
pub struct DeviceClient {
    config: ClientConfig,
    handler: CommandHandler,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DeviceClient {
    pub fn new(config: ClientConfig, handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            shared: Arc::new(Shared {
                writer: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
                last_error: std::sync::Mutex::new(None),
                on_connected: std::sync::Mutex::new(None),
            }),
            shutdown_tx,
            task: std::sync::Mutex::new(None),
        }
    }

    /// Register a callback for connect/disconnect transitions.
    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        *self
            .shared
            .on_connected
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Spawn the reconnect loop.
    pub fn start(&self) {
        let task = run_loop(
            self.config.clone(),
            Arc::clone(&self.handler),
            Arc::clone(&self.shared),
            self.shutdown_tx.clone(),
        );
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(tokio::spawn(task));
    }

    /// Stop reconnecting, close the connection, and join the loop.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.shared.close_connection().await;
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Send an acknowledgement for a command handled out of band.
    pub async fn send_ack(&self, cmd_id: &str, status: &str, detail: &str) -> GatewayResult<()> {
        self.shared.send_ack(cmd_id, status, detail).await
    }
}

async fn run_loop(
    config: ClientConfig,
    handler: CommandHandler,
    shared: Arc<Shared>,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut backoff = config.reconnect_min;

    loop {
        match connect(&config, &shared).await {
            Err(e) => {
                shared.set_error(&e);
                let backoff_ms = backoff.as_millis() as u64;
                warn!(error = %e, backoff_ms, "connection failed, retrying");
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(config.reconnect_max);
            }
            Ok(read_half) => {
                backoff = config.reconnect_min;
                shared.set_connected(true);

                let finished =
                    run_connection(read_half, &handler, &shared, &mut shutdown_rx).await;

                shared.set_connected(false);
                shared.close_connection().await;
                if finished == LoopExit::Shutdown {
                    return;
                }
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoopExit {
    Shutdown,
    ConnectionLost,
}

/// Dial, authenticate, and install the write half. Returns the read half for
/// the connected loop.
async fn connect(config: &ClientConfig, shared: &Arc<Shared>) -> GatewayResult<OwnedReadHalf> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&config.server_addr))
        .await
        .map_err(|_| GatewayError::Other(format!("dial timeout: {}", config.server_addr)))??;

    let (mut read_half, mut write_half) = stream.into_split();

    let ts = unix_now();
    let nonce = generate_nonce();
    let auth = AuthPayload {
        appid: config.appid.clone(),
        sn: config.sn.clone(),
        ts,
        nonce: nonce.clone(),
        sign: Authenticator::sign(&config.appid, &config.sn, ts, &nonce, &config.key),
        meta: config.meta.clone(),
    };
    write_message(&mut write_half, &Message::new(MsgType::Auth, &auth)?).await?;

    let response = tokio::time::timeout(CONNECT_TIMEOUT, read_message(&mut read_half))
        .await
        .map_err(|_| GatewayError::AuthFailed("auth response timeout".to_string()))??;
    if response.msg_type != MsgType::AuthOk {
        return Err(GatewayError::AuthFailed(format!(
            "unexpected auth response type: {}",
            u8::from(response.msg_type)
        )));
    }
    let auth_ok: AuthOkPayload = response.decode_payload()?;
    if !auth_ok.success {
        return Err(GatewayError::AuthFailed(auth_ok.message));
    }

    *shared.writer.lock().await = Some(write_half);
    info!(sn = %config.sn, server = %config.server_addr, "device authenticated");
    Ok(read_half)
}

async fn run_connection(
    mut read_half: OwnedReadHalf,
    handler: &CommandHandler,
    shared: &Arc<Shared>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> LoopExit {
    // Heartbeat runs as its own task so a slow read never delays pings.
    let ping_task = {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                if let Err(e) = shared.send_ping().await {
                    debug!(error = %e, "ping failed");
                    return;
                }
            }
        })
    };

    let exit = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break LoopExit::Shutdown,
            result = tokio::time::timeout(READ_TIMEOUT, read_message(&mut read_half)) => {
                let msg = match result {
                    Err(_) => {
                        warn!("server read timeout");
                        break LoopExit::ConnectionLost;
                    }
                    Ok(Err(e)) => {
                        shared.set_error(&e);
                        debug!(error = %e, "read error");
                        break LoopExit::ConnectionLost;
                    }
                    Ok(Ok(msg)) => msg,
                };
                handle_message(msg, handler, shared).await;
            }
        }
    };

    ping_task.abort();
    exit
}

async fn handle_message(msg: Message, handler: &CommandHandler, shared: &Arc<Shared>) {
    match msg.msg_type {
        MsgType::Ping => {
            let pong = PongPayload {
                timestamp: unix_now(),
            };
            match Message::new(MsgType::Pong, &pong) {
                Ok(reply) => {
                    if let Err(e) = shared.send_message(&reply).await {
                        debug!(error = %e, "failed to send pong");
                    }
                }
                Err(e) => debug!(error = %e, "failed to encode pong"),
            }
        }
        MsgType::Pong => {}
        MsgType::Cmd => match msg.decode_payload::<CommandPayload>() {
            Ok(cmd) => dispatch_command(cmd, handler, shared),
            Err(e) => warn!(error = %e, "invalid command payload"),
        },
        MsgType::Err => match msg.decode_payload::<ErrorPayload>() {
            Ok(err) => warn!(code = err.code, message = %err.message, "server error"),
            Err(e) => warn!(error = %e, "invalid error payload"),
        },
        other => debug!(msg_type = u8::from(other), "unhandled message type"),
    }
}

/// Run the user handler on a blocking task and ACK with its outcome. A
/// panicking handler yields an `error` ACK instead of tearing the client
/// down.
fn dispatch_command(cmd: CommandPayload, handler: &CommandHandler, shared: &Arc<Shared>) {
    let handler = Arc::clone(handler);
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let cmd_id = cmd.cmd_id.clone();
        let cmd_name = cmd.cmd.clone();
        info!(cmd = %cmd_name, cmd_id = %cmd_id, "received command");

        let outcome = match tokio::task::spawn_blocking(move || handler(&cmd)).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => {
                warn!(cmd = %cmd_name, "command handler panicked");
                CommandOutcome::error("command handler panicked")
            }
            Err(e) => CommandOutcome::error(format!("command handler failed: {e}")),
        };

        if let Err(e) = shared.send_ack(&cmd_id, &outcome.status, &outcome.detail).await {
            warn!(cmd_id = %cmd_id, error = %e, "failed to send ack");
        }
    });
}

/// Generate a random auth nonce (hex-encoded, 16 bytes).
fn generate_nonce() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors() {
        let ok = CommandOutcome::ok("done");
        assert_eq!(ok.status, "ok");
        assert_eq!(ok.detail, "done");

        let err = CommandOutcome::error("nope");
        assert_eq!(err.status, "error");
    }

    #[test]
    fn nonce_is_hex_and_unique() {
        let a = generate_nonce();
        let b = generate_nonce();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let config = ClientConfig::default();
        let mut backoff = config.reconnect_min;
        for _ in 0..10 {
            backoff = (backoff * 2).min(config.reconnect_max);
        }
        assert_eq!(backoff, config.reconnect_max);
    }
}
