//! dgw-server: device control gateway.
//!
//! Multiplexes long-lived device TCP connections, authenticates each on
//! connect, polices liveness with heartbeats, and routes operator commands
//! (issued over the admin HTTP API) to the right connection, correlating
//! acknowledgements back to the caller.

pub mod ack;
pub mod api;
pub mod config;
pub mod server;
pub mod session;

pub use ack::AckWaiter;
pub use config::GatewayConfig;
pub use server::{GatewayServer, MessageHandler, ServerConfig};
pub use session::{Session, SessionManager};
