//! dgw-core: Shared protocol library for the device control gateway.
//!
//! Provides the framed wire codec, typed JSON message payloads, the HMAC
//! authenticator with its nonce store, and the common error type used by
//! both the gateway server and device-side clients.

pub mod auth;
pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use auth::{Authenticator, MemoryNonceStore, NonceStore, unix_now};
pub use codec::{MAX_FRAME_SIZE, encode_message, read_message, write_message};
pub use error::{GatewayError, GatewayResult};
pub use messages::{Message, MsgType, PROTOCOL_VERSION};
