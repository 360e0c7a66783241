//! Wire message types for the device control protocol.
//!
//! Every frame body carries a version byte, a numeric type tag, and a JSON
//! payload whose shape is determined by the tag. Payload readers tolerate
//! unknown fields; absent required fields are a decode error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Numeric message type tags — wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    /// Device → server handshake.
    Auth = 1,
    /// Server → device handshake result.
    AuthOk = 2,
    /// Liveness probe, echo requested.
    Ping = 3,
    /// Response to Ping, refreshes peer liveness.
    Pong = 4,
    /// Device-originated report; not interpreted by the core.
    Report = 5,
    /// Operator-originated command.
    Cmd = 6,
    /// Device response correlated by cmd_id.
    Ack = 7,
    /// Out-of-band error with code and text.
    Err = 8,
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            1 => Ok(Self::Auth),
            2 => Ok(Self::AuthOk),
            3 => Ok(Self::Ping),
            4 => Ok(Self::Pong),
            5 => Ok(Self::Report),
            6 => Ok(Self::Cmd),
            7 => Ok(Self::Ack),
            8 => Ok(Self::Err),
            _ => Err(format!("unknown message type: {v}")),
        }
    }
}

/// One framed message: version, type tag, raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub version: u8,
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message by serialising `payload` as JSON.
    pub fn new<T: Serialize>(msg_type: MsgType, payload: &T) -> crate::GatewayResult<Self> {
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Deserialise the payload into the type matching `msg_type`.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> crate::GatewayResult<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Handshake payload (type 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub appid: String,
    pub sn: String,
    /// Unix seconds at signing time.
    pub ts: i64,
    /// Single-use opaque token, hex of ≥16 random bytes.
    pub nonce: String,
    /// Lower-case hex HMAC-SHA256 over `appid|sn|ts|nonce`.
    pub sign: String,
    /// Informational device metadata.
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Handshake result payload (type 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOkPayload {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Liveness probe payload (type 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

/// Liveness response payload (type 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PongPayload {
    pub timestamp: i64,
}

/// Operator command payload (type 6). `args` is carried verbatim to the
/// device; the gateway does not interpret it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandPayload {
    pub cmd_id: String,
    pub cmd: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub timeout_ms: i64,
}

/// Command acknowledgement payload (type 7).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    pub cmd_id: String,
    /// `ok`, `error`, or an implementation-defined status.
    pub status: String,
    #[serde(default)]
    pub detail: String,
}

/// Out-of-band error payload (type 8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: i32,
    pub message: String,
}
