//! Command dispatch endpoints: route a CMD to a device by SN and optionally
//! block on its acknowledgement.

use super::ApiState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use dgw_core::messages::CommandPayload;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;

/// Fallback ACK deadline when the caller supplies no positive timeout.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub msg_type: String,
    pub payload: Value,
    #[serde(default)]
    pub timeout_ms: i64,
}

/// `POST /api/devices/{sn}/send` — send a command and block for its ACK.
pub async fn send(
    Path(sn): Path<String>,
    State(state): State<ApiState>,
    Json(req): Json<SendMessageRequest>,
) -> (StatusCode, Json<Value>) {
    let (session, cmd) = match prepare(&state, &sn, &req) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    if let Err(e) = session.send_command(&cmd).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": format!("failed to send command: {e}"),
            })),
        );
    }

    let timeout = if req.timeout_ms > 0 {
        Duration::from_millis(req.timeout_ms as u64)
    } else {
        DEFAULT_ACK_TIMEOUT
    };

    match state.ack_waiter.wait(&cmd.cmd_id, timeout).await {
        Ok(ack) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "cmd_id": cmd.cmd_id,
                "ack": ack,
            })),
        ),
        Err(e) => {
            debug!(sn = %sn, cmd_id = %cmd.cmd_id, error = %e, "ack wait failed");
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(json!({
                    "success": false,
                    "error": format!("ack timeout: {e}"),
                })),
            )
        }
    }
}

/// `POST /api/devices/{sn}/send-async` — send a command and return at once.
pub async fn send_async(
    Path(sn): Path<String>,
    State(state): State<ApiState>,
    Json(req): Json<SendMessageRequest>,
) -> (StatusCode, Json<Value>) {
    let (session, cmd) = match prepare(&state, &sn, &req) {
        Ok(prepared) => prepared,
        Err(response) => return response,
    };

    if let Err(e) = session.send_command(&cmd).await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": format!("failed to send command: {e}"),
            })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "cmd_id": cmd.cmd_id,
            "message": "command sent",
        })),
    )
}

type PreparedSend = (
    std::sync::Arc<crate::session::Session>,
    CommandPayload,
);

fn prepare(
    state: &ApiState,
    sn: &str,
    req: &SendMessageRequest,
) -> Result<PreparedSend, (StatusCode, Json<Value>)> {
    let args: Map<String, Value> = match &req.payload {
        Value::Object(map) => map.clone(),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "success": false,
                    "error": "invalid payload: expected a JSON object",
                })),
            ))
        }
    };

    let session = state.sessions.get_by_sn(sn).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "device offline",
            })),
        )
    })?;

    let cmd = CommandPayload {
        cmd_id: generate_cmd_id(),
        cmd: req.msg_type.clone(),
        args,
        timeout_ms: req.timeout_ms,
    };
    Ok((session, cmd))
}

/// Generate a unique command id (hex-encoded, 16 random bytes).
fn generate_cmd_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
