//! Admin HTTP API: translates operator calls into session lookups, command
//! sends, and ACK waits.

pub mod devices;
pub mod messages;

use crate::ack::AckWaiter;
use crate::session::SessionManager;
use axum::routing::{get, post};
use axum::{Json, Router};
use dgw_core::unix_now;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for the admin handlers.
#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub ack_waiter: Arc<AckWaiter>,
}

/// Build the admin router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/devices/online", get(devices::list_online))
        .route("/api/devices/offline", get(devices::list_offline))
        .route("/api/devices/{sn}", get(devices::get_detail))
        .route("/api/devices/{sn}/send", post(messages::send))
        .route("/api/devices/{sn}/send-async", post(messages::send_async))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "time": unix_now(),
    }))
}
