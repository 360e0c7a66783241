//! Device listing and detail endpoints.

use super::ApiState;
use crate::session::Session;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Local, TimeZone};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Serialize)]
pub struct DeviceInfo {
    pub sn: String,
    pub appid: String,
    pub remote_addr: String,
    pub login_at: String,
    pub last_ping: String,
    pub meta: HashMap<String, String>,
    pub online: bool,
}

fn device_info(session: &Session) -> DeviceInfo {
    let identity = session.identity();
    let last_ping = Local
        .timestamp_opt(session.last_ping(), 0)
        .single()
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default();
    DeviceInfo {
        sn: identity.map(|i| i.sn.clone()).unwrap_or_default(),
        appid: identity.map(|i| i.appid.clone()).unwrap_or_default(),
        remote_addr: session.remote_addr.to_string(),
        login_at: session.login_at.format(TIME_FORMAT).to_string(),
        last_ping,
        meta: identity.map(|i| i.meta.clone()).unwrap_or_default(),
        online: true,
    }
}

/// `GET /api/devices/online`
pub async fn list_online(State(state): State<ApiState>) -> Json<Value> {
    let mut result: Vec<DeviceInfo> = state
        .sessions
        .online_devices()
        .iter()
        .filter_map(|sn| state.sessions.get_by_sn(sn))
        .map(|session| device_info(&session))
        .collect();
    result.sort_by(|a, b| a.sn.cmp(&b.sn));

    Json(json!({
        "success": true,
        "data": result,
        "count": result.len(),
    }))
}

/// `GET /api/devices/offline`
///
/// The gateway keeps no state across restarts and no record of departed
/// devices, so this is always empty.
pub async fn list_offline() -> Json<Value> {
    Json(json!({
        "success": true,
        "data": [],
        "count": 0,
    }))
}

/// `GET /api/devices/{sn}`
pub async fn get_detail(
    Path(sn): Path<String>,
    State(state): State<ApiState>,
) -> (StatusCode, Json<Value>) {
    match state.sessions.get_by_sn(&sn) {
        Some(session) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "data": device_info(&session),
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "success": false,
                "error": "device not found",
            })),
        ),
    }
}
