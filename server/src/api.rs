//! # REST API Endpoints
//!
//! Read-only endpoints for operators and load balancers: the tunnel
//! listing, the health check, and a plain index banner.

use crate::protocol::TargetInfo;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

/// Response item representing a single tunnel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelListItem {
    pub tunnel_id: String,

    /// Whatever the device registered, e.g. `{"ip": "192.168.1.10", "port": 80}`.
    pub target_info: TargetInfo,

    /// The device side has a pending poll, queued data or a live connection.
    /// This approximates "recently active", it is not a liveness check.
    pub device_connected: bool,

    pub client_connected: bool,
}

/// `GET /api/tunnels` — Returns a JSON array of all tunnels, ordered by id.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelListItem>> {
    let tunnels = state
        .engine
        .list()
        .into_iter()
        .map(|snapshot| TunnelListItem {
            tunnel_id: snapshot.tunnel_id,
            target_info: snapshot.target_info,
            device_connected: snapshot.device_connected,
            client_connected: snapshot.client_connected,
        })
        .collect();
    Json(tunnels)
}

/// `GET /health`
pub async fn health() -> &'static str {
    "OK"
}

/// `GET /`
pub async fn index() -> &'static str {
    "Tunnel relay server"
}
