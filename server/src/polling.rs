//! # Long-Polling Binding
//!
//! Plain HTTP endpoints for devices that cannot hold a WebSocket open:
//!
//! | Route | Engine call |
//! |---|---|
//! | `POST /device/register` | `register` |
//! | `GET /{device,client}/poll?tunnel=ID` | `await_next` |
//! | `POST /{device,client}/send?tunnel=ID` | `submit` |
//!
//! A poll that runs out of time answers `{"data": null}` and the caller
//! simply polls again. Device-side calls create the tunnel on first
//! contact; client-side calls against an unknown tunnel get a 404.
//!
//! Request bodies are decoded as JSON whatever their `Content-Type` says,
//! including when the header is missing.

use axum::{
    body::Bytes,
    extract::{Query, State},
    Json,
};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::RelayError;
use crate::protocol::{
    PollResponse, RegisterRequest, RegisterResponse, SendRequest, SendResponse, TunnelQuery,
};
use crate::registry::generate_tunnel_id;
use crate::state::AppState;
use crate::tunnel::Side;
use crate::waiter::{CancelReason, WaitOutcome};

// ─── Registration ───────────────────────────────────────────────

/// `POST /device/register` — Creates the tunnel or refreshes its target.
pub async fn device_register(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<RegisterResponse>, RelayError> {
    let request: RegisterRequest = decode(&body)?;
    let tunnel_id = request.tunnel_id.unwrap_or_else(generate_tunnel_id);
    let tunnel_id = state.engine.register(&tunnel_id, request.target_info);
    Ok(Json(RegisterResponse {
        success: true,
        tunnel_id,
    }))
}

// ─── Polls ──────────────────────────────────────────────────────

/// `GET /device/poll?tunnel=ID` — Waits for data sent by the client.
pub async fn device_poll(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<PollResponse>, RelayError> {
    poll(&state, Side::Device, query).await
}

/// `GET /client/poll?tunnel=ID` — Waits for data sent by the device.
pub async fn client_poll(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
) -> Result<Json<PollResponse>, RelayError> {
    poll(&state, Side::Client, query).await
}

async fn poll(
    state: &AppState,
    side: Side,
    query: TunnelQuery,
) -> Result<Json<PollResponse>, RelayError> {
    let tunnel_id = tunnel_id(state, side, query)?;
    let deadline = Instant::now() + state.poll_timeout;
    let cancel = state.shutdown.child_token();

    let data = match state.engine.await_next(&tunnel_id, side, deadline, &cancel).await? {
        WaitOutcome::Delivered(payload) => Some(payload),
        WaitOutcome::TimedOut | WaitOutcome::Cancelled(CancelReason::Aborted) => None,
        WaitOutcome::Cancelled(CancelReason::Superseded) => {
            info!(tunnel_id = %tunnel_id, side = %side, "Poll superseded by a newer poll");
            return Err(RelayError::Superseded);
        }
        WaitOutcome::Cancelled(CancelReason::TunnelClosed) => {
            return Err(RelayError::TunnelNotFound(tunnel_id));
        }
    };
    Ok(Json(PollResponse { data }))
}

// ─── Sends ──────────────────────────────────────────────────────

/// `POST /device/send?tunnel=ID` — Sends data towards the client.
pub async fn device_send(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    body: Bytes,
) -> Result<Json<SendResponse>, RelayError> {
    send(&state, Side::Device, query, body)
}

/// `POST /client/send?tunnel=ID` — Sends data towards the device.
pub async fn client_send(
    State(state): State<AppState>,
    Query(query): Query<TunnelQuery>,
    body: Bytes,
) -> Result<Json<SendResponse>, RelayError> {
    send(&state, Side::Client, query, body)
}

fn send(
    state: &AppState,
    side: Side,
    query: TunnelQuery,
    body: Bytes,
) -> Result<Json<SendResponse>, RelayError> {
    let request: SendRequest = decode(&body)?;
    let tunnel_id = tunnel_id(state, side, query)?;
    state.engine.submit(&tunnel_id, side, request.data)?;
    Ok(Json(SendResponse { success: true }))
}

// ─── Helpers ────────────────────────────────────────────────────

/// Resolves the `tunnel` query parameter. A missing parameter reads as an
/// unknown tunnel. The device side brings its tunnel into existence.
fn tunnel_id(state: &AppState, side: Side, query: TunnelQuery) -> Result<String, RelayError> {
    let tunnel_id = query
        .tunnel
        .filter(|id| !id.is_empty())
        .ok_or_else(|| RelayError::TunnelNotFound(String::new()))?;
    if side == Side::Device {
        state.engine.ensure_tunnel(&tunnel_id);
    }
    Ok(tunnel_id)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "Rejected malformed request body");
        RelayError::MalformedInput(e.to_string())
    })
}
