//! # Wire Protocol
//!
//! JSON shapes exchanged with devices and clients over both transport
//! bindings. Payloads and target metadata are opaque to the relay: they are
//! carried as arbitrary JSON values and never inspected.
//!
//! Field names are camelCase (`tunnelId`, `targetInfo`) so that existing
//! device firmware and browser scripts keep working unchanged.

use serde::{Deserialize, Serialize};

/// An opaque blob relayed between the two sides of a tunnel.
pub type Payload = serde_json::Value;

/// Opaque routing metadata supplied by the device (e.g. `{"ip": .., "port": ..}`).
pub type TargetInfo = serde_json::Value;

// ─── WebSocket Binding ──────────────────────────────────────────

/// Messages exchanged over the persistent WebSocket binding.
///
/// Serialized with serde's internally-tagged representation, so
/// `WsMessage::Pong` becomes `{"type": "pong"}` and
/// `WsMessage::Registered { tunnel_id }` becomes
/// `{"type": "registered", "tunnelId": "..."}`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WsMessage {
    // ── Registration ──────────────────────────────────────────────

    /// Sent by a device to open (or re-open) a tunnel. When `tunnel_id` is
    /// omitted the server picks one and reports it in `Registered`.
    #[serde(alias = "register_esp32")]
    RegisterDevice {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        #[serde(default)]
        target_info: TargetInfo,
    },

    /// Server acknowledgment of a device registration.
    Registered { tunnel_id: String },

    /// Sent by a client to join an existing tunnel.
    #[serde(alias = "register_browser")]
    RegisterClient { tunnel_id: String },

    /// Server acknowledgment of a client join, echoing the device's target.
    Connected { target_info: TargetInfo },

    // ── Data Relay ────────────────────────────────────────────────

    /// Carries one payload. Inbound it is submitted on the sender's side;
    /// outbound it is a payload pushed from the opposite side.
    Data {
        #[serde(default)]
        data: Payload,
    },

    // ── Heartbeat ─────────────────────────────────────────────────

    Ping,
    Pong,

    // ── Error ─────────────────────────────────────────────────────

    /// Error notification with a human-readable message.
    Error { message: String },
}

// ─── Long-Polling Binding ───────────────────────────────────────

/// `?tunnel=ID` query string shared by the poll and send endpoints.
#[derive(Debug, Deserialize, Default)]
pub struct TunnelQuery {
    pub tunnel: Option<String>,
}

/// Body of `POST /device/register`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub tunnel_id: Option<String>,
    #[serde(default)]
    pub target_info: TargetInfo,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    pub tunnel_id: String,
}

/// Body of the `send` endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub data: Payload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendResponse {
    pub success: bool,
}

/// Result of a long poll: `{"data": null}` means nothing arrived in time.
#[derive(Debug, Serialize, Deserialize)]
pub struct PollResponse {
    pub data: Option<Payload>,
}
