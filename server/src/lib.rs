//! # Tunnel Relay
//!
//! A rendezvous server that lets a device behind NAT exchange opaque
//! payloads with a remote client. Both sides address the same tunnel id;
//! the server pairs "device wants to send/receive" with "client wants to
//! send/receive" and never looks inside the payloads.
//!
//! Two transport bindings share one [`engine::Rendezvous`]:
//! - [`polling`]: HTTP long polling (`/device/*`, `/client/*`)
//! - [`handlers`]: persistent WebSocket connections (`/ws`)

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod polling;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod state;
pub mod tunnel;
pub mod waiter;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use engine::{Attachment, Rendezvous};
pub use error::RelayError;
pub use state::AppState;
pub use tunnel::{Routed, Side};
pub use waiter::{CancelReason, WaitOutcome};

/// Builds the full HTTP router: both bindings plus the operator endpoints.
///
/// `/esp32/*` and `/browser/*` are kept as aliases of `/device/*` and
/// `/client/*` for devices flashed with the older paths.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(api::index))
        .route("/health", get(api::health))
        .route("/api/tunnels", get(api::list_tunnels))
        .route("/ws", get(handlers::ws_handler))
        .route("/device/register", post(polling::device_register))
        .route("/device/poll", get(polling::device_poll))
        .route("/device/send", post(polling::device_send))
        .route("/client/poll", get(polling::client_poll))
        .route("/client/send", post(polling::client_send))
        .route("/esp32/register", post(polling::device_register))
        .route("/esp32/poll", get(polling::device_poll))
        .route("/esp32/send", post(polling::device_send))
        .route("/browser/poll", get(polling::client_poll))
        .route("/browser/send", post(polling::client_send))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
