//! # Relay Errors
//!
//! Failures surfaced by the rendezvous engine and the transport bindings.
//! A long poll that simply runs out of time is *not* an error; it resolves
//! as [`WaitOutcome::TimedOut`](crate::waiter::WaitOutcome::TimedOut).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The tunnel id was never registered, or has since been reaped or torn down.
    #[error("tunnel '{0}' not found")]
    TunnelNotFound(String),

    /// The binding could not decode the request before it reached the engine.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A WebSocket connection tried to register a second time.
    #[error("connection already registered to tunnel '{0}'")]
    AlreadyRegistered(String),

    /// A WebSocket connection sent data before registering.
    #[error("connection is not registered to a tunnel")]
    NotRegistered,

    /// A newer poll for the same side replaced this one.
    #[error("poll superseded by a newer poll for the same side")]
    Superseded,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            RelayError::TunnelNotFound(_) => (StatusCode::NOT_FOUND, "Tunnel not found"),
            RelayError::MalformedInput(_) => (StatusCode::BAD_REQUEST, "Bad Request"),
            RelayError::Superseded => (StatusCode::CONFLICT, "Superseded by a newer poll"),
            RelayError::AlreadyRegistered(_) | RelayError::NotRegistered => {
                (StatusCode::BAD_REQUEST, "Bad Request")
            }
        };
        (status, body).into_response()
    }
}
