//! # Server State
//!
//! Holds the shared application state for the relay server:
//! - **Rendezvous engine**: the tunnel registry plus matching logic, shared
//!   by the long-polling and WebSocket bindings
//! - **Poll timeout**: how long a long poll is held open
//! - **Shutdown token**: cancelled on Ctrl-C so pending polls answer at once
//!
//! Cloned into every request handler by axum.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::Rendezvous;

#[derive(Clone)]
pub struct AppState {
    /// Tunnel registry and matching logic.
    pub engine: Rendezvous,

    /// Deadline applied to every long poll.
    pub poll_timeout: Duration,

    /// Root token; long polls wait on child tokens of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(config: &Config, shutdown: CancellationToken) -> Self {
        Self {
            engine: Rendezvous::default(),
            poll_timeout: config.poll_timeout(),
            shutdown,
        }
    }
}
