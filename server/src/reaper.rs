//! # Idle Reaper
//!
//! Long-polling tunnels have no "close" event, so abandoned ones are swept
//! periodically: every `interval`, tunnels with nothing queued, nobody
//! waiting and no attached connection are removed.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::TunnelRegistry;

/// Spawns the sweep loop. It stops when `shutdown` is cancelled.
pub fn spawn_reaper(
    registry: TunnelRegistry,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so a freshly
        // registered tunnel gets a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for tunnel_id in registry.reap_idle() {
                        info!(tunnel_id = %tunnel_id, "Removing idle tunnel");
                    }
                    debug!(remaining = registry.len(), "Idle sweep finished");
                }
            }
        }
        debug!("Reaper stopped");
    })
}
