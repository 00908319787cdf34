//! # Tunnel Registry
//!
//! Maps tunnel ids to their shared [`Tunnel`] state. Backed by a sharded
//! [`DashMap`] so that lookups for unrelated tunnels do not serialize on a
//! single lock; each tunnel then guards its own slots.
//!
//! Lock order is always map shard first, then tunnel. Nothing takes a shard
//! lock while holding a tunnel lock.

use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::info;
use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::TargetInfo;
use crate::tunnel::{Tunnel, TunnelSnapshot};

/// Generates a random tunnel id for devices that do not bring their own.
///
/// Format: 12 lowercase hex characters, e.g. `"3f9a0c41b2d7"`.
pub fn generate_tunnel_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    uuid[..12].to_string()
}

#[derive(Debug, Clone, Default)]
pub struct TunnelRegistry {
    tunnels: Arc<DashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the tunnel if absent, else replaces its `target_info`.
    /// Queued data survives re-registration.
    pub fn register(&self, tunnel_id: &str, target_info: TargetInfo) -> Arc<Tunnel> {
        self.register_and(tunnel_id, target_info, Arc::clone)
    }

    /// Same as [`register`](Self::register), then runs `f` on the tunnel
    /// while its map entry is still locked, so the reaper cannot remove it
    /// in between.
    pub(crate) fn register_and<R>(
        &self,
        tunnel_id: &str,
        target_info: TargetInfo,
        f: impl FnOnce(&Arc<Tunnel>) -> R,
    ) -> R {
        match self.tunnels.entry(tunnel_id.to_string()) {
            Entry::Occupied(entry) => {
                info!(tunnel_id = %tunnel_id, target = %target_info, "Re-registered tunnel");
                entry.get().set_target_info(target_info);
                f(entry.get())
            }
            Entry::Vacant(entry) => {
                info!(tunnel_id = %tunnel_id, target = %target_info, "Registered tunnel");
                let tunnel = entry.insert(Arc::new(Tunnel::new(tunnel_id, target_info)));
                f(tunnel.value())
            }
        }
    }

    /// Returns the tunnel, creating it with no target metadata if absent.
    /// An existing tunnel's `target_info` is left untouched.
    ///
    /// A tunnel reaped between two device polls comes back this way with a
    /// `null` target, and stays so until the device registers again.
    pub fn get_or_create(&self, tunnel_id: &str) -> Arc<Tunnel> {
        self.tunnels
            .entry(tunnel_id.to_string())
            .or_insert_with(|| {
                info!(
                    tunnel_id = %tunnel_id,
                    "Created tunnel on device contact without registration; target unknown"
                );
                Arc::new(Tunnel::new(tunnel_id, TargetInfo::Null))
            })
            .value()
            .clone()
    }

    pub fn get(&self, tunnel_id: &str) -> Result<Arc<Tunnel>, RelayError> {
        self.tunnels
            .get(tunnel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RelayError::TunnelNotFound(tunnel_id.to_string()))
    }

    /// Removes the tunnel and wakes everything parked in it. No-op if absent.
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<Tunnel>> {
        let (_, tunnel) = self.tunnels.remove(tunnel_id)?;
        tunnel.close();
        info!(tunnel_id = %tunnel_id, "Removed tunnel");
        Some(tunnel)
    }

    /// Removes the tunnel only if `predicate` holds, checked under the
    /// entry lock.
    pub(crate) fn remove_if(
        &self,
        tunnel_id: &str,
        predicate: impl FnOnce(&Tunnel) -> bool,
    ) -> bool {
        match self.tunnels.remove_if(tunnel_id, |_, tunnel| predicate(tunnel)) {
            Some((_, tunnel)) => {
                tunnel.close();
                info!(tunnel_id = %tunnel_id, "Removed tunnel");
                true
            }
            None => false,
        }
    }

    /// Removes every idle tunnel and returns their ids.
    pub fn reap_idle(&self) -> Vec<String> {
        let mut reaped = Vec::new();
        self.tunnels.retain(|tunnel_id, tunnel| {
            if tunnel.close_if_idle() {
                reaped.push(tunnel_id.clone());
                false
            } else {
                true
            }
        });
        reaped
    }

    /// Snapshot of every tunnel, ordered by id.
    pub fn list(&self) -> Vec<TunnelSnapshot> {
        let tunnels: Vec<Arc<Tunnel>> = self
            .tunnels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut snapshots: Vec<TunnelSnapshot> = tunnels.iter().map(|t| t.snapshot()).collect();
        snapshots.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}
