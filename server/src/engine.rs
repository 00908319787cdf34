//! # Rendezvous Engine
//!
//! The single place where the device side and the client side of a tunnel
//! meet. Both transport bindings go through [`Rendezvous`]:
//!
//! - the long-polling binding uses [`submit`](Rendezvous::submit) and
//!   [`await_next`](Rendezvous::await_next);
//! - the WebSocket binding uses [`submit`](Rendezvous::submit) and pushes
//!   through [`attach_device`](Rendezvous::attach_device) /
//!   [`attach_client`](Rendezvous::attach_client), tearing the tunnel down
//!   with [`detach`](Rendezvous::detach).
//!
//! Because the state is shared, a payload sent over one binding reaches a
//! recipient connected through the other.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::protocol::{Payload, TargetInfo};
use crate::registry::TunnelRegistry;
use crate::tunnel::{PushSink, Routed, Side, TunnelSnapshot, WaitStart};
use crate::waiter::WaitOutcome;

/// A live connection attached to one side of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub tunnel_id: String,
    pub side: Side,
    ticket: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Rendezvous {
    registry: TunnelRegistry,
}

impl Rendezvous {
    pub fn new(registry: TunnelRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    /// Creates or updates a tunnel and echoes its id.
    pub fn register(&self, tunnel_id: &str, target_info: TargetInfo) -> String {
        self.registry.register(tunnel_id, target_info);
        tunnel_id.to_string()
    }

    /// Makes sure a tunnel exists for a device that polls or sends before
    /// registering.
    pub fn ensure_tunnel(&self, tunnel_id: &str) {
        self.registry.get_or_create(tunnel_id);
    }

    pub fn target_info(&self, tunnel_id: &str) -> Result<TargetInfo, RelayError> {
        Ok(self.registry.get(tunnel_id)?.target_info())
    }

    /// Routes a payload from `side` to the opposite side. Never blocks.
    pub fn submit(
        &self,
        tunnel_id: &str,
        side: Side,
        payload: Payload,
    ) -> Result<Routed, RelayError> {
        self.registry.get(tunnel_id)?.submit(side, payload)
    }

    /// Waits for the next payload destined for `side`.
    ///
    /// Returns immediately when something is queued. Otherwise parks a
    /// waiter (superseding any earlier one for the same side) until data
    /// arrives, `deadline` passes, or `cancel` fires. Dropping the returned
    /// future releases the waiter slot.
    pub async fn await_next(
        &self,
        tunnel_id: &str,
        side: Side,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, RelayError> {
        let tunnel = self.registry.get(tunnel_id)?;
        match tunnel.begin_wait(side)? {
            WaitStart::Ready(payload) => Ok(WaitOutcome::Delivered(payload)),
            WaitStart::Pending(pending) => Ok(pending.wait(deadline, cancel).await),
        }
    }

    /// Registers (or re-registers) the device side and attaches its live
    /// connection in one step. Anything queued for the device is flushed
    /// into `sink` first.
    pub fn attach_device(
        &self,
        tunnel_id: &str,
        target_info: TargetInfo,
        sink: PushSink,
    ) -> Result<Attachment, RelayError> {
        let ticket = self
            .registry
            .register_and(tunnel_id, target_info, |tunnel| tunnel.attach(Side::Device, sink))?;
        Ok(Attachment {
            tunnel_id: tunnel_id.to_string(),
            side: Side::Device,
            ticket,
        })
    }

    /// Attaches a client's live connection to an existing tunnel.
    pub fn attach_client(&self, tunnel_id: &str, sink: PushSink) -> Result<Attachment, RelayError> {
        let ticket = self.registry.get(tunnel_id)?.attach(Side::Client, sink)?;
        Ok(Attachment {
            tunnel_id: tunnel_id.to_string(),
            side: Side::Client,
            ticket,
        })
    }

    /// Called when an attached connection goes away. Tears the whole tunnel
    /// down if that connection is still the one attached to its side; a
    /// connection that was already replaced leaves the tunnel alone.
    pub fn detach(&self, attachment: &Attachment) -> bool {
        self.registry.remove_if(&attachment.tunnel_id, |tunnel| {
            tunnel.is_attached(attachment.side, attachment.ticket)
        })
    }

    pub fn list(&self) -> Vec<TunnelSnapshot> {
        self.registry.list()
    }

    pub fn remove(&self, tunnel_id: &str) -> bool {
        self.registry.remove(tunnel_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::CancelReason;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn engine_with(tunnel_id: &str) -> Rendezvous {
        let engine = Rendezvous::default();
        engine.register(tunnel_id, json!({"ip": "10.0.0.5", "port": 80}));
        engine
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn test_queued_payload_returns_immediately() {
        let engine = engine_with("t");
        engine.submit("t", Side::Client, json!("GET /")).unwrap();

        let outcome = engine
            .await_next("t", Side::Device, Instant::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::Delivered(json!("GET /")));
    }

    #[tokio::test]
    async fn test_submit_resolves_pending_waiter_without_queueing() {
        let engine = engine_with("t");
        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_next("t", Side::Client, far_deadline(), &CancellationToken::new())
                    .await
            })
        };
        while !engine.list()[0].client_connected {
            tokio::task::yield_now().await;
        }

        assert_eq!(engine.submit("t", Side::Device, json!("<html>")).unwrap(), Routed::Delivered);
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            WaitOutcome::Delivered(json!("<html>"))
        );
        assert!(engine.registry().get("t").unwrap().is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_no_data_and_clears_slot() {
        let engine = engine_with("t");
        let outcome = engine
            .await_next(
                "t",
                Side::Device,
                Instant::now() + Duration::from_secs(30),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::TimedOut);

        assert_eq!(engine.submit("t", Side::Client, json!("later")).unwrap(), Routed::Queued);
    }

    #[tokio::test]
    async fn test_second_poll_supersedes_first() {
        let engine = engine_with("t");
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_next("t", Side::Device, far_deadline(), &CancellationToken::new())
                    .await
            })
        };
        while !engine.list()[0].device_connected {
            tokio::task::yield_now().await;
        }
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_next("t", Side::Device, far_deadline(), &CancellationToken::new())
                    .await
            })
        };

        assert_eq!(
            first.await.unwrap().unwrap(),
            WaitOutcome::Cancelled(CancelReason::Superseded)
        );
        engine.submit("t", Side::Client, json!("for second")).unwrap();
        assert_eq!(
            second.await.unwrap().unwrap(),
            WaitOutcome::Delivered(json!("for second"))
        );
    }

    #[tokio::test]
    async fn test_cancel_token_releases_waiter() {
        let engine = engine_with("t");
        let cancel = CancellationToken::new();
        let waiting = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                engine.await_next("t", Side::Client, far_deadline(), &cancel).await
            })
        };
        while !engine.list()[0].client_connected {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            WaitOutcome::Cancelled(CancelReason::Aborted)
        );
        assert!(engine.registry().get("t").unwrap().is_idle());
    }

    #[tokio::test]
    async fn test_dropped_waiter_releases_slot() {
        let engine = engine_with("t");
        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_next("t", Side::Client, far_deadline(), &CancellationToken::new())
                    .await
            })
        };
        while !engine.list()[0].client_connected {
            tokio::task::yield_now().await;
        }

        waiting.abort();
        let _ = waiting.await;
        assert!(engine.registry().get("t").unwrap().is_idle());
        assert_eq!(engine.submit("t", Side::Device, json!("kept")).unwrap(), Routed::Queued);
    }

    #[tokio::test]
    async fn test_payload_handed_to_abandoned_waiter_is_requeued_first() {
        let engine = engine_with("t");
        let tunnel = engine.registry().get("t").unwrap();
        let WaitStart::Pending(pending) = tunnel.begin_wait(Side::Client).unwrap() else {
            panic!("expected an empty queue");
        };

        assert_eq!(engine.submit("t", Side::Device, json!("a")).unwrap(), Routed::Delivered);
        assert_eq!(engine.submit("t", Side::Device, json!("b")).unwrap(), Routed::Queued);
        drop(pending);

        for expected in ["a", "b"] {
            let outcome = engine
                .await_next("t", Side::Client, Instant::now(), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome, WaitOutcome::Delivered(json!(expected)));
        }
        assert!(tunnel.is_idle());
    }

    #[tokio::test]
    async fn test_remove_wakes_waiter_as_closed() {
        let engine = engine_with("t");
        let waiting = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .await_next("t", Side::Device, far_deadline(), &CancellationToken::new())
                    .await
            })
        };
        while !engine.list()[0].device_connected {
            tokio::task::yield_now().await;
        }

        assert!(engine.remove("t"));
        assert!(!engine.remove("t"));
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            WaitOutcome::Cancelled(CancelReason::TunnelClosed)
        );
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_not_found() {
        let engine = Rendezvous::default();
        assert_eq!(
            engine.submit("nope", Side::Device, json!(1)),
            Err(RelayError::TunnelNotFound("nope".to_string()))
        );
        assert!(engine
            .await_next("nope", Side::Client, far_deadline(), &CancellationToken::new())
            .await
            .is_err());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(engine.attach_client("nope", tx).is_err());
    }

    #[tokio::test]
    async fn test_fifo_order_across_sides() {
        let engine = engine_with("t");
        for i in 0..10 {
            engine.submit("t", Side::Device, json!(i)).unwrap();
        }
        for i in 0..10 {
            let outcome = engine
                .await_next("t", Side::Client, far_deadline(), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(outcome, WaitOutcome::Delivered(json!(i)));
        }
    }

    #[tokio::test]
    async fn test_detach_tears_down_tunnel_and_closes_peer() {
        let engine = Rendezvous::default();
        let (device_tx, _device_rx) = mpsc::unbounded_channel();
        let device = engine
            .attach_device("t", json!({"port": 80}), device_tx)
            .unwrap();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        engine.attach_client("t", client_tx).unwrap();

        engine.submit("t", Side::Device, json!("page")).unwrap();
        assert_eq!(client_rx.recv().await, Some(json!("page")));

        assert!(engine.detach(&device));
        assert!(engine.registry().get("t").is_err());
        assert_eq!(client_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_replaced_connection_does_not_tear_down() {
        let engine = Rendezvous::default();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        let old = engine.attach_device("t", json!({}), old_tx).unwrap();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();
        engine.attach_device("t", json!({}), new_tx).unwrap();

        assert_eq!(old_rx.recv().await, None);
        assert!(!engine.detach(&old));
        assert!(engine.registry().get("t").is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submit_and_await_pair_one_to_one() {
        let engine = engine_with("t");

        let mut receivers = Vec::new();
        for _ in 0..100 {
            let engine = engine.clone();
            receivers.push(tokio::spawn(async move {
                loop {
                    let outcome = engine
                        .await_next("t", Side::Client, far_deadline(), &CancellationToken::new())
                        .await
                        .unwrap();
                    if let WaitOutcome::Delivered(payload) = outcome {
                        return payload;
                    }
                }
            }));
        }

        let mut senders = Vec::new();
        for i in 0..100 {
            let engine = engine.clone();
            senders.push(tokio::spawn(async move {
                engine.submit("t", Side::Device, json!(i)).unwrap();
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut seen = HashSet::new();
        for receiver in receivers {
            let payload = receiver.await.unwrap();
            assert!(seen.insert(payload.as_i64().unwrap()), "payload delivered twice");
        }
        assert_eq!(seen.len(), 100);
        assert!(engine.registry().get("t").unwrap().is_idle());
    }
}
