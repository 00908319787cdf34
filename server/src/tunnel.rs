//! # Tunnel State
//!
//! One [`Tunnel`] pairs a device endpoint with a client endpoint. Each
//! endpoint slot holds the payloads waiting to be picked up by that side,
//! at most one pending [`Waiter`], and at most one live push sink (a
//! WebSocket connection attached to that side).
//!
//! All mutations of a tunnel happen inside its own mutex, which is never
//! held across an `.await`. Different tunnels never contend with each other.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::RelayError;
use crate::protocol::{Payload, TargetInfo};
use crate::waiter::{PendingWait, Signal, Waiter, Withdrawal};

/// The two ends of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Device,
    Client,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Device => Side::Client,
            Side::Client => Side::Device,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Device => "device",
            Side::Client => "client",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel feeding a persistent connection attached to one side.
pub type PushSink = mpsc::UnboundedSender<Payload>;

/// Where a submitted payload ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Pushed straight into the recipient's live connection.
    Pushed,
    /// Handed to the recipient's pending waiter.
    Delivered,
    /// Appended to the recipient's queue.
    Queued,
}

/// Outcome of starting a wait on one side.
pub(crate) enum WaitStart {
    Ready(Payload),
    Pending(PendingWait),
}

/// Point-in-time view of a tunnel, used for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct TunnelSnapshot {
    pub tunnel_id: String,
    pub target_info: TargetInfo,
    pub device_connected: bool,
    pub client_connected: bool,
}

#[derive(Debug, Default)]
struct Endpoint {
    queue: VecDeque<Payload>,
    waiter: Option<Waiter>,
    sink: Option<(u64, PushSink)>,
}

impl Endpoint {
    fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.waiter.is_none() && self.sink.is_none()
    }
}

#[derive(Debug)]
struct TunnelState {
    target_info: TargetInfo,
    device: Endpoint,
    client: Endpoint,
    closed: bool,
    next_ticket: u64,
}

impl TunnelState {
    fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        match side {
            Side::Device => &mut self.device,
            Side::Client => &mut self.client,
        }
    }

    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn withdraw(
        &mut self,
        side: Side,
        ticket: u64,
        rx: &mut oneshot::Receiver<Signal>,
    ) -> Withdrawal {
        let endpoint = self.endpoint_mut(side);
        if endpoint.waiter.as_ref().is_some_and(|w| w.ticket() == ticket) {
            endpoint.waiter = None;
            return Withdrawal::Cleared;
        }
        match rx.try_recv() {
            Ok(signal) => Withdrawal::Raced(signal),
            Err(_) => Withdrawal::Gone,
        }
    }
}

#[derive(Debug)]
pub struct Tunnel {
    id: String,
    state: Mutex<TunnelState>,
}

impl Tunnel {
    pub(crate) fn new(id: &str, target_info: TargetInfo) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(TunnelState {
                target_info,
                device: Endpoint::default(),
                client: Endpoint::default(),
                closed: false,
                next_ticket: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, TunnelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(&self) -> RelayError {
        RelayError::TunnelNotFound(self.id.clone())
    }

    pub fn target_info(&self) -> TargetInfo {
        self.lock().target_info.clone()
    }

    pub(crate) fn set_target_info(&self, target_info: TargetInfo) {
        self.lock().target_info = target_info;
    }

    /// Routes `payload` from side `from` towards the opposite side: to its
    /// live connection if one is attached, else to its pending waiter, else
    /// to the back of its queue.
    pub fn submit(&self, from: Side, payload: Payload) -> Result<Routed, RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.not_found());
        }
        let to = from.opposite();
        let endpoint = state.endpoint_mut(to);

        let mut payload = payload;
        if let Some((_, sink)) = &endpoint.sink {
            match sink.send(payload) {
                Ok(()) => {
                    debug!(tunnel_id = %self.id, to = %to, "Pushed payload");
                    return Ok(Routed::Pushed);
                }
                Err(mpsc::error::SendError(returned)) => {
                    endpoint.sink = None;
                    payload = returned;
                }
            }
        }

        if let Some(waiter) = endpoint.waiter.take() {
            match waiter.resolve(payload) {
                Ok(()) => {
                    debug!(tunnel_id = %self.id, to = %to, "Delivered payload to waiter");
                    return Ok(Routed::Delivered);
                }
                Err(returned) => payload = returned,
            }
        }

        endpoint.queue.push_back(payload);
        debug!(
            tunnel_id = %self.id,
            to = %to,
            queued = endpoint.queue.len(),
            "Queued payload"
        );
        Ok(Routed::Queued)
    }

    /// Takes the oldest queued payload for `side`, or parks a waiter for it.
    /// A waiter already parked on `side` is superseded.
    pub(crate) fn begin_wait(self: &Arc<Self>, side: Side) -> Result<WaitStart, RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.not_found());
        }
        let ticket = state.ticket();
        let endpoint = state.endpoint_mut(side);

        if let Some(payload) = endpoint.queue.pop_front() {
            return Ok(WaitStart::Ready(payload));
        }

        let (waiter, rx) = Waiter::new(ticket);
        if let Some(previous) = endpoint.waiter.replace(waiter) {
            debug!(tunnel_id = %self.id, side = %side, "Superseding pending waiter");
            previous.supersede();
        }
        Ok(WaitStart::Pending(PendingWait::new(
            Arc::clone(self),
            side,
            ticket,
            rx,
        )))
    }

    pub(crate) fn withdraw_waiter(
        &self,
        side: Side,
        ticket: u64,
        rx: &mut oneshot::Receiver<Signal>,
    ) -> Withdrawal {
        self.lock().withdraw(side, ticket, rx)
    }

    /// Withdraws a waiter whose caller went away. Data that reached it in
    /// the meantime is put back at the front of the queue.
    pub(crate) fn abandon_waiter(
        &self,
        side: Side,
        ticket: u64,
        rx: &mut oneshot::Receiver<Signal>,
    ) {
        let mut state = self.lock();
        if let Withdrawal::Raced(Signal::Data(payload)) = state.withdraw(side, ticket, rx) {
            if !state.closed {
                state.endpoint_mut(side).queue.push_front(payload);
            }
        }
    }

    /// Attaches a live connection to `side`, replacing any previous one, and
    /// flushes that side's queue into it. Returns the attachment ticket.
    pub(crate) fn attach(&self, side: Side, sink: PushSink) -> Result<u64, RelayError> {
        let mut state = self.lock();
        if state.closed {
            return Err(self.not_found());
        }
        let ticket = state.ticket();
        let endpoint = state.endpoint_mut(side);

        while let Some(payload) = endpoint.queue.pop_front() {
            if let Err(mpsc::error::SendError(payload)) = sink.send(payload) {
                endpoint.queue.push_front(payload);
                break;
            }
        }
        endpoint.sink = Some((ticket, sink));
        Ok(ticket)
    }

    pub(crate) fn is_attached(&self, side: Side, ticket: u64) -> bool {
        let mut state = self.lock();
        matches!(state.endpoint_mut(side).sink, Some((t, _)) if t == ticket)
    }

    /// Idle: nothing queued, nobody waiting, nothing attached, on either side.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.device.is_idle() && state.client.is_idle()
    }

    /// Closes the tunnel if it is idle, atomically with the check.
    pub(crate) fn close_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.device.is_idle() && state.client.is_idle() {
            state.closed = true;
            true
        } else {
            false
        }
    }

    /// Marks the tunnel closed and releases everything parked in it.
    /// Pending waiters wake up as cancelled; attached connections see their
    /// push channel close.
    pub(crate) fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        for side in [Side::Device, Side::Client] {
            let endpoint = state.endpoint_mut(side);
            endpoint.waiter = None;
            endpoint.sink = None;
            endpoint.queue.clear();
        }
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        let state = self.lock();
        TunnelSnapshot {
            tunnel_id: self.id.clone(),
            target_info: state.target_info.clone(),
            device_connected: !state.device.is_idle(),
            client_connected: !state.client.is_idle(),
        }
    }
}
