//! # Waiters
//!
//! A waiter is a party blocked in `await_next` wanting the next payload for
//! one side of a tunnel. Each endpoint slot holds at most one [`Waiter`]
//! (the sending half); the blocked caller holds the matching
//! [`PendingWait`] (the receiving half plus its deadline).
//!
//! Every waiter terminates exactly once, as one of:
//! - **delivered**: a `submit` on the opposite side handed it a payload,
//! - **timed out**: the deadline elapsed with nothing to deliver,
//! - **cancelled**: a newer poll superseded it, the tunnel was removed,
//!   the caller's cancellation token fired, or the caller went away.
//!
//! The slot is cleared under the tunnel lock on every path, so a waiter is
//! never resolved twice and no timer outlives it: the deadline lives inside
//! the waiting future and is dropped with it.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::Payload;
use crate::tunnel::{Side, Tunnel};

/// What travels from the slot to the blocked caller.
#[derive(Debug)]
pub(crate) enum Signal {
    Data(Payload),
    Superseded,
}

/// How a wait ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    /// A payload arrived (either queued already or handed over directly).
    Delivered(Payload),
    /// Nothing arrived before the deadline. Not an error.
    TimedOut,
    /// The wait ended without a result.
    Cancelled(CancelReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer `await_next` for the same side replaced this waiter.
    Superseded,
    /// The tunnel was removed while waiting.
    TunnelClosed,
    /// The caller's cancellation token fired.
    Aborted,
}

/// Sending half, parked in an endpoint slot.
#[derive(Debug)]
pub(crate) struct Waiter {
    ticket: u64,
    tx: oneshot::Sender<Signal>,
}

impl Waiter {
    pub(crate) fn new(ticket: u64) -> (Self, oneshot::Receiver<Signal>) {
        let (tx, rx) = oneshot::channel();
        (Self { ticket, tx }, rx)
    }

    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Hands `payload` to the blocked caller. Gives the payload back if the
    /// caller has already gone away.
    pub(crate) fn resolve(self, payload: Payload) -> Result<(), Payload> {
        self.tx
            .send(Signal::Data(payload))
            .map_err(|returned| match returned {
                Signal::Data(payload) => payload,
                Signal::Superseded => Payload::Null,
            })
    }

    pub(crate) fn supersede(self) {
        let _ = self.tx.send(Signal::Superseded);
    }
}

/// Result of pulling a waiter back out of its slot.
#[derive(Debug)]
pub(crate) enum Withdrawal {
    /// The slot still held this waiter and is now empty.
    Cleared,
    /// Something reached the waiter before it could be withdrawn.
    Raced(Signal),
    /// The waiter was dropped without a signal: the tunnel was removed.
    Gone,
}

/// Receiving half held by a caller blocked in `await_next`.
///
/// Dropping a `PendingWait` before it settles (the HTTP request went away,
/// the task was aborted) releases the slot immediately. A payload that was
/// handed over in that same instant goes back to the front of the queue.
pub struct PendingWait {
    tunnel: Arc<Tunnel>,
    side: Side,
    ticket: u64,
    rx: oneshot::Receiver<Signal>,
    settled: bool,
}

enum Wake {
    Signal(Result<Signal, oneshot::error::RecvError>),
    Deadline,
    Aborted,
}

impl PendingWait {
    pub(crate) fn new(
        tunnel: Arc<Tunnel>,
        side: Side,
        ticket: u64,
        rx: oneshot::Receiver<Signal>,
    ) -> Self {
        Self {
            tunnel,
            side,
            ticket,
            rx,
            settled: false,
        }
    }

    /// Suspends until data arrives, `deadline` passes, or `cancel` fires.
    pub async fn wait(mut self, deadline: Instant, cancel: &CancellationToken) -> WaitOutcome {
        let wake = tokio::select! {
            biased;
            signal = &mut self.rx => Wake::Signal(signal),
            _ = cancel.cancelled() => Wake::Aborted,
            _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
        };
        self.settled = true;
        let timed_out = matches!(wake, Wake::Deadline);

        let outcome = match wake {
            Wake::Signal(Ok(signal)) => outcome_of(signal),
            Wake::Signal(Err(_)) => WaitOutcome::Cancelled(CancelReason::TunnelClosed),
            Wake::Deadline | Wake::Aborted => {
                match self.tunnel.withdraw_waiter(self.side, self.ticket, &mut self.rx) {
                    Withdrawal::Cleared if timed_out => WaitOutcome::TimedOut,
                    Withdrawal::Cleared => WaitOutcome::Cancelled(CancelReason::Aborted),
                    Withdrawal::Raced(signal) => outcome_of(signal),
                    Withdrawal::Gone => WaitOutcome::Cancelled(CancelReason::TunnelClosed),
                }
            }
        };

        debug!(
            tunnel_id = %self.tunnel.id(),
            side = %self.side,
            outcome = ?outcome,
            "Wait settled"
        );
        outcome
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.settled {
            self.tunnel.abandon_waiter(self.side, self.ticket, &mut self.rx);
        }
    }
}

fn outcome_of(signal: Signal) -> WaitOutcome {
    match signal {
        Signal::Data(payload) => WaitOutcome::Delivered(payload),
        Signal::Superseded => WaitOutcome::Cancelled(CancelReason::Superseded),
    }
}
