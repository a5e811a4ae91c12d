//! Single-in-flight send discipline for one call.
//!
//! ```text
//!           push            push (queued)         on_sent (more queued)
//!   Idle ──────────► Busy ◄──────────────► Busy ◄──────────────┐
//!    ▲                │                                         │
//!    └─── on_sent ────┘ (nothing queued, no close)              │
//!                     │                                         │
//!   close while Idle ─┴─ on_sent with close requested ──► Closed
//! ```
//!
//! At most one send batch is ever outstanding. Messages that become ready
//! while one is in flight wait in FIFO order and are released one by one
//! as each send completes. The close is released last, after every queued
//! message has gone out.

use std::collections::VecDeque;

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing in flight.
    Idle,
    /// One send batch in flight.
    Busy,
    /// The close has been released; nothing more will be sent.
    Closed,
}

/// What the owner must submit next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Next {
    Send(Bytes),
    Close,
    Wait,
}

#[derive(Debug)]
pub(crate) struct SendQueue {
    phase: Phase,
    pending: VecDeque<Bytes>,
    close_requested: bool,
}

impl SendQueue {
    /// Nothing in flight yet.
    pub(crate) fn new() -> Self {
        Self { phase: Phase::Idle, pending: VecDeque::new(), close_requested: false }
    }

    /// A header batch is already in flight; messages wait for its
    /// [`on_sent`](Self::on_sent).
    pub(crate) fn busy() -> Self {
        Self { phase: Phase::Busy, ..Self::new() }
    }

    /// Offer a message. Messages offered after `close` are dropped.
    pub(crate) fn push(&mut self, payload: Bytes) -> Next {
        if self.close_requested || self.phase == Phase::Closed {
            return Next::Wait;
        }
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Busy;
                Next::Send(payload)
            }
            _ => {
                self.pending.push_back(payload);
                Next::Wait
            }
        }
    }

    /// Ask for the close once everything queued has gone out.
    pub(crate) fn close(&mut self) -> Next {
        if self.close_requested {
            return Next::Wait;
        }
        self.close_requested = true;
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Closed;
                Next::Close
            }
            _ => Next::Wait,
        }
    }

    /// The in-flight send finished; release the next one.
    pub(crate) fn on_sent(&mut self) -> Next {
        if self.phase != Phase::Busy {
            return Next::Wait;
        }
        if let Some(payload) = self.pending.pop_front() {
            return Next::Send(payload);
        }
        if self.close_requested {
            self.phase = Phase::Closed;
            Next::Close
        } else {
            self.phase = Phase::Idle;
            Next::Wait
        }
    }

    /// The close has been released.
    pub(crate) fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Messages waiting behind the in-flight send.
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.pending.len()
    }
}
