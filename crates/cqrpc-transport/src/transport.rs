//! The transport capability trait.
//!
//! # Implementors
//!
//! - `cqrpc_loopback::Loopback`: in-process peers sharing one address space.
//!   Calls, queues and deadlines are simulated in memory.
//!
//! A network transport would implement the same trait on top of its own
//! connection management and framing.

use std::time::Instant;

use crate::error::Result;
use crate::op::{Batch, Event};
use crate::tag::CompletionTag;

/// Opaque reference to one transport-level call. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CallHandle(pub u64);

/// Identity of an event queue owned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct QueueId(pub u32);

impl QueueId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cq{}", self.0)
    }
}

/// Server-side registration of one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MethodId(pub u32);

/// Whether an accept also reads the first request message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadHandling {
    /// The acceptor issues its own receives.
    None,
    /// The accept completes once the first message (or half-close) is in,
    /// and carries it in `AcceptedCall::payload`.
    ReadInitial,
}

/// Operations the RPC core consumes from its transport.
///
/// **Contract:** every method except [`next`](Self::next) returns without
/// blocking. Completions for a batch or accept are reported exactly once,
/// on the queue the call (or accept) is bound to, carrying the tag given at
/// submission. A submission that returns `Err` produces no completion.
pub trait Transport: Send + Sync {
    // ── Event queues ──────────────────────────────────────────────────

    fn create_queue(&self) -> QueueId;

    /// Wait for the next completion on `queue`, until `deadline` if given.
    ///
    /// Returns [`Event::Shutdown`] once the queue has been shut down and
    /// every completion already owed to it has been returned.
    fn next(&self, queue: QueueId, deadline: Option<Instant>) -> Event;

    /// Begin shutting `queue` down. Outstanding accepts on it complete with
    /// `success = false`; new accepts are refused.
    fn shutdown_queue(&self, queue: QueueId);

    // ── Acceptor side ─────────────────────────────────────────────────

    /// Register a method path (`/service/method`) for accepting calls.
    ///
    /// A path is taken while its registration is live; once
    /// [`shutdown_methods`](Self::shutdown_methods) tore it down the path
    /// can be registered again under a new id.
    fn register_method(&self, path: &str, payload: PayloadHandling) -> Result<MethodId>;

    /// Ask for the next incoming call on `method`. The completion arrives on
    /// `queue` with [`Outcome::Accepted`](crate::Outcome::Accepted), and every
    /// later batch of that call completes on the same queue.
    fn request_call(&self, method: MethodId, queue: QueueId, tag: CompletionTag) -> Result<()>;

    /// Tear down the given registrations. Their outstanding accepts fail,
    /// their calls not yet finished end with `Unavailable`, and later calls
    /// to their paths are refused with `Unavailable` until the path is
    /// registered again. Other registrations are untouched. Idempotent.
    fn shutdown_methods(&self, methods: &[MethodId]);

    // ── Initiator side ────────────────────────────────────────────────

    /// Create a call to `path`. Nothing is sent until a batch carrying
    /// `SendHeader` is started. Completions go to `queue`.
    fn create_call(&self, path: &str, deadline: Option<Instant>, queue: QueueId) -> Result<CallHandle>;

    // ── Both sides ────────────────────────────────────────────────────

    fn start_batch(&self, call: CallHandle, batch: Batch, tag: CompletionTag) -> Result<()>;

    /// Drop this side's reference to the call. Called once the owning state
    /// machine is terminal and has no batch outstanding.
    fn release_call(&self, call: CallHandle);
}
