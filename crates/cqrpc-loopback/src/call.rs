//! One in-memory call shared by its two sides.
//!
//! ```text
//!   initiator ──SendMessage──► to_server ──RecvMessage──► acceptor
//!   initiator ◄──RecvMessage── to_client ◄──SendMessage── acceptor
//!   initiator ◄──RecvStatus─── status    ◄──SendStatus─── acceptor
//! ```
//!
//! Send sub-operations take effect when the batch is started. Receive
//! sub-operations wait inside a `PendingBatch` until the state can satisfy
//! them; a batch completes once all of its receives are satisfied.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use cqrpc_core::Status;
use cqrpc_transport::{
    AcceptedCall, BatchResult, CallHandle, Completion, CompletionTag, MethodId, Op, Outcome,
    QueueId, TransportError,
};

/// Which end of the call a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Server,
}

pub(crate) fn handle(call: u64, side: Side) -> CallHandle {
    CallHandle((call << 1) | matches!(side, Side::Server) as u64)
}

pub(crate) fn split(handle: CallHandle) -> (u64, Side) {
    let side = if handle.0 & 1 == 1 { Side::Server } else { Side::Client };
    (handle.0 >> 1, side)
}

/// An accept matched to this call, waiting to be reported.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Accept {
    pub method: MethodId,
    pub queue: QueueId,
    pub tag: CompletionTag,
    pub read_payload: bool,
}

#[derive(Debug)]
struct PendingBatch {
    tag: CompletionTag,
    /// Receive sub-operations not yet satisfied, in submission order.
    recvs: VecDeque<Op>,
    result: BatchResult,
    failed: bool,
}

/// Completions produced by a state change, with the queue each goes to.
pub(crate) type Posts = Vec<(QueueId, Completion)>;

#[derive(Debug)]
pub(crate) struct CallState {
    pub id: u64,
    pub path: String,
    pub deadline: Option<Instant>,
    pub client_queue: QueueId,
    pub server_queue: Option<QueueId>,
    /// Registration the call was matched to.
    pub method: Option<MethodId>,
    pub accept: Option<Accept>,
    pub server_attached: bool,
    /// Initiator sent its header; the call has been routed.
    pub started: bool,
    to_server: VecDeque<Bytes>,
    to_client: VecDeque<Bytes>,
    client_half_closed: bool,
    server_header_sent: bool,
    status: Option<Status>,
    cancelled: bool,
    client_pending: Vec<PendingBatch>,
    server_pending: Vec<PendingBatch>,
    pub client_released: bool,
    pub server_released: bool,
}

impl CallState {
    pub(crate) fn new(id: u64, path: &str, deadline: Option<Instant>, client_queue: QueueId) -> Self {
        Self {
            id,
            path: path.to_string(),
            deadline,
            client_queue,
            server_queue: None,
            method: None,
            accept: None,
            server_attached: false,
            started: false,
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            client_half_closed: false,
            server_header_sent: false,
            status: None,
            cancelled: false,
            client_pending: Vec::new(),
            server_pending: Vec::new(),
            client_released: false,
            server_released: false,
        }
    }

    #[inline]
    pub(crate) fn is_terminated(&self) -> bool {
        self.status.is_some()
    }

    #[inline]
    pub(crate) fn has_pending(&self) -> bool {
        !self.client_pending.is_empty() || !self.server_pending.is_empty() || self.accept.is_some()
    }

    /// Both sides are done with the call.
    pub(crate) fn is_reclaimable(&self) -> bool {
        self.client_released && (self.server_released || !self.server_attached) && self.accept.is_none()
    }

    /// Set the terminal status without a server sending it.
    pub(crate) fn cancel(&mut self, status: Status) {
        if self.status.is_none() {
            self.status = Some(status);
            self.cancelled = true;
        }
    }

    /// Set the terminal status on behalf of the routing layer (unknown
    /// method, server gone) without marking the call cancelled.
    pub(crate) fn reject(&mut self, status: Status) {
        if self.status.is_none() {
            self.status = Some(status);
        }
    }

    fn validate(side: Side, ops: &[Op]) -> Result<(), TransportError> {
        if ops.is_empty() {
            return Err(TransportError::InvalidBatch("empty batch"));
        }
        if ops.len() > cqrpc_transport::Batch::MAX_OPS {
            return Err(TransportError::InvalidBatch("too many operations"));
        }
        let misplaced = ops.iter().any(|op| match side {
            Side::Client => matches!(op, Op::SendStatus(_) | Op::RecvClose),
            Side::Server => matches!(op, Op::HalfClose | Op::RecvStatus),
        });
        if misplaced {
            return Err(TransportError::InvalidBatch("operation not valid on this side"));
        }
        Ok(())
    }

    /// Apply the send sub-operations of a new batch and queue its receives.
    ///
    /// Returns whether the initiator header went out with this batch, so the
    /// caller can route the call.
    pub(crate) fn start_batch(&mut self, side: Side, ops: Vec<Op>, tag: CompletionTag) -> Result<bool, TransportError> {
        Self::validate(side, &ops)?;
        if side == Side::Server && self.status.is_some() && !self.cancelled {
            return Err(TransportError::CallTerminated);
        }

        let mut routed = false;
        let mut failed = false;
        let mut recvs = VecDeque::new();

        for op in ops {
            match (side, op) {
                (Side::Client, Op::SendHeader) => {
                    if !self.started {
                        self.started = true;
                        routed = true;
                    }
                }
                (Side::Client, Op::SendMessage(payload)) => {
                    if self.status.is_some() || self.client_half_closed {
                        failed = true;
                    } else {
                        self.to_server.push_back(payload);
                    }
                }
                (Side::Client, Op::HalfClose) => self.client_half_closed = true,
                (Side::Server, Op::SendHeader) => self.server_header_sent = true,
                (Side::Server, Op::SendMessage(payload)) => {
                    if self.status.is_some() {
                        failed = true;
                    } else {
                        self.to_client.push_back(payload);
                    }
                }
                (Side::Server, Op::SendStatus(status)) => {
                    if self.status.is_some() {
                        failed = true;
                    } else {
                        self.status = Some(status);
                    }
                }
                (_, recv) => recvs.push_back(recv),
            }
        }

        let batch = PendingBatch { tag, recvs, result: BatchResult::default(), failed };
        match side {
            Side::Client => self.client_pending.push(batch),
            Side::Server => self.server_pending.push(batch),
        }
        Ok(routed)
    }

    /// Complete whatever can complete now.
    pub(crate) fn progress(&mut self) -> Posts {
        let mut posts = Posts::new();

        if let Some(accept) = self.accept {
            if let Some(completion) = self.try_accept(accept) {
                posts.push((accept.queue, completion));
            }
        }

        let mut pending = std::mem::take(&mut self.client_pending);
        pending.retain_mut(|batch| match self.satisfy(Side::Client, batch) {
            true => {
                posts.push((self.client_queue, finish(batch)));
                false
            }
            false => true,
        });
        self.client_pending = pending;

        if let Some(queue) = self.server_queue {
            let mut pending = std::mem::take(&mut self.server_pending);
            pending.retain_mut(|batch| match self.satisfy(Side::Server, batch) {
                true => {
                    posts.push((queue, finish(batch)));
                    false
                }
                false => true,
            });
            self.server_pending = pending;
        }

        posts
    }

    fn try_accept(&mut self, accept: Accept) -> Option<Completion> {
        let payload = if accept.read_payload {
            match self.to_server.pop_front() {
                Some(payload) => Some(payload),
                None if self.client_half_closed || self.status.is_some() => None,
                None => return None,
            }
        } else {
            None
        };

        self.accept = None;
        self.server_attached = true;
        self.server_queue = Some(accept.queue);
        Some(Completion {
            tag: accept.tag,
            success: true,
            outcome: Outcome::Accepted(AcceptedCall {
                call: handle(self.id, Side::Server),
                method: accept.method,
                deadline: self.deadline,
                payload,
            }),
        })
    }

    /// Satisfy receives in order; true once none remain.
    fn satisfy(&mut self, side: Side, batch: &mut PendingBatch) -> bool {
        while let Some(op) = batch.recvs.front() {
            let ready = match (side, op) {
                (Side::Client, Op::RecvHeader) => {
                    if self.server_header_sent || self.status.is_some() {
                        batch.result.header_received = self.server_header_sent;
                        true
                    } else {
                        false
                    }
                }
                (Side::Client, Op::RecvMessage) => match self.to_client.pop_front() {
                    Some(payload) => {
                        batch.result.message = Some(payload);
                        true
                    }
                    None => self.status.is_some(),
                },
                (Side::Client, Op::RecvStatus) => match &self.status {
                    Some(status) => {
                        batch.result.status = Some(status.clone());
                        true
                    }
                    None => false,
                },
                (Side::Server, Op::RecvHeader) => {
                    batch.result.header_received = true;
                    true
                }
                (Side::Server, Op::RecvMessage) => match self.to_server.pop_front() {
                    Some(payload) => {
                        batch.result.message = Some(payload);
                        true
                    }
                    None if self.cancelled => {
                        batch.failed = true;
                        true
                    }
                    None => self.client_half_closed || self.status.is_some(),
                },
                (Side::Server, Op::RecvClose) => {
                    if self.status.is_some() {
                        batch.result.cancelled = self.cancelled;
                        true
                    } else {
                        false
                    }
                }
                _ => {
                    batch.failed = true;
                    true
                }
            };
            if !ready {
                return false;
            }
            batch.recvs.pop_front();
        }
        true
    }
}

fn finish(batch: &mut PendingBatch) -> Completion {
    Completion {
        tag: batch.tag,
        success: !batch.failed,
        outcome: Outcome::Batch(std::mem::take(&mut batch.result)),
    }
}
