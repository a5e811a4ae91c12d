//! Operation batches and the completions that report them.
//!
//! A [`Batch`] is a set of sub-operations submitted together and completed
//! together under one tag. Receive-type sub-operations fill the matching
//! field of the [`BatchResult`] delivered with the completion.

use std::time::Instant;

use bytes::Bytes;
use cqrpc_core::Status;

use crate::tag::CompletionTag;
use crate::transport::{CallHandle, MethodId};

/// One atomic sub-operation of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    SendHeader,
    SendMessage(Bytes),
    /// Initiator only: no more messages will be sent.
    HalfClose,
    /// Acceptor only: terminal status.
    SendStatus(Status),
    RecvHeader,
    /// Fills `BatchResult::message`; `None` means end of input.
    RecvMessage,
    /// Initiator only: fills `BatchResult::status`.
    RecvStatus,
    /// Acceptor only: fills `BatchResult::cancelled`.
    RecvClose,
}

impl Op {
    #[inline]
    pub fn is_send(&self) -> bool {
        matches!(self, Op::SendHeader | Op::SendMessage(_) | Op::HalfClose | Op::SendStatus(_))
    }
}

/// Sub-operations submitted and completed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<Op>,
}

impl Batch {
    /// Upper bound on sub-operations per batch (one of each kind).
    pub const MAX_OPS: usize = 8;

    pub fn new() -> Self {
        Self { ops: Vec::with_capacity(4) }
    }

    pub fn send_header(mut self) -> Self {
        self.ops.push(Op::SendHeader);
        self
    }

    pub fn send_message(mut self, payload: Bytes) -> Self {
        self.ops.push(Op::SendMessage(payload));
        self
    }

    pub fn half_close(mut self) -> Self {
        self.ops.push(Op::HalfClose);
        self
    }

    pub fn send_status(mut self, status: Status) -> Self {
        self.ops.push(Op::SendStatus(status));
        self
    }

    pub fn recv_header(mut self) -> Self {
        self.ops.push(Op::RecvHeader);
        self
    }

    pub fn recv_message(mut self) -> Self {
        self.ops.push(Op::RecvMessage);
        self
    }

    pub fn recv_status(mut self) -> Self {
        self.ops.push(Op::RecvStatus);
        self
    }

    pub fn recv_close(mut self) -> Self {
        self.ops.push(Op::RecvClose);
        self
    }

    #[inline]
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains_send_message(&self) -> bool {
        self.ops.iter().any(|op| matches!(op, Op::SendMessage(_)))
    }

    pub fn into_ops(self) -> Vec<Op> {
        self.ops
    }
}

/// Output of the receive sub-operations of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub header_received: bool,
    /// Filled by `RecvMessage`; `None` after end of input.
    pub message: Option<Bytes>,
    /// Filled by `RecvStatus`.
    pub status: Option<Status>,
    /// Filled by `RecvClose`.
    pub cancelled: bool,
}

/// A call handed to the acceptor side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptedCall {
    pub call: CallHandle,
    pub method: MethodId,
    pub deadline: Option<Instant>,
    /// First request message, when the method reads it with the accept.
    pub payload: Option<Bytes>,
}

/// What a completion carries besides success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Batch(BatchResult),
    Accepted(AcceptedCall),
    /// Accept or batch that failed without data.
    Empty,
}

impl Outcome {
    /// Batch result, or an empty one for non-batch outcomes.
    pub fn into_batch(self) -> BatchResult {
        match self {
            Outcome::Batch(result) => result,
            _ => BatchResult::default(),
        }
    }
}

/// A finished batch or accept as reported by a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub tag: CompletionTag,
    pub success: bool,
    pub outcome: Outcome,
}

/// Result of waiting on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Completion(Completion),
    /// The wait deadline passed with nothing to report.
    Timeout,
    /// The queue was shut down and fully drained.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_builder() {
        let b = Batch::new()
            .send_header()
            .send_message(Bytes::from_static(b"hi"))
            .half_close()
            .recv_header()
            .recv_message()
            .recv_status();
        assert_eq!(b.len(), 6);
        assert!(b.contains_send_message());
        assert!(b.ops()[0].is_send());
        assert!(!b.ops()[4].is_send());
        assert!(Batch::new().is_empty());
    }

    #[test]
    fn test_outcome_into_batch() {
        let r = BatchResult { header_received: true, ..Default::default() };
        assert!(Outcome::Batch(r).into_batch().header_received);
        assert_eq!(Outcome::Empty.into_batch(), BatchResult::default());
    }
}
