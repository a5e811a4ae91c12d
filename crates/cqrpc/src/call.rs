//! Pieces shared by every call state machine.

use bytes::Bytes;

use cqrpc_core::{Expected, RpcError, StreamPromise};
use cqrpc_engine::EngineHandle;
use cqrpc_transport::{Batch, BatchResult, CallHandle, CompletionTag, HandlerId, Message, TagFlags};

// Tag flags naming which batch of a call completed.
pub(crate) const START: TagFlags = TagFlags::bit(0);
pub(crate) const WRITE: TagFlags = TagFlags::bit(1);
pub(crate) const READ: TagFlags = TagFlags::bit(2);
pub(crate) const FINISH: TagFlags = TagFlags::bit(3);

/// The transport call and handler identity one state machine drives.
pub(crate) struct CallCtx {
    engine: EngineHandle,
    id: HandlerId,
    call: CallHandle,
}

impl CallCtx {
    pub(crate) fn new(engine: &EngineHandle, id: HandlerId, call: CallHandle) -> Self {
        Self { engine: engine.clone(), id, call }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    /// Submit a batch tagged for this handler.
    pub(crate) fn start(&self, batch: Batch, flags: TagFlags) -> Expected<()> {
        self.engine
            .transport()
            .start_batch(self.call, batch, CompletionTag::new(self.id, flags))
            .map_err(RpcError::from)
    }

    pub(crate) fn release_call(&self) {
        self.engine.transport().release_call(self.call);
    }

    /// Release the call and drop the handler from outside a completion.
    /// Only valid once no batch of this call is outstanding.
    pub(crate) fn retire(&self) {
        self.release_call();
        self.engine.release(self.id);
    }
}

/// Batches in flight for one call and whether it reached its terminal state.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    outstanding: usize,
    finished: bool,
    retired: bool,
}

impl Ledger {
    pub(crate) fn submitted(&mut self) {
        self.outstanding += 1;
    }

    pub(crate) fn completed(&mut self) {
        debug_assert!(self.outstanding > 0, "completion without an outstanding batch");
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub(crate) fn finish(&mut self) {
        self.finished = true;
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// True exactly once: the call is finished and nothing is in flight.
    pub(crate) fn take_retirement(&mut self) -> bool {
        if self.finished && self.outstanding == 0 && !self.retired {
            self.retired = true;
            true
        } else {
            false
        }
    }
}

/// Type-erased receiver for decoded messages of one call.
pub(crate) trait Inbox: Send + Sync {
    /// Decode one payload and deliver it. Returns the decode error as-is.
    fn deliver(&self, payload: Bytes) -> Expected<()>;

    fn close(&self, result: Expected<()>);
}

impl<M: Message> Inbox for StreamPromise<M> {
    fn deliver(&self, payload: Bytes) -> Expected<()> {
        self.push(M::decode(payload)?);
        Ok(())
    }

    fn close(&self, result: Expected<()>) {
        self.finish(result);
    }
}

/// Terminal status of a finished batch as a result.
pub(crate) fn terminal(result: &BatchResult) -> Expected<()> {
    match &result.status {
        Some(status) => status.clone().into_result(),
        None => Err(RpcError::internal("call ended without a status")),
    }
}

pub(crate) fn reply_decode_error(err: RpcError) -> RpcError {
    RpcError::internal(format!("failed to decode reply: {}", err.message()))
}

pub(crate) fn request_decode_error(err: RpcError) -> RpcError {
    RpcError::invalid_argument(format!("failed to decode request: {}", err.message()))
}
