//! Acceptor: keeps one "accept next call" outstanding per method per queue.
//!
//! On every accepted call the listener re-arms first and only then hands
//! the call to the method's dispatcher, so the method is never without an
//! outstanding accept. A failed accept (queue or server shut down) or a
//! refused re-arm ends the listener.

use std::sync::Arc;

use tracing::{debug, trace};

use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{
    AcceptedCall, CompletionTag, HandlerId, MethodId, Outcome, QueueId, TagFlags, TransportError,
};

/// Starts the state machine for one accepted call.
pub(crate) type Dispatch = Arc<dyn Fn(&EngineHandle, AcceptedCall) + Send + Sync>;

pub(crate) struct Listener {
    engine: EngineHandle,
    id: HandlerId,
    method: MethodId,
    path: Arc<str>,
    queue: QueueId,
    dispatch: Dispatch,
}

impl Listener {
    pub(crate) fn new(
        engine: &EngineHandle,
        id: HandlerId,
        method: MethodId,
        path: Arc<str>,
        queue: QueueId,
        dispatch: Dispatch,
    ) -> Self {
        Self { engine: engine.clone(), id, method, path, queue, dispatch }
    }

    pub(crate) fn id(&self) -> HandlerId {
        self.id
    }

    /// Request the next call.
    pub(crate) fn arm(&self) -> Result<(), TransportError> {
        let tag = CompletionTag::new(self.id, TagFlags::NONE);
        self.engine.transport().request_call(self.method, self.queue, tag)
    }
}

impl CompletionHandler for Listener {
    fn advance(&self, success: bool, _flags: TagFlags, outcome: Outcome) -> Advance {
        let accepted = match outcome {
            Outcome::Accepted(accepted) if success => accepted,
            _ => {
                debug!(method = %self.path, queue = %self.queue, "listener stopped");
                return Advance::Done;
            }
        };

        let verdict = match self.arm() {
            Ok(()) => {
                trace!(method = %self.path, queue = %self.queue, "listener re-armed");
                Advance::Continue
            }
            Err(err) => {
                debug!(method = %self.path, queue = %self.queue, %err, "listener not re-armed");
                Advance::Done
            }
        };

        (self.dispatch)(&self.engine, accepted);
        verdict
    }
}
