//! Completion queue worker
//!
//! Each event queue is drained by exactly one dedicated thread:
//!
//! ```text
//! loop {
//!     1. Block in transport.next(queue) until something happens
//!     2. Completion?  look up the handler named by the tag
//!                     advance(success, flags, outcome)
//!                     Done → remove it from the table (drops it)
//!     3. Shutdown?    every owed completion has been seen → exit
//! }
//! ```
//!
//! A panic escaping `advance` is contained here so the worker stays alive
//! for every other call on the queue; the offending handler is released.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, trace, warn};

use cqrpc_transport::{Completion, Event, QueueId, Transport};

use crate::handler::{Advance, HandlerTable};

/// Counters collected by a queue worker over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Completions taken off the queue.
    pub completions: u64,
    /// Handlers that reported `Done` and were dropped.
    pub handlers_released: u64,
    /// Completions whose tag named no live handler.
    pub orphaned: u64,
    /// Handlers that panicked inside `advance`.
    pub panicked: u64,
}

/// One event queue plus the thread draining it.
pub struct CompletionQueue {
    id: QueueId,
    worker: Option<JoinHandle<QueueStats>>,
}

impl CompletionQueue {
    pub(crate) fn spawn(
        id: QueueId,
        transport: Arc<dyn Transport>,
        handlers: Arc<HandlerTable>,
        thread_name: String,
        stack_size: Option<usize>,
    ) -> std::io::Result<Self> {
        let mut builder = thread::Builder::new().name(thread_name);
        if let Some(bytes) = stack_size {
            builder = builder.stack_size(bytes);
        }
        let worker = builder.spawn(move || queue_loop(transport, handlers, id))?;
        Ok(Self { id, worker: Some(worker) })
    }

    #[inline]
    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Wait for the worker to exit. The queue must already be shut down
    /// at the transport, otherwise this blocks forever.
    pub(crate) fn join(&mut self) -> QueueStats {
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or_else(|_| {
                error!(queue = %self.id, "completion queue worker panicked");
                QueueStats::default()
            }),
            None => QueueStats::default(),
        }
    }
}

fn queue_loop(transport: Arc<dyn Transport>, handlers: Arc<HandlerTable>, queue: QueueId) -> QueueStats {
    let mut stats = QueueStats::default();
    debug!(%queue, "completion queue worker started");

    loop {
        match transport.next(queue, None) {
            Event::Completion(completion) => {
                stats.completions += 1;
                dispatch(&handlers, completion, &mut stats);
            }
            Event::Timeout => continue,
            Event::Shutdown => break,
        }
    }

    debug!(
        %queue,
        completions = stats.completions,
        released = stats.handlers_released,
        "completion queue worker stopped"
    );
    stats
}

/// Route one completion to its handler.
pub(crate) fn dispatch(handlers: &HandlerTable, completion: Completion, stats: &mut QueueStats) {
    let id = completion.tag.handler();
    let flags = completion.tag.flags();

    let Some(handler) = handlers.get(id) else {
        stats.orphaned += 1;
        warn!(handler = %id, flags = flags.bits(), "completion for unknown handler");
        return;
    };

    trace!(handler = %id, flags = flags.bits(), success = completion.success, "dispatch");

    let verdict = catch_unwind(AssertUnwindSafe(|| {
        handler.advance(completion.success, flags, completion.outcome)
    }));
    drop(handler);

    match verdict {
        Ok(Advance::Continue) => {}
        Ok(Advance::Done) => {
            handlers.remove(id);
            stats.handlers_released += 1;
        }
        Err(_) => {
            stats.panicked += 1;
            error!(handler = %id, "completion handler panicked; releasing it");
            handlers.remove(id);
        }
    }
}
