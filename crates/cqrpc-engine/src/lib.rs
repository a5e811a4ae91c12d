//! # cqrpc-engine - The Completion Engine
//!
//! Owns N event queues, each drained by a dedicated worker thread, and the
//! table of live completion handlers those workers dispatch to.
//!
//! ```text
//!   Engine ──create_queue × N──► Transport
//!     │
//!     ├── cqrpc-cq-0 ──next(cq0)──► dispatch(tag) ──► handler.advance()
//!     ├── cqrpc-cq-1 ──next(cq1)──► dispatch(tag) ──► handler.advance()
//!     └── HandlerTable (slot ownership of every live handler)
//! ```
//!
//! Handlers never hold the [`Engine`] itself, only an [`EngineHandle`]
//! (transport + table + queue list), so dropping the last `Engine` shuts
//! the queues down and joins the workers.

pub mod config;
pub mod handler;
pub mod queue;

pub use config::EngineConfig;
pub use handler::{Advance, CompletionHandler, HandlerTable};
pub use queue::{CompletionQueue, QueueStats};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use cqrpc_transport::{HandlerId, QueueId, Transport};

/// Failure to start an engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid engine config: {0}")]
    Config(&'static str),

    #[error("failed to spawn completion queue worker: {0}")]
    Spawn(#[from] std::io::Error),
}

// ============================================================================
// EngineHandle
// ============================================================================

/// Cheap, cloneable access to the transport and the handler table.
///
/// This is what state machines keep: enough to submit batches, register
/// further handlers and pick a queue.
#[derive(Clone)]
pub struct EngineHandle {
    transport: Arc<dyn Transport>,
    handlers: Arc<HandlerTable>,
    queues: Arc<[QueueId]>,
    cursor: Arc<AtomicUsize>,
}

impl EngineHandle {
    #[inline]
    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    #[inline]
    pub fn queues(&self) -> &[QueueId] {
        &self.queues
    }

    /// Queues in round-robin order, for calls with no explicit queue.
    pub fn next_queue(&self) -> QueueId {
        let n = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.queues[n % self.queues.len()]
    }

    /// Register a handler built from its own id. The table keeps it alive
    /// until it reports `Done` or is [`release`](Self::release)d.
    pub fn spawn<H, F>(&self, build: F) -> Arc<H>
    where
        H: CompletionHandler + 'static,
        F: FnOnce(HandlerId) -> H,
    {
        let id = self.handlers.reserve();
        let handler = Arc::new(build(id));
        self.handlers.install(id, handler.clone());
        handler
    }

    /// Drop a handler that will never see a completion, e.g. because its
    /// first submission failed.
    pub fn release(&self, id: HandlerId) {
        self.handlers.remove(id);
    }

    /// Number of handlers currently registered.
    pub fn live_handlers(&self) -> usize {
        self.handlers.len()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The running completion engine.
pub struct Engine {
    handle: EngineHandle,
    queues: Mutex<Vec<CompletionQueue>>,
    shut_down: AtomicBool,
}

impl Engine {
    /// Create `config.num_queues` queues on `transport` and start one
    /// worker per queue.
    pub fn start(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Arc<Engine>, EngineError> {
        config.validate().map_err(EngineError::Config)?;

        let handlers = Arc::new(HandlerTable::new());
        let mut queues = Vec::with_capacity(config.num_queues);
        for i in 0..config.num_queues {
            let id = transport.create_queue();
            let name = format!("{}-{}", config.thread_name_prefix, i);
            match CompletionQueue::spawn(id, transport.clone(), handlers.clone(), name, config.stack_size) {
                Ok(queue) => queues.push(queue),
                Err(err) => {
                    transport.shutdown_queue(id);
                    for mut queue in queues {
                        transport.shutdown_queue(queue.id());
                        queue.join();
                    }
                    return Err(EngineError::Spawn(err));
                }
            }
        }

        let ids: Arc<[QueueId]> = queues.iter().map(CompletionQueue::id).collect();
        info!(queues = ids.len(), "completion engine started");

        Ok(Arc::new(Engine {
            handle: EngineHandle {
                transport,
                handlers,
                queues: ids,
                cursor: Arc::new(AtomicUsize::new(0)),
            },
            queues: Mutex::new(queues),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Start with [`EngineConfig::from_env`].
    pub fn from_env(transport: Arc<dyn Transport>) -> Result<Arc<Engine>, EngineError> {
        Self::start(transport, EngineConfig::from_env())
    }

    #[inline]
    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    #[inline]
    pub fn queues(&self) -> &[QueueId] {
        self.handle.queues()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Shut every queue down, wait for the workers to drain and exit, then
    /// drop whatever handlers are still registered. Idempotent; later calls
    /// return no stats.
    pub fn shutdown(&self) -> Vec<QueueStats> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut queues = self.queues.lock();
        for queue in queues.iter() {
            self.handle.transport.shutdown_queue(queue.id());
        }
        let stats: Vec<QueueStats> = queues.iter_mut().map(CompletionQueue::join).collect();
        queues.clear();
        drop(queues);

        self.handle.handlers.clear();
        info!(
            completions = stats.iter().map(|s| s.completions).sum::<u64>(),
            "completion engine stopped"
        );
        stats
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::{promise, Promise};
    use cqrpc_loopback::Loopback;
    use cqrpc_transport::{Batch, CompletionTag, Outcome, TagFlags};
    use std::time::{Duration, Instant};

    /// Resolves a promise with the success flag of its first completion.
    struct Once {
        id: HandlerId,
        promise: Mutex<Option<Promise<bool>>>,
    }

    impl CompletionHandler for Once {
        fn advance(&self, success: bool, _flags: TagFlags, _outcome: Outcome) -> Advance {
            if let Some(p) = self.promise.lock().take() {
                p.set_value(success);
            }
            Advance::Done
        }
    }

    fn engine(queues: usize) -> Arc<Engine> {
        let transport: Arc<dyn Transport> = Arc::new(Loopback::new());
        Engine::start(transport, EngineConfig::new().num_queues(queues)).unwrap()
    }

    #[test]
    fn test_start_and_shutdown() {
        let engine = engine(3);
        assert_eq!(engine.queues().len(), 3);
        let stats = engine.shutdown();
        assert_eq!(stats.len(), 3);
        assert!(engine.is_shut_down());
        assert!(engine.shutdown().is_empty());
    }

    #[test]
    fn test_invalid_config() {
        let transport: Arc<dyn Transport> = Arc::new(Loopback::new());
        let err = Engine::start(transport, EngineConfig::new().num_queues(0)).err().unwrap();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_round_robin_queues() {
        let engine = engine(2);
        let h = engine.handle();
        let a = h.next_queue();
        let b = h.next_queue();
        let c = h.next_queue();
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_completion_reaches_handler_and_releases_it() {
        let engine = engine(1);
        let h = engine.handle().clone();
        let (p, seen) = promise();
        let handler = h.spawn(|id| Once { id, promise: Mutex::new(Some(p)) });
        let tag = CompletionTag::new(handler.id, TagFlags::NONE);
        drop(handler);
        assert_eq!(h.live_handlers(), 1);

        // A call to an unregistered method still ends with a status.
        let deadline = Some(Instant::now() + Duration::from_secs(5));
        let call = h.transport().create_call("/nobody/home", deadline, h.next_queue()).unwrap();
        h.transport()
            .start_batch(call, Batch::new().send_header().half_close().recv_status(), tag)
            .unwrap();
        assert_eq!(seen.get(), Ok(true));

        engine.shutdown();
        assert_eq!(h.live_handlers(), 0);
    }

    #[test]
    fn test_release_unused_handler() {
        let engine = engine(1);
        let h = engine.handle();
        let handler = h.spawn(|id| Once { id, promise: Mutex::new(None) });
        h.release(handler.id);
        assert_eq!(h.live_handlers(), 0);
    }
}
