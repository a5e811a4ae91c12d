//! Completion handlers and the table that owns them.
//!
//! A handler is registered once, gets a [`HandlerId`], and tags every batch
//! it submits with that id. The table holds the only long-lived strong
//! reference; when `advance` reports [`Advance::Done`] the dispatcher
//! removes the entry and the handler is dropped.
//!
//! Slots are recycled LIFO. Each registration stamps a fresh generation
//! into the id, so a stale tag never reaches the slot's next occupant.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;

use cqrpc_transport::{HandlerId, Outcome, TagFlags};

/// What the dispatcher does with a handler after `advance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Still has work outstanding; keep it registered.
    Continue,
    /// Terminal and nothing outstanding; remove and drop it.
    Done,
}

/// Reacts to the completion of one of its batches (or accepts).
///
/// # Implementors
///
/// - call state machines (unary, server-streaming, client-streaming and
///   bidirectional, on both sides)
/// - the acceptor that keeps one accept outstanding per method and queue
///
/// **Contract:** `advance` must not block and must not panic. Every failure
/// is routed into the call's future or stream, or into the status sent to
/// the peer. It may run on any queue worker, possibly concurrently with
/// another completion of the same handler, so state sits behind the
/// handler's own lock.
pub trait CompletionHandler: Send + Sync {
    fn advance(&self, success: bool, flags: TagFlags, outcome: Outcome) -> Advance;
}

struct Entry {
    generation: u32,
    handler: Option<Arc<dyn CompletionHandler>>,
}

/// Live handlers keyed by slot.
///
/// One mutex guards the whole slab. It is held only to insert, remove or
/// clone a handler's `Arc` out; `advance` always runs after the lock is
/// dropped. Dispatch still contends on this lock, so it is not lock-free.
pub struct HandlerTable {
    slots: Mutex<Slab<Entry>>,
    next_generation: AtomicU32,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slab::with_capacity(64)),
            next_generation: AtomicU32::new(1),
        }
    }

    /// Claim a slot; the handler is installed later with [`install`](Self::install).
    pub fn reserve(&self) -> HandlerId {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed)
            & HandlerId::GENERATION_MASK;
        let mut slots = self.slots.lock();
        let key = slots.insert(Entry { generation, handler: None });
        HandlerId::new(key as u32, generation)
    }

    /// Put a handler into a reserved slot. Returns false if the slot is no
    /// longer reserved for `id`.
    pub fn install(&self, id: HandlerId, handler: Arc<dyn CompletionHandler>) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(id.slot() as usize) {
            Some(entry) if entry.generation == id.generation() && entry.handler.is_none() => {
                entry.handler = Some(handler);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: HandlerId) -> Option<Arc<dyn CompletionHandler>> {
        let slots = self.slots.lock();
        slots
            .get(id.slot() as usize)
            .filter(|entry| entry.generation == id.generation())
            .and_then(|entry| entry.handler.clone())
    }

    /// Release the slot for `id`. The handler is dropped outside the lock.
    pub fn remove(&self, id: HandlerId) -> bool {
        let removed = {
            let mut slots = self.slots.lock();
            let key = id.slot() as usize;
            let live = slots.get(key).is_some_and(|entry| entry.generation == id.generation());
            if live {
                Some(slots.remove(key))
            } else {
                None
            }
        };
        removed.is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every handler. Used once all queue workers have exited.
    pub fn clear(&self) {
        let drained: Vec<Entry> = self.slots.lock().drain().collect();
        drop(drained);
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}
