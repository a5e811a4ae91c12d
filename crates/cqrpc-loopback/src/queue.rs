//! Event queue with blocking wait.
//!
//! Completions go into a lock-free `SegQueue`; a waiter that finds it empty
//! parks on a condvar. The `wake_pending` flag is set under the mutex on
//! every push, so a push that races with a waiter about to park is never
//! lost: the waiter sees the flag and re-polls instead of sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};

use cqrpc_transport::Completion;

pub(crate) struct EventQueue {
    events: SegQueue<Completion>,
    shutdown: AtomicBool,
    wake_pending: Mutex<bool>,
    condvar: Condvar,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self {
            events: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            wake_pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, completion: Completion) {
        self.events.push(completion);
        self.wake();
    }

    #[inline]
    pub(crate) fn try_pop(&self) -> Option<Completion> {
        self.events.pop()
    }

    /// Mark shut down. Completions pushed before this call are still
    /// returned by `try_pop`.
    pub(crate) fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake();
    }

    #[inline]
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Wake waiters without queueing anything.
    pub(crate) fn nudge(&self) {
        self.wake();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    /// Sleep until woken or until `until`. Returns true if woken.
    pub(crate) fn park(&self, until: Option<Instant>) -> bool {
        let mut pending = self.wake_pending.lock();
        if *pending {
            *pending = false;
            return true;
        }
        let woken = match until {
            Some(deadline) => !self.condvar.wait_until(&mut pending, deadline).timed_out(),
            None => {
                self.condvar.wait(&mut pending);
                true
            }
        };
        *pending = false;
        woken
    }

    fn wake(&self) {
        {
            let mut pending = self.wake_pending.lock();
            *pending = true;
        }
        self.condvar.notify_all();
    }
}
