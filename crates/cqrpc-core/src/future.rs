//! Single-fulfillment async values
//!
//! A [`Promise`] and its [`Future`] share one slot guarded by a mutex:
//!
//! ```text
//!   Pending ──subscribe──► Waiting(k) ──fulfill──► Taken      (k runs on fulfilling thread)
//!      │
//!      └──fulfill──► Ready(r) ──subscribe──► Taken            (k runs inline)
//! ```
//!
//! The producer fulfills exactly once: `set_value`/`set_exception` consume the
//! promise, and dropping an unfulfilled promise fails the future with
//! [`RpcError::broken_promise`]. Continuations never run under the lock.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Expected, RpcError};

type Continuation<T> = Box<dyn FnOnce(Expected<T>) + Send>;

enum Slot<T> {
    Pending,
    Waiting(Continuation<T>),
    Ready(Expected<T>),
    Taken,
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn new(slot: Slot<T>) -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new(slot), ready: Condvar::new() })
    }

    fn fulfill(&self, result: Expected<T>) {
        let mut slot = self.slot.lock();
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending => {
                *slot = Slot::Ready(result);
                drop(slot);
                self.ready.notify_all();
            }
            Slot::Waiting(k) => {
                drop(slot);
                k(result);
            }
            Slot::Ready(_) | Slot::Taken => unreachable!("promise fulfilled twice"),
        }
    }

    fn subscribe(&self, k: Continuation<T>) {
        let mut slot = self.slot.lock();
        match mem::replace(&mut *slot, Slot::Taken) {
            Slot::Pending => *slot = Slot::Waiting(k),
            Slot::Ready(result) => {
                drop(slot);
                k(result);
            }
            Slot::Waiting(_) | Slot::Taken => unreachable!("future observed twice"),
        }
    }
}

/// Run a user callback, turning a panic into an `RpcError`.
pub(crate) fn guarded<U>(f: impl FnOnce() -> U) -> Expected<U> {
    catch_unwind(AssertUnwindSafe(f)).map_err(RpcError::from_panic)
}

// ============================================================================
// Promise
// ============================================================================

/// Producer side of an async value.
pub struct Promise<T> {
    shared: Option<Arc<Shared<T>>>,
    future_taken: bool,
}

/// Create a linked promise/future pair.
pub fn promise<T>() -> (Promise<T>, Future<T>) {
    let mut p = Promise::new();
    let f = p.get_future();
    (p, f)
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self { shared: Some(Shared::new(Slot::Pending)), future_taken: false }
    }

    /// Obtain the consumer side. May be called once.
    pub fn get_future(&mut self) -> Future<T> {
        assert!(!self.future_taken, "get_future called twice on the same promise");
        self.future_taken = true;
        let shared = match &self.shared {
            Some(shared) => Arc::clone(shared),
            None => unreachable!("promise already fulfilled"),
        };
        Future { shared }
    }

    pub fn set_value(self, value: T) {
        self.fulfill(Ok(value));
    }

    pub fn set_exception(self, err: RpcError) {
        self.fulfill(Err(err));
    }

    /// Fulfill with either outcome.
    pub fn fulfill(mut self, result: Expected<T>) {
        if let Some(shared) = self.shared.take() {
            shared.fulfill(result);
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fulfill(Err(RpcError::broken_promise()));
        }
    }
}

// ============================================================================
// Future
// ============================================================================

/// Consumer side of an async value.
///
/// Every combinator consumes the future: a value is observed exactly once.
/// Build chains with [`then`](Self::then) to fan work out.
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Future<T> {
    /// An already fulfilled future.
    pub fn ready(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// An already failed future.
    pub fn failed(err: RpcError) -> Self {
        Self::from_result(Err(err))
    }

    pub fn from_result(result: Expected<T>) -> Self {
        Self { shared: Shared::new(Slot::Ready(result)) }
    }

    /// True once the producer has fulfilled the value.
    pub fn is_ready(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Ready(_))
    }

    /// Chain `f` on success. Errors propagate without calling `f`.
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let (p, next) = promise();
        self.shared.subscribe(Box::new(move |result| match result {
            Ok(value) => p.fulfill(guarded(move || f(value))),
            Err(err) => p.set_exception(err),
        }));
        next
    }

    /// Chain `f` on success where `f` itself produces a future.
    pub fn and_then<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let (p, next) = promise();
        self.shared.subscribe(Box::new(move |result| match result.and_then(|v| guarded(move || f(v)))
        {
            Ok(inner) => inner.shared.subscribe(Box::new(move |r| p.fulfill(r))),
            Err(err) => p.set_exception(err),
        }));
        next
    }

    /// Chain `f` on the result-or-error; `f` may recover from failures.
    pub fn then_expect<U, F>(self, f: F) -> Future<U>
    where
        U: Send + 'static,
        F: FnOnce(Expected<T>) -> U + Send + 'static,
    {
        let (p, next) = promise();
        self.shared.subscribe(Box::new(move |result| p.fulfill(guarded(move || f(result)))));
        next
    }

    /// Terminal consumer, always invoked with the outcome.
    ///
    /// A panic inside `f` is contained and discarded.
    pub fn then_finally_expect<F>(self, f: F)
    where
        F: FnOnce(Expected<T>) + Send + 'static,
    {
        self.shared.subscribe(Box::new(move |result| {
            let _ = guarded(move || f(result));
        }));
    }

    /// Alias of [`then_finally_expect`](Self::then_finally_expect).
    pub fn finally<F>(self, f: F)
    where
        F: FnOnce(Expected<T>) + Send + 'static,
    {
        self.then_finally_expect(f)
    }

    /// Terminal consumer for the success value only; a failure is dropped.
    pub fn then_finally<F>(self, f: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.then_finally_expect(move |result| {
            if let Ok(value) = result {
                f(value);
            }
        })
    }

    /// Block the calling thread until the value is available.
    ///
    /// Application and test code only; never call this on a completion
    /// queue worker.
    pub fn get(self) -> Expected<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            match mem::replace(&mut *slot, Slot::Taken) {
                Slot::Ready(result) => return result,
                Slot::Pending => {
                    *slot = Slot::Pending;
                    self.shared.ready.wait(&mut slot);
                }
                Slot::Waiting(_) | Slot::Taken => unreachable!("future observed twice"),
            }
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match *self.shared.slot.lock() {
            Slot::Pending | Slot::Waiting(_) => "pending",
            Slot::Ready(Ok(_)) => "fulfilled",
            Slot::Ready(Err(_)) => "failed",
            Slot::Taken => "taken",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_set_before_observe() {
        let (p, f) = promise::<i32>();
        p.set_value(3);
        assert!(f.is_ready());
        let (tx, rx) = mpsc::channel();
        f.then_finally_expect(move |r| tx.send(r).unwrap());
        assert_eq!(rx.try_recv().unwrap(), Ok(3));
    }

    #[test]
    fn test_observe_before_set() {
        let (p, f) = promise::<i32>();
        let (tx, rx) = mpsc::channel();
        f.then_finally_expect(move |r| tx.send(r).unwrap());
        assert!(rx.try_recv().is_err());
        p.set_value(7);
        assert_eq!(rx.try_recv().unwrap(), Ok(7));
    }

    #[test]
    fn test_exception_observed() {
        let (p, f) = promise::<i32>();
        p.set_exception(RpcError::aborted("stop"));
        assert_eq!(f.get(), Err(RpcError::aborted("stop")));
    }

    #[test]
    fn test_fulfill_from_other_thread() {
        for _ in 0..50 {
            let (p, f) = promise::<String>();
            let handle = thread::spawn(move || p.set_value("remote".to_string()));
            let (tx, rx) = mpsc::channel();
            f.then_finally_expect(move |r| tx.send(r).unwrap());
            handle.join().unwrap();
            assert_eq!(rx.recv().unwrap(), Ok("remote".to_string()));
        }
    }

    #[test]
    fn test_get_blocks_until_set() {
        let (p, f) = promise::<u64>();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            p.set_value(99);
        });
        assert_eq!(f.get(), Ok(99));
        handle.join().unwrap();
    }

    #[test]
    fn test_then_chains() {
        let f = Future::ready(2).then(|v| v * 10).then(|v| format!("n={}", v));
        assert_eq!(f.get().unwrap(), "n=20");
    }

    #[test]
    fn test_then_skips_on_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let f = Future::<i32>::failed(RpcError::not_found("gone")).then(move |v| {
            c.fetch_add(1, Ordering::SeqCst);
            v + 1
        });
        assert_eq!(f.get().unwrap_err().code(), StatusCode::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_then_expect_recovers() {
        let f = Future::<i32>::failed(RpcError::unavailable("down"))
            .then_expect(|r| r.unwrap_or(-1));
        assert_eq!(f.get(), Ok(-1));
    }

    #[test]
    fn test_and_then_flattens() {
        let (p, inner) = promise::<i32>();
        let f = Future::ready(1).and_then(move |_| inner).then(|v| v + 1);
        assert!(!f.is_ready());
        p.set_value(41);
        assert_eq!(f.get(), Ok(42));
    }

    #[test]
    fn test_panic_in_then_fails_future() {
        let f = Future::ready(1).then(|_| -> i32 { panic!("bad continuation") });
        let err = f.get().unwrap_err();
        assert_eq!(err.code(), StatusCode::Unknown);
        assert_eq!(err.message(), "bad continuation");
    }

    #[test]
    fn test_dropped_promise_breaks_future() {
        let (p, f) = promise::<i32>();
        drop(p);
        assert_eq!(f.get().unwrap_err(), RpcError::broken_promise());
    }

    #[test]
    fn test_finally_panic_is_contained() {
        let (p, f) = promise::<i32>();
        f.finally(|_| panic!("ignored"));
        p.set_value(1);
    }

    #[test]
    #[should_panic(expected = "get_future called twice")]
    fn test_get_future_twice() {
        let mut p = Promise::<i32>::new();
        let _a = p.get_future();
        let _b = p.get_future();
    }

    #[test]
    fn test_concurrent_subscribe_and_fulfill() {
        for _ in 0..200 {
            let (p, f) = promise::<usize>();
            let seen = Arc::new(AtomicUsize::new(0));
            let s = seen.clone();
            let a = thread::spawn(move || p.set_value(5));
            let b = thread::spawn(move || f.then_finally(move |v| {
                s.fetch_add(v, Ordering::SeqCst);
            }));
            a.join().unwrap();
            b.join().unwrap();
            assert_eq!(seen.load(Ordering::SeqCst), 5);
        }
    }
}
