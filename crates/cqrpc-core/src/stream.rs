//! Ordered, push-based async streams
//!
//! A [`StreamPromise`] pushes items and ends with exactly one terminal call;
//! the [`StreamFuture`] side attaches one visitor with `for_each` and gets a
//! `Future<()>` that resolves with the terminal outcome.
//!
//! ```text
//!   push ──► items (VecDeque) ──drain──► visitor(item)   (one drainer at a time)
//!   complete / set_exception ──► terminal ──drain──► Future<()>
//! ```
//!
//! Delivery is done by whichever thread finds the stream idle: a push, the
//! terminal call, or `for_each` itself. The `delivering` flag elects a single
//! drainer, so the visitor never runs concurrently with itself and can
//! mutate its captures without locking. Items pushed after the terminal call
//! are refused.

use std::collections::VecDeque;
use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Expected, RpcError};
use crate::future::{promise, Future, Promise};

type Visitor<T> = Box<dyn FnMut(T) + Send>;

struct StreamState<T> {
    items: VecDeque<T>,
    /// Terminal outcome recorded by the producer, not yet delivered.
    terminal: Option<Expected<()>>,
    visitor: Option<Visitor<T>>,
    done: Option<Promise<()>>,
    attached: bool,
    delivering: bool,
    /// Producer issued its terminal call.
    closed: bool,
    /// Consumer is gone or delivery finished: items are discarded.
    abandoned: bool,
}

struct StreamShared<T> {
    state: Mutex<StreamState<T>>,
}

impl<T: Send + 'static> StreamShared<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(StreamState {
                items: VecDeque::new(),
                terminal: None,
                visitor: None,
                done: None,
                attached: false,
                delivering: false,
                closed: false,
                abandoned: false,
            }),
        })
    }

    fn push(&self, item: T) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        if st.abandoned {
            return true;
        }
        st.items.push_back(item);
        if st.attached && !st.delivering {
            st.delivering = true;
            drop(st);
            self.drain();
        }
        true
    }

    fn terminate(&self, result: Expected<()>) -> bool {
        let mut st = self.state.lock();
        if st.closed {
            return false;
        }
        st.closed = true;
        if st.abandoned {
            return true;
        }
        st.terminal = Some(result);
        if st.attached && !st.delivering {
            st.delivering = true;
            drop(st);
            self.drain();
        }
        true
    }

    fn attach(&self, visitor: Visitor<T>) -> Future<()> {
        let (p, done) = promise();
        let mut st = self.state.lock();
        st.visitor = Some(visitor);
        st.done = Some(p);
        st.attached = true;
        let start = !st.delivering && (!st.items.is_empty() || st.terminal.is_some());
        if start {
            st.delivering = true;
        }
        drop(st);
        if start {
            self.drain();
        }
        done
    }

    fn abandon(&self) {
        let mut st = self.state.lock();
        st.abandoned = true;
        st.items.clear();
    }

    /// Deliver buffered items, then the terminal outcome. Caller must have
    /// set `delivering`.
    fn drain(&self) {
        loop {
            let mut st = self.state.lock();
            if let Some(item) = st.items.pop_front() {
                let Some(mut visitor) = st.visitor.take() else {
                    st.delivering = false;
                    return;
                };
                drop(st);

                let outcome = catch_unwind(AssertUnwindSafe(|| visitor(item)));

                let mut st = self.state.lock();
                match outcome {
                    Ok(()) => st.visitor = Some(visitor),
                    Err(payload) => {
                        st.abandoned = true;
                        st.delivering = false;
                        st.items.clear();
                        st.terminal = None;
                        let done = st.done.take();
                        drop(st);
                        if let Some(done) = done {
                            done.set_exception(RpcError::from_panic(payload));
                        }
                        return;
                    }
                }
                continue;
            }

            if let Some(result) = st.terminal.take() {
                st.delivering = false;
                st.abandoned = true;
                st.visitor = None;
                let done = st.done.take();
                drop(st);
                if let Some(done) = done {
                    done.fulfill(result);
                }
                return;
            }

            st.delivering = false;
            return;
        }
    }
}

// ============================================================================
// Producer side
// ============================================================================

/// Fails the stream when the last producer handle goes away unterminated.
struct Producer<T: Send + 'static> {
    shared: Arc<StreamShared<T>>,
}

impl<T: Send + 'static> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.terminate(Err(RpcError::broken_promise()));
    }
}

/// Producer side of an async stream. Cheap to clone; all clones feed the
/// same stream.
pub struct StreamPromise<T: Send + 'static> {
    producer: Arc<Producer<T>>,
}

impl<T: Send + 'static> Clone for StreamPromise<T> {
    fn clone(&self) -> Self {
        Self { producer: Arc::clone(&self.producer) }
    }
}

/// Create a linked stream promise/future pair.
pub fn stream<T: Send + 'static>() -> (StreamPromise<T>, StreamFuture<T>) {
    let shared = StreamShared::new();
    let promise = StreamPromise {
        producer: Arc::new(Producer { shared: Arc::clone(&shared) }),
    };
    (promise, StreamFuture { shared: Some(shared) })
}

impl<T: Send + 'static> StreamPromise<T> {
    /// Enqueue one item. Returns `false` if the stream is already terminated.
    pub fn push(&self, item: T) -> bool {
        self.producer.shared.push(item)
    }

    /// Terminate successfully. Returns `false` if already terminated.
    pub fn complete(&self) -> bool {
        self.producer.shared.terminate(Ok(()))
    }

    /// Terminate with an error. Returns `false` if already terminated.
    pub fn set_exception(&self, err: RpcError) -> bool {
        self.producer.shared.terminate(Err(err))
    }

    /// Terminate with either outcome.
    pub fn finish(&self, result: Expected<()>) -> bool {
        self.producer.shared.terminate(result)
    }

    pub fn is_closed(&self) -> bool {
        self.producer.shared.state.lock().closed
    }
}

// ============================================================================
// Consumer side
// ============================================================================

/// Consumer side of an async stream.
///
/// Dropping it without calling [`for_each`](Self::for_each) abandons the
/// stream: later pushes are accepted and discarded.
pub struct StreamFuture<T: Send + 'static> {
    shared: Option<Arc<StreamShared<T>>>,
}

impl<T: Send + 'static> StreamFuture<T> {
    /// A stream that yields `items` and completes.
    pub fn from_items<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        let (tx, rx) = stream();
        for item in items {
            tx.push(item);
        }
        tx.complete();
        rx
    }

    /// A stream that fails without yielding anything.
    pub fn failed(err: RpcError) -> Self {
        let (tx, rx) = stream();
        tx.set_exception(err);
        rx
    }

    /// Visit every item in push order. The returned future resolves with
    /// the terminal outcome once all items have been visited.
    pub fn for_each<F>(mut self, visitor: F) -> Future<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        match self.shared.take() {
            Some(shared) => shared.attach(Box::new(visitor)),
            None => Future::failed(RpcError::internal("stream already consumed")),
        }
    }

    /// Gather every item into a vector.
    pub fn collect(self) -> Future<Vec<T>> {
        let items = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&items);
        self.for_each(move |item| sink.lock().push(item))
            .then(move |()| mem::take(&mut *items.lock()))
    }
}

impl<T: Send + 'static> Drop for StreamFuture<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.abandon();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_items_in_push_order() {
        let (tx, rx) = stream::<u32>();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let done = rx.for_each(move |v| s.lock().push(v));
        for i in 0..10 {
            assert!(tx.push(i));
        }
        assert!(!done.is_ready());
        tx.complete();
        assert!(done.get().is_ok());
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_buffered_before_attach() {
        let (tx, rx) = stream::<&'static str>();
        tx.push("a");
        tx.push("b");
        tx.complete();
        assert_eq!(rx.collect().get().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_no_items_after_terminal() {
        let (tx, rx) = stream::<u8>();
        tx.push(1);
        assert!(tx.complete());
        assert!(!tx.push(2));
        assert!(!tx.set_exception(RpcError::internal("late")));
        assert_eq!(rx.collect().get().unwrap(), vec![1]);
    }

    #[test]
    fn test_failure_terminal() {
        let (tx, rx) = stream::<u8>();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let done = rx.for_each(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tx.push(1);
        tx.set_exception(RpcError::data_loss("truncated"));
        assert_eq!(done.get().unwrap_err().code(), StatusCode::DataLoss);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_producer_fails_stream() {
        let (tx, rx) = stream::<u8>();
        let tx2 = tx.clone();
        tx.push(5);
        drop(tx);
        let done = rx.collect();
        assert!(!done.is_ready());
        drop(tx2);
        assert_eq!(done.get().unwrap_err(), RpcError::broken_promise());
    }

    #[test]
    fn test_visitor_never_concurrent() {
        let (tx, rx) = stream::<usize>();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let count = Arc::new(AtomicUsize::new(0));
        let (b, o, c) = (busy.clone(), overlaps.clone(), count.clone());
        let done = rx.for_each(move |_| {
            if b.swap(true, Ordering::SeqCst) {
                o.fetch_add(1, Ordering::SeqCst);
            }
            thread::yield_now();
            c.fetch_add(1, Ordering::SeqCst);
            b.store(false, Ordering::SeqCst);
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        tx.push(i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        tx.complete();
        done.get().unwrap();
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn test_panicking_visitor_fails_for_each() {
        let (tx, rx) = stream::<u8>();
        let done = rx.for_each(|v| {
            if v == 2 {
                panic!("visitor gave up");
            }
        });
        tx.push(1);
        tx.push(2);
        assert!(tx.push(3));
        let err = done.get().unwrap_err();
        assert_eq!(err.code(), StatusCode::Unknown);
        assert_eq!(err.message(), "visitor gave up");
    }

    #[test]
    fn test_abandoned_consumer_discards() {
        let (tx, rx) = stream::<u8>();
        drop(rx);
        assert!(tx.push(1));
        assert!(tx.complete());
    }

    #[test]
    fn test_from_items_and_failed() {
        let v = StreamFuture::from_items(vec![1, 2, 3]).collect().get().unwrap();
        assert_eq!(v, vec![1, 2, 3]);
        let err = StreamFuture::<u8>::failed(RpcError::cancelled("x")).collect().get();
        assert_eq!(err.unwrap_err().code(), StatusCode::Cancelled);
    }
}
