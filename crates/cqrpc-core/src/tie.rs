//! Joining independent futures
//!
//! `tie((f1, f2, ...))` resolves with the tuple of all values once every
//! input is fulfilled. The first failure observed fails the joined future
//! immediately; later outcomes are discarded.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::RpcError;
use crate::future::{promise, Future, Promise};

/// Tuples of futures that can be joined into one future.
pub trait Tie {
    type Output: Send + 'static;

    fn tie(self) -> Future<Self::Output>;
}

/// Join a tuple of futures. See [`Tie`].
pub fn tie<T: Tie>(futures: T) -> Future<T::Output> {
    futures.tie()
}

struct Join<S, O> {
    slots: Mutex<S>,
    remaining: AtomicUsize,
    promise: Mutex<Option<Promise<O>>>,
}

impl<S, O> Join<S, O> {
    fn fail(&self, err: RpcError) {
        if let Some(p) = self.promise.lock().take() {
            p.set_exception(err);
        }
    }

    /// True for the arrival that completes the set.
    fn arrive(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) == 1
    }
}

macro_rules! impl_tie {
    ($($F:ident $v:ident $idx:tt),+) => {
        impl<$($F: Send + 'static),+> Tie for ($(Future<$F>,)+) {
            type Output = ($($F,)+);

            fn tie(self) -> Future<Self::Output> {
                fn complete<$($F),+>(j: &Join<($(Option<$F>,)+), ($($F,)+)>) {
                    let mut slots = j.slots.lock();
                    if let ($(Some($v),)+) = ($(slots.$idx.take(),)+) {
                        drop(slots);
                        if let Some(p) = j.promise.lock().take() {
                            p.set_value(($($v,)+));
                        }
                    }
                }

                let (p, joined) = promise();
                let join = Arc::new(Join {
                    slots: Mutex::new(($(Option::<$F>::None,)+)),
                    remaining: AtomicUsize::new([$(stringify!($F)),+].len()),
                    promise: Mutex::new(Some(p)),
                });
                $(
                    let j = Arc::clone(&join);
                    self.$idx.then_finally_expect(move |result| match result {
                        Ok(value) => {
                            j.slots.lock().$idx = Some(value);
                            if j.arrive() {
                                complete(&j);
                            }
                        }
                        Err(err) => j.fail(err),
                    });
                )+
                joined
            }
        }
    };
}

impl_tie!(A a 0, B b 1);
impl_tie!(A a 0, B b 1, C c 2);
impl_tie!(A a 0, B b 1, C c 2, D d 3);
impl_tie!(A a 0, B b 1, C c 2, D d 3, E e 4);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use std::thread;

    #[test]
    fn test_tie_all_ready() {
        let joined = tie((Future::ready(1), Future::ready("two")));
        assert_eq!(joined.get().unwrap(), (1, "two"));
    }

    #[test]
    fn test_tie_resolves_after_last() {
        let (p1, f1) = promise::<u8>();
        let (p2, f2) = promise::<String>();
        let (p3, f3) = promise::<bool>();
        let joined = tie((f1, f2, f3));
        p2.set_value("mid".into());
        p1.set_value(1);
        assert!(!joined.is_ready());
        p3.set_value(true);
        assert_eq!(joined.get().unwrap(), (1, "mid".to_string(), true));
    }

    #[test]
    fn test_tie_first_failure_wins() {
        let (p1, f1) = promise::<u8>();
        let (p2, f2) = promise::<u8>();
        let joined = tie((f1, f2));
        p2.set_exception(RpcError::out_of_range("first"));
        assert!(joined.is_ready());
        p1.set_exception(RpcError::internal("second"));
        let err = joined.get().unwrap_err();
        assert_eq!(err.code(), StatusCode::OutOfRange);
    }

    #[test]
    fn test_tie_five_in_reverse_order() {
        let (p1, f1) = promise::<u8>();
        let (p2, f2) = promise::<u16>();
        let (p3, f3) = promise::<u32>();
        let (p4, f4) = promise::<u64>();
        let (p5, f5) = promise::<&'static str>();
        let joined = tie((f1, f2, f3, f4, f5));
        p5.set_value("e");
        p4.set_value(4);
        p3.set_value(3);
        p2.set_value(2);
        assert!(!joined.is_ready());
        p1.set_value(1);
        assert_eq!(joined.get().unwrap(), (1, 2, 3, 4, "e"));
    }

    #[test]
    fn test_tie_across_threads() {
        let (p1, f1) = promise::<u32>();
        let (p2, f2) = promise::<u32>();
        let joined = tie((f1, f2)).then(|(a, b)| a + b);
        let h1 = thread::spawn(move || p1.set_value(20));
        let h2 = thread::spawn(move || p2.set_value(22));
        h1.join().unwrap();
        h2.join().unwrap();
        assert_eq!(joined.get().unwrap(), 42);
    }
}
