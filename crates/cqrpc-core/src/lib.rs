//! # cqrpc-core - Async pipeline primitives
//!
//! Platform-agnostic building blocks shared by every other cqrpc crate.
//! Nothing in here knows about transports, completion queues or calls.
//!
//! ```text
//!   Promise<T> ──set_value──►  shared slot  ──then / finally──►  continuation
//!                                  │
//!   StreamPromise<T> ──push──► ordered buffer ──for_each──► visitor ──► Future<()>
//! ```
//!
//! Every registration and every fulfillment is race-free from any thread.
//! Continuations never run under the slot lock, and nothing here blocks
//! except [`Future::get`].
//!
//! ## Modules
//!
//! - [`error`]: `StatusCode`, `Status`, `RpcError`
//! - [`future`]: single-fulfillment `Future` / `Promise`
//! - [`tie`]: joining several futures into a future of a tuple
//! - [`stream`]: ordered push-based `StreamFuture` / `StreamPromise`
//! - [`env`]: environment variable helpers used by config `from_env()`

pub mod env;
pub mod error;
pub mod future;
pub mod stream;
pub mod tie;

pub use error::{Expected, RpcError, Status, StatusCode};
pub use future::{promise, Future, Promise};
pub use stream::{stream, StreamFuture, StreamPromise};
pub use tie::{tie, Tie};
