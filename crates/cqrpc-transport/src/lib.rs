//! # cqrpc-transport - Transport capability interface
//!
//! This crate defines the boundary between the RPC core and whatever moves
//! bytes between peers. It holds types and traits only; the in-process
//! implementation lives in `cqrpc-loopback`.
//!
//! ```text
//!   state machine ──start_batch(call, ops, tag)──► Transport
//!                                                      │
//!   engine worker ◄────next(queue) = (tag, success)────┘
//! ```
//!
//! ## Design principle
//!
//! > Every transport interaction is tagged. The tag names the handler that
//! > issued it plus a few flag bits telling that handler which of its
//! > outstanding batches finished.

pub mod codec;
pub mod error;
pub mod op;
pub mod tag;
pub mod transport;

pub use codec::Message;
pub use error::TransportError;
pub use op::{AcceptedCall, Batch, BatchResult, Completion, Event, Op, Outcome};
pub use tag::{CompletionTag, HandlerId, TagFlags};
pub use transport::{CallHandle, MethodId, PayloadHandling, QueueId, Transport};
