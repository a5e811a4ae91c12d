//! # cqrpc - Completion-Queue RPC Core
//!
//! Asynchronous RPC execution over a completion-queue transport: composable
//! futures and streams, four call shapes on both ends of a call, and a
//! thread-per-queue engine dispatching transport completions to call state
//! machines.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cqrpc::{Channel, CallOptions, Engine, EngineConfig, Loopback, Server, ServerConfig, ServiceConfig};
//!
//! let engine = Engine::start(Arc::new(Loopback::new()), EngineConfig::default())?;
//!
//! let service = ServiceConfig::new("greeter")
//!     .add_unary("Hello", None, |name: String| Ok(format!("{name}_replied")));
//! let server = Server::start(&engine, ServerConfig::new().add_service(service))?;
//!
//! let channel = Channel::new(&engine, "loopback");
//! let reply: String = channel
//!     .unary("/greeter/Hello", &"dude".to_string(), &CallOptions::default())
//!     .get()?;
//! assert_eq!(reply, "dude_replied");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Application: Channel / MethodStub        ServiceConfig      │
//! │     Future<Rep>, StreamFuture<Rep>        handlers           │
//! └──────────────────────────────────────────────────────────────┘
//!               │                                   ▲
//!               ▼                                   │
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Call state machines (client + server, four shapes)          │
//! │  Listeners (one outstanding accept per method per queue)     │
//! └──────────────────────────────────────────────────────────────┘
//!               │ start_batch(tag)                  ▲ advance(success, flags)
//!               ▼                                   │
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Engine: HandlerTable + one worker thread per queue          │
//! └──────────────────────────────────────────────────────────────┘
//!               │                                   ▲ next(queue)
//!               ▼                                   │
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Transport (Loopback in process)                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod call;
pub mod client;
pub mod logging;
mod send_queue;
pub mod server;

pub use client::{CallOptions, Channel, MethodStub};
pub use server::{method_path, Server, ServerConfig, ServiceConfig};

pub use cqrpc_core::{
    promise, stream, tie, Expected, Future, Promise, RpcError, Status, StatusCode, StreamFuture,
    StreamPromise, Tie,
};
pub use cqrpc_engine::{Engine, EngineConfig, EngineError, EngineHandle};
pub use cqrpc_loopback::Loopback;
pub use cqrpc_transport::{Message, QueueId, Transport};

/// Re-exported for implementing [`Message`].
pub use bytes::Bytes;
