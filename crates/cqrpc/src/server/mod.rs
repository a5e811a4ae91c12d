//! Acceptor side: [`ServerConfig`], [`ServiceConfig`] and the running
//! [`Server`].
//!
//! ```text
//!   Server::start
//!     ├── register every method path with the transport
//!     └── per (method, queue): Listener ──accept──► dispatch ──► call state machine
//!                                   ▲                    │
//!                                   └──── re-arm first ──┘
//! ```

mod client_streaming;
mod config;
mod listener;
mod streaming;
mod unary;

pub use config::{method_path, ServerConfig, ServiceConfig};

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use cqrpc_core::{Expected, RpcError, Status};
use cqrpc_engine::{Engine, EngineHandle};
use cqrpc_transport::{Batch, MethodId, QueueId};

use self::config::MethodConfig;
use self::listener::Listener;

/// Run a user handler; a panic becomes the call's error.
pub(crate) fn invoke<T>(f: impl FnOnce() -> T) -> Expected<T> {
    catch_unwind(AssertUnwindSafe(f)).map_err(RpcError::from_panic)
}

/// Final batch of a call with a single reply.
pub(crate) fn reply_batch(result: Expected<Bytes>) -> Batch {
    match result {
        Ok(payload) => Batch::new()
            .send_header()
            .send_message(payload)
            .send_status(Status::ok())
            .recv_close(),
        Err(err) => Batch::new().send_header().send_status(err.into()).recv_close(),
    }
}

/// A running set of services.
///
/// Dropping the server shuts it down.
pub struct Server {
    engine: EngineHandle,
    methods: Vec<String>,
    registrations: Vec<MethodId>,
    listeners: usize,
    shut_down: AtomicBool,
}

impl Server {
    /// Register every method with the transport, then start one listener
    /// per method and listening queue.
    pub fn start(engine: &Engine, config: ServerConfig) -> Result<Server, RpcError> {
        config.validate()?;
        let handle = engine.handle().clone();
        let transport = handle.transport();
        let all = handle.queues();

        let queues_of = |indices: &mut dyn Iterator<Item = usize>| -> Result<Vec<QueueId>, RpcError> {
            indices
                .map(|i| {
                    all.get(i).copied().ok_or_else(|| {
                        RpcError::invalid_argument(format!("listening queue {i} out of range (engine has {})", all.len()))
                    })
                })
                .collect()
        };
        let defaults = match &config.default_queues {
            Some(set) => queues_of(&mut set.iter().copied())?,
            None => all.to_vec(),
        };

        let mut resolved: Vec<(MethodConfig, Vec<QueueId>)> = Vec::new();
        for method in config.services.into_iter().flat_map(ServiceConfig::into_methods) {
            let queues = match &method.queues {
                Some(range) => queues_of(&mut range.clone())?,
                None => defaults.clone(),
            };
            if queues.is_empty() {
                return Err(RpcError::invalid_argument(format!("{} listens on no queue", method.path)));
            }
            resolved.push((method, queues));
        }

        let mut plan: Vec<(MethodId, MethodConfig, Vec<QueueId>)> = Vec::with_capacity(resolved.len());
        for (method, queues) in resolved {
            match transport.register_method(&method.path, method.payload) {
                Ok(id) => {
                    debug!(method = %method.path, queues = queues.len(), "registered method");
                    plan.push((id, method, queues));
                }
                Err(err) => {
                    let registered: Vec<MethodId> = plan.iter().map(|(id, _, _)| *id).collect();
                    transport.shutdown_methods(&registered);
                    return Err(err.into());
                }
            }
        }

        let mut server = Server {
            engine: handle.clone(),
            methods: Vec::with_capacity(plan.len()),
            registrations: plan.iter().map(|(id, _, _)| *id).collect(),
            listeners: 0,
            shut_down: AtomicBool::new(false),
        };
        for (id, method, queues) in plan {
            let path: Arc<str> = Arc::from(method.path.as_str());
            for queue in queues {
                let listener = handle.spawn(|hid| {
                    Listener::new(&handle, hid, id, path.clone(), queue, method.dispatch.clone())
                });
                if let Err(err) = listener.arm() {
                    handle.release(listener.id());
                    // Dropping the server tears down every registration.
                    return Err(err.into());
                }
                server.listeners += 1;
            }
            server.methods.push(method.path);
        }

        info!(methods = server.methods.len(), listeners = server.listeners, "server started");
        Ok(server)
    }

    /// Full paths of the served methods.
    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Listeners started, one per method and listening queue.
    pub fn listeners(&self) -> usize {
        self.listeners
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Stop accepting calls for this server's methods. Outstanding accepts
    /// fail, which ends every listener; other servers on the same engine
    /// keep running. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.engine.transport().shutdown_methods(&self.registrations);
        info!(methods = self.methods.len(), "server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("methods", &self.methods)
            .field("listeners", &self.listeners)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
