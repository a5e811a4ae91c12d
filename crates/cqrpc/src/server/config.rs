//! Service and server configuration.
//!
//! ```ignore
//! let service = ServiceConfig::new("greeter")
//!     .add_unary("Hello", None, |name: String| Ok(format!("{name}_replied")))
//!     .add_server_streaming("Count", Some(0..1), |n: String| count_to(n));
//!
//! let config = ServerConfig::new()
//!     .add_service(service)
//!     .add_default_listening_queues(0..2);
//! ```

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use cqrpc_core::{Future, RpcError, StreamFuture};
use cqrpc_engine::EngineHandle;
use cqrpc_transport::{AcceptedCall, Message, PayloadHandling};

use super::listener::Dispatch;
use super::{client_streaming, streaming, unary};

/// Full path of a method: `/{service}/{method}`.
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

pub(crate) struct MethodConfig {
    pub(crate) path: String,
    pub(crate) payload: PayloadHandling,
    pub(crate) queues: Option<Range<usize>>,
    pub(crate) dispatch: Dispatch,
}

/// Methods of one service with their handlers.
pub struct ServiceConfig {
    name: String,
    methods: Vec<MethodConfig>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), methods: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full paths of the methods added so far.
    pub fn method_paths(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(|m| m.path.as_str())
    }

    fn add(mut self, method: &str, payload: PayloadHandling, queues: Option<Range<usize>>, dispatch: Dispatch) -> Self {
        self.methods.push(MethodConfig { path: method_path(&self.name, method), payload, queues, dispatch });
        self
    }

    /// Unary method with a handler that answers synchronously.
    pub fn add_unary<Req, Rep, F>(self, method: &str, queues: Option<Range<usize>>, handler: F) -> Self
    where
        Req: Message,
        Rep: Message,
        F: Fn(Req) -> Result<Rep, RpcError> + Send + Sync + 'static,
    {
        self.add_unary_async(method, queues, move |request| Future::from_result(handler(request)))
    }

    /// Unary method with a handler that answers through a future.
    pub fn add_unary_async<Req, Rep, F>(self, method: &str, queues: Option<Range<usize>>, handler: F) -> Self
    where
        Req: Message,
        Rep: Message,
        F: Fn(Req) -> Future<Rep> + Send + Sync + 'static,
    {
        let dispatch: Dispatch = Arc::new(move |engine: &EngineHandle, accepted: AcceptedCall| {
            unary::serve::<Req, Rep, F>(engine, accepted, &handler)
        });
        self.add(method, PayloadHandling::ReadInitial, queues, dispatch)
    }

    pub fn add_server_streaming<Req, Rep, F>(self, method: &str, queues: Option<Range<usize>>, handler: F) -> Self
    where
        Req: Message,
        Rep: Message,
        F: Fn(Req) -> StreamFuture<Rep> + Send + Sync + 'static,
    {
        let dispatch: Dispatch = Arc::new(move |engine: &EngineHandle, accepted: AcceptedCall| {
            streaming::serve_server_streaming::<Req, Rep, F>(engine, accepted, &handler)
        });
        self.add(method, PayloadHandling::ReadInitial, queues, dispatch)
    }

    /// The handler runs once the whole request stream has arrived.
    pub fn add_client_streaming<Req, Rep, F>(self, method: &str, queues: Option<Range<usize>>, handler: F) -> Self
    where
        Req: Message,
        Rep: Message,
        F: Fn(StreamFuture<Req>) -> Future<Rep> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let dispatch: Dispatch = Arc::new(move |engine: &EngineHandle, accepted: AcceptedCall| {
            client_streaming::serve::<Req, Rep, F>(engine, accepted, handler.clone())
        });
        self.add(method, PayloadHandling::None, queues, dispatch)
    }

    pub fn add_bidir_streaming<Req, Rep, F>(self, method: &str, queues: Option<Range<usize>>, handler: F) -> Self
    where
        Req: Message,
        Rep: Message,
        F: Fn(StreamFuture<Req>) -> StreamFuture<Rep> + Send + Sync + 'static,
    {
        let dispatch: Dispatch = Arc::new(move |engine: &EngineHandle, accepted: AcceptedCall| {
            streaming::serve_bidir::<Req, Rep, F>(engine, accepted, &handler)
        });
        self.add(method, PayloadHandling::None, queues, dispatch)
    }

    pub(crate) fn into_methods(self) -> Vec<MethodConfig> {
        self.methods
    }
}

/// Services plus the queues their methods listen on by default.
#[derive(Default)]
pub struct ServerConfig {
    pub(crate) services: Vec<ServiceConfig>,
    pub(crate) default_queues: Option<BTreeSet<usize>>,
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_service(mut self, service: ServiceConfig) -> Self {
        self.services.push(service);
        self
    }

    /// Add engine queue indices to the default listening set.
    pub fn add_default_listening_queues(mut self, queues: Range<usize>) -> Self {
        self.default_queues.get_or_insert_with(BTreeSet::new).extend(queues);
        self
    }

    /// Replace the default listening set.
    pub fn with_default_listening_queues(mut self, queues: impl IntoIterator<Item = usize>) -> Self {
        self.default_queues = Some(queues.into_iter().collect());
        self
    }

    /// Every method path, in registration order.
    pub fn method_paths(&self) -> Vec<&str> {
        self.services.iter().flat_map(|s| s.method_paths()).collect()
    }

    /// Reject duplicate paths and an explicitly empty default queue set.
    pub fn validate(&self) -> Result<(), RpcError> {
        let mut seen = BTreeSet::new();
        for path in self.method_paths() {
            if !seen.insert(path) {
                return Err(RpcError::already_exists(format!("method registered twice: {path}")));
            }
        }
        if self.default_queues.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(RpcError::invalid_argument("default listening queue set is empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::StatusCode;

    fn echo(s: String) -> Result<String, RpcError> {
        Ok(s)
    }

    #[test]
    fn test_method_paths() {
        let service = ServiceConfig::new("greeter")
            .add_unary("Hello", None, echo)
            .add_bidir_streaming("Chat", Some(0..1), |s: StreamFuture<String>| s);
        assert_eq!(service.method_paths().collect::<Vec<_>>(), vec!["/greeter/Hello", "/greeter/Chat"]);
    }

    #[test]
    fn test_duplicate_methods_rejected() {
        let config = ServerConfig::new()
            .add_service(ServiceConfig::new("a").add_unary("M", None, echo))
            .add_service(ServiceConfig::new("a").add_unary("M", None, echo));
        assert_eq!(config.validate().unwrap_err().code(), StatusCode::AlreadyExists);
    }

    #[test]
    fn test_default_queues() {
        let config = ServerConfig::new()
            .add_default_listening_queues(0..2)
            .add_default_listening_queues(3..4);
        assert_eq!(config.default_queues.as_ref().unwrap().iter().copied().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert!(config.validate().is_ok());

        let empty = ServerConfig::new().with_default_listening_queues([]);
        assert_eq!(empty.validate().unwrap_err().code(), StatusCode::InvalidArgument);
    }
}
