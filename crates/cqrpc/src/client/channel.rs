use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use cqrpc_core::{Future, StreamFuture, StreamPromise};
use cqrpc_engine::{Engine, EngineHandle};
use cqrpc_transport::{Message, QueueId};

use super::{bidir, client_streaming, server_streaming, unary};

/// Per-call settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Queue the call's completions are delivered on. Round-robin if unset.
    pub queue: Option<QueueId>,
    /// Absolute deadline enforced by the transport.
    pub deadline: Option<Instant>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, queue: QueueId) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }
}

/// A named connection to the engine's transport. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    engine: EngineHandle,
    target: Arc<str>,
}

impl Channel {
    pub fn new(engine: &Engine, target: impl Into<String>) -> Self {
        Self { engine: engine.handle().clone(), target: Arc::from(target.into()) }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Next engine queue in round-robin order.
    pub fn default_queue(&self) -> QueueId {
        self.engine.next_queue()
    }

    /// Stub bound to one method path.
    pub fn stub(&self, path: impl Into<String>) -> MethodStub {
        MethodStub::new(self, path)
    }

    /// One request, one reply.
    pub fn unary<Req, Rep>(&self, path: &str, request: &Req, options: &CallOptions) -> Future<Rep>
    where
        Req: Message,
        Rep: Message,
    {
        trace!(target_name = %self.target, method = %path, "unary call");
        unary::start(&self.engine, path, request, options)
    }

    /// One request, a stream of replies.
    pub fn server_streaming<Req, Rep>(&self, path: &str, request: &Req, options: &CallOptions) -> StreamFuture<Rep>
    where
        Req: Message,
        Rep: Message,
    {
        trace!(target_name = %self.target, method = %path, "server-streaming call");
        server_streaming::start(&self.engine, path, request, options)
    }

    /// A stream of requests fed through the returned promise, one reply.
    pub fn client_streaming<Req, Rep>(&self, path: &str, options: &CallOptions) -> (StreamPromise<Req>, Future<Rep>)
    where
        Req: Message,
        Rep: Message,
    {
        trace!(target_name = %self.target, method = %path, "client-streaming call");
        client_streaming::start(&self.engine, path, options)
    }

    /// Independent request and reply streams on one call.
    pub fn bidir_streaming<Req, Rep>(
        &self,
        path: &str,
        options: &CallOptions,
    ) -> (StreamPromise<Req>, StreamFuture<Rep>)
    where
        Req: Message,
        Rep: Message,
    {
        trace!(target_name = %self.target, method = %path, "bidirectional call");
        bidir::start(&self.engine, path, options)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("target", &self.target).finish()
    }
}

/// A [`Channel`] bound to one method path and a set of call options.
#[derive(Clone, Debug)]
pub struct MethodStub {
    channel: Channel,
    path: Arc<str>,
    options: CallOptions,
}

impl MethodStub {
    pub fn new(channel: &Channel, path: impl Into<String>) -> Self {
        Self { channel: channel.clone(), path: Arc::from(path.into()), options: CallOptions::default() }
    }

    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn unary<Req: Message, Rep: Message>(&self, request: &Req) -> Future<Rep> {
        self.channel.unary(&self.path, request, &self.options)
    }

    pub fn server_streaming<Req: Message, Rep: Message>(&self, request: &Req) -> StreamFuture<Rep> {
        self.channel.server_streaming(&self.path, request, &self.options)
    }

    pub fn client_streaming<Req: Message, Rep: Message>(&self) -> (StreamPromise<Req>, Future<Rep>) {
        self.channel.client_streaming(&self.path, &self.options)
    }

    pub fn bidir_streaming<Req: Message, Rep: Message>(&self) -> (StreamPromise<Req>, StreamFuture<Rep>) {
        self.channel.bidir_streaming(&self.path, &self.options)
    }
}
