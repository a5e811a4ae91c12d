//! Client-streaming acceptor.
//!
//! Reads one message per batch into the request stream until end of input,
//! then completes the stream, invokes the handler with it and sends the
//! handler's single reply together with the status.

use std::sync::Arc;

use parking_lot::Mutex;

use cqrpc_core::{stream, Expected, Future, RpcError, StreamFuture};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{AcceptedCall, Batch, Message, Outcome, TagFlags};

use super::{invoke, reply_batch};
use crate::call::{request_decode_error, CallCtx, Inbox, Ledger, FINISH, READ};

type Respond = Box<dyn FnOnce(Arc<CollectCall>) + Send>;

pub(crate) struct CollectCall {
    ctx: CallCtx,
    requests: Box<dyn Inbox>,
    /// Invokes the handler; taken at end of input.
    respond: Mutex<Option<Respond>>,
    ledger: Mutex<Ledger>,
}

impl CollectCall {
    fn read(&self) -> Expected<()> {
        let mut ledger = self.ledger.lock();
        self.ctx.start(Batch::new().recv_message(), READ)?;
        ledger.submitted();
        Ok(())
    }

    fn reply(&self, result: Expected<bytes::Bytes>) {
        let retire = {
            let mut ledger = self.ledger.lock();
            match self.ctx.start(reply_batch(result), FINISH) {
                Ok(()) => ledger.submitted(),
                Err(_) => ledger.finish(),
            }
            ledger.take_retirement()
        };
        if retire {
            self.ctx.retire();
        }
    }

    /// Close the request stream and hand it to the handler.
    fn end_input(self: &Arc<Self>, result: Expected<()>) {
        self.requests.close(result);
        if let Some(respond) = self.respond.lock().take() {
            respond(self.clone());
        }
    }

    fn on_read(self: &Arc<Self>, success: bool, outcome: Outcome) {
        if !success {
            return self.end_input(Err(RpcError::cancelled("call cancelled by the peer")));
        }
        match outcome.into_batch().message {
            Some(payload) => match self.requests.deliver(payload) {
                Ok(()) => {
                    if let Err(err) = self.read() {
                        self.end_input(Err(err));
                    }
                }
                Err(err) => self.end_input(Err(request_decode_error(err))),
            },
            None => self.end_input(Ok(())),
        }
    }
}

/// The table hands out `&self`; reads need the `Arc` to pass on to the
/// handler's reply continuation.
struct CollectHandler(Arc<CollectCall>);

impl CompletionHandler for CollectHandler {
    fn advance(&self, success: bool, flags: TagFlags, outcome: Outcome) -> Advance {
        let call = &self.0;
        call.ledger.lock().completed();
        if flags.contains(FINISH) {
            call.ledger.lock().finish();
        } else {
            call.on_read(success, outcome);
        }

        if call.ledger.lock().take_retirement() {
            call.ctx.release_call();
            Advance::Done
        } else {
            Advance::Continue
        }
    }
}

pub(crate) fn serve<Req, Rep, F>(engine: &EngineHandle, accepted: AcceptedCall, handler: Arc<F>)
where
    Req: Message,
    Rep: Message,
    F: Fn(StreamFuture<Req>) -> Future<Rep> + Send + Sync + 'static,
{
    let (requests, input) = stream::<Req>();
    let respond: Respond = Box::new(move |call: Arc<CollectCall>| {
        let reply = invoke(|| (*handler)(input)).unwrap_or_else(Future::failed);
        reply
            .then(|rep| rep.encode())
            .then_finally_expect(move |result| call.reply(result));
    });

    let handle = engine.spawn(|id| {
        CollectHandler(Arc::new(CollectCall {
            ctx: CallCtx::new(engine, id, accepted.call),
            requests: Box::new(requests),
            respond: Mutex::new(Some(respond)),
            ledger: Mutex::new(Ledger::default()),
        }))
    });

    let call = &handle.0;
    if let Err(err) = call.read() {
        call.end_input(Err(err));
    }
}
