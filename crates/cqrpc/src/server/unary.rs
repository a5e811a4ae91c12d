//! Unary acceptor: the accept already carries the request; one batch sends
//! header, reply and status once the handler's future resolves.

use cqrpc_core::{Future, RpcError};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{AcceptedCall, Message, Outcome, TagFlags};

use super::{invoke, reply_batch};
use crate::call::{request_decode_error, CallCtx, FINISH};

pub(crate) struct SingleReply {
    pub(crate) ctx: CallCtx,
}

impl SingleReply {
    /// Send the reply once `reply` resolves.
    pub(crate) fn respond<Rep: Message>(self: std::sync::Arc<Self>, reply: Future<Rep>) {
        reply
            .then(|rep| rep.encode())
            .then_finally_expect(move |result| {
                if self.ctx.start(reply_batch(result), FINISH).is_err() {
                    self.ctx.retire();
                }
            });
    }
}

impl CompletionHandler for SingleReply {
    fn advance(&self, _success: bool, _flags: TagFlags, _outcome: Outcome) -> Advance {
        self.ctx.release_call();
        Advance::Done
    }
}

pub(crate) fn serve<Req, Rep, F>(engine: &EngineHandle, accepted: AcceptedCall, handler: &F)
where
    Req: Message,
    Rep: Message,
    F: Fn(Req) -> Future<Rep>,
{
    let call = engine.spawn(|id| SingleReply { ctx: CallCtx::new(engine, id, accepted.call) });

    let reply = match accepted.payload {
        Some(payload) => Req::decode(payload)
            .map_err(request_decode_error)
            .and_then(|request| invoke(|| handler(request))),
        None => Err(RpcError::invalid_argument("missing request message")),
    };
    call.respond(reply.unwrap_or_else(Future::failed));
}
