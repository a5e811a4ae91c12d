//! Unary initiator: one batch carries the whole exchange.

use parking_lot::Mutex;

use cqrpc_core::{promise, Expected, Future, Promise, RpcError};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{Batch, BatchResult, Message, Outcome, TagFlags};

use super::CallOptions;
use crate::call::{reply_decode_error, terminal, CallCtx, START};

struct UnaryCall<Rep> {
    ctx: CallCtx,
    reply: Mutex<Option<Promise<Rep>>>,
}

impl<Rep: Message> UnaryCall<Rep> {
    fn resolve(&self, result: Expected<Rep>) {
        if let Some(reply) = self.reply.lock().take() {
            reply.fulfill(result);
        }
    }
}

fn reply_of<Rep: Message>(result: BatchResult) -> Expected<Rep> {
    terminal(&result)?;
    match result.message {
        Some(payload) => Rep::decode(payload).map_err(reply_decode_error),
        None => Err(RpcError::internal("unary call finished without a reply")),
    }
}

impl<Rep: Message> CompletionHandler for UnaryCall<Rep> {
    fn advance(&self, success: bool, _flags: TagFlags, outcome: Outcome) -> Advance {
        let batch = outcome.into_batch();
        // A send refused because the call already ended still reports the
        // status that ended it.
        let result = if success || batch.status.is_some() {
            reply_of(batch)
        } else {
            Err(RpcError::internal("unary call batch failed"))
        };
        self.ctx.release_call();
        self.resolve(result);
        Advance::Done
    }
}

pub(crate) fn start<Req, Rep>(engine: &EngineHandle, path: &str, request: &Req, options: &CallOptions) -> Future<Rep>
where
    Req: Message,
    Rep: Message,
{
    let queue = options.queue.unwrap_or_else(|| engine.next_queue());
    let call = match engine.transport().create_call(path, options.deadline, queue) {
        Ok(call) => call,
        Err(err) => return Future::failed(err.into()),
    };

    let (reply, future) = promise();
    let handler = engine.spawn(|id| UnaryCall { ctx: CallCtx::new(engine, id, call), reply: Mutex::new(Some(reply)) });

    let batch = Batch::new()
        .send_header()
        .send_message(request.encode())
        .half_close()
        .recv_header()
        .recv_message()
        .recv_status();
    if let Err(err) = handler.ctx.start(batch, START) {
        handler.ctx.retire();
        handler.resolve(Err(err));
    }
    future
}
