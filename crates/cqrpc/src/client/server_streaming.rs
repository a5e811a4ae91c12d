//! Server-streaming initiator.
//!
//! ```text
//!   START  header + request + half-close + recv header
//!   READ   recv one message ── Some ──► push, re-arm READ
//!                          └─ None ──► FINISH
//!   FINISH recv status ──► stream terminal
//! ```
//!
//! Exactly one batch is outstanding at any time, so the steps never race.

use parking_lot::Mutex;

use cqrpc_core::{stream, RpcError, StreamFuture};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{Batch, Message, Outcome, TagFlags};

use super::CallOptions;
use crate::call::{reply_decode_error, terminal, CallCtx, Inbox, FINISH, READ, START};

struct ServerStreamingCall {
    ctx: CallCtx,
    items: Box<dyn Inbox>,
    /// Local failure that overrides the peer's status.
    failure: Mutex<Option<RpcError>>,
}

impl ServerStreamingCall {
    fn submit(&self, batch: Batch, flags: TagFlags) -> Advance {
        match self.ctx.start(batch, flags) {
            Ok(()) => Advance::Continue,
            Err(err) => {
                self.ctx.release_call();
                self.items.close(Err(err));
                Advance::Done
            }
        }
    }

    fn read(&self) -> Advance {
        self.submit(Batch::new().recv_message(), READ)
    }

    fn finish(&self) -> Advance {
        self.submit(Batch::new().recv_status(), FINISH)
    }
}

impl CompletionHandler for ServerStreamingCall {
    fn advance(&self, success: bool, flags: TagFlags, outcome: Outcome) -> Advance {
        if flags.contains(FINISH) {
            let status = terminal(&outcome.into_batch());
            let result = match self.failure.lock().take() {
                Some(err) => Err(err),
                None => status,
            };
            self.ctx.release_call();
            self.items.close(result);
            return Advance::Done;
        }

        if !success {
            return self.finish();
        }
        if flags.contains(START) {
            return self.read();
        }

        match outcome.into_batch().message {
            Some(payload) => match self.items.deliver(payload) {
                Ok(()) => self.read(),
                Err(err) => {
                    *self.failure.lock() = Some(reply_decode_error(err));
                    self.finish()
                }
            },
            None => self.finish(),
        }
    }
}

pub(crate) fn start<Req, Rep>(engine: &EngineHandle, path: &str, request: &Req, options: &CallOptions) -> StreamFuture<Rep>
where
    Req: Message,
    Rep: Message,
{
    let queue = options.queue.unwrap_or_else(|| engine.next_queue());
    let call = match engine.transport().create_call(path, options.deadline, queue) {
        Ok(call) => call,
        Err(err) => return StreamFuture::failed(err.into()),
    };

    let (items, replies) = stream::<Rep>();
    let handler = engine.spawn(|id| ServerStreamingCall {
        ctx: CallCtx::new(engine, id, call),
        items: Box::new(items),
        failure: Mutex::new(None),
    });

    let batch = Batch::new()
        .send_header()
        .send_message(request.encode())
        .half_close()
        .recv_header();
    if let Err(err) = handler.ctx.start(batch, START) {
        handler.ctx.retire();
        handler.items.close(Err(err));
    }
    replies
}
