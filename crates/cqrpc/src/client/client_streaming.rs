//! Client-streaming initiator.
//!
//! The caller feeds a [`StreamPromise`]; every item is encoded and handed
//! to the call's [`SendQueue`], which keeps one `send_message` batch in
//! flight. Once the caller terminates the stream and the queue drains, the
//! close goes out as one batch with half-close and the reply receives.

use parking_lot::Mutex;

use cqrpc_core::{promise, stream, Expected, Future, Promise, RpcError, StreamFuture, StreamPromise};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{Batch, BatchResult, Message, Outcome, TagFlags};

use super::CallOptions;
use crate::call::{reply_decode_error, terminal, CallCtx, Ledger, FINISH, START, WRITE};
use crate::send_queue::{Next, SendQueue};

struct State<Rep> {
    sends: SendQueue,
    ledger: Ledger,
    reply: Option<Promise<Rep>>,
    /// Resolution to deliver once the lock is released.
    settled: Option<(Promise<Rep>, Expected<Rep>)>,
    /// The caller failed its request stream.
    input_error: Option<RpcError>,
}

impl<Rep> State<Rep> {
    fn settle(&mut self, result: Expected<Rep>) {
        self.ledger.finish();
        if let Some(reply) = self.reply.take() {
            self.settled = Some((reply, result));
        }
    }
}

struct ClientStreamingCall<Rep> {
    ctx: CallCtx,
    state: Mutex<State<Rep>>,
}

fn reply_of<Rep: Message>(result: BatchResult) -> Expected<Rep> {
    terminal(&result)?;
    match result.message {
        Some(payload) => Rep::decode(payload).map_err(reply_decode_error),
        None => Err(RpcError::internal("client-streaming call finished without a reply")),
    }
}

impl<Rep: Message> ClientStreamingCall<Rep> {
    fn drive(&self, st: &mut State<Rep>, next: Next) {
        if st.ledger.is_finished() {
            return;
        }
        let (batch, flags) = match next {
            Next::Send(payload) => (Batch::new().send_message(payload), WRITE),
            Next::Close => (
                Batch::new().half_close().recv_header().recv_message().recv_status(),
                FINISH,
            ),
            Next::Wait => return,
        };
        match self.ctx.start(batch, flags) {
            Ok(()) => st.ledger.submitted(),
            Err(err) => st.settle(Err(err)),
        }
    }

    /// Apply `step` under the lock, then resolve and report retirement
    /// outside it.
    fn step(&self, step: impl FnOnce(&mut State<Rep>)) -> bool {
        let (settled, retire) = {
            let mut st = self.state.lock();
            step(&mut st);
            (st.settled.take(), st.ledger.take_retirement())
        };
        if retire {
            self.ctx.release_call();
        }
        if let Some((reply, result)) = settled {
            reply.fulfill(result);
        }
        retire
    }

    /// Step driven from a caller thread rather than a completion.
    fn step_outside(&self, step: impl FnOnce(&mut State<Rep>)) {
        if self.step(step) {
            self.ctx.retire();
        }
    }

    fn on_item(&self, payload: bytes::Bytes) {
        self.step_outside(|st| {
            let next = st.sends.push(payload);
            self.drive(st, next);
        });
    }

    fn on_input_end(&self, result: Expected<()>) {
        self.step_outside(|st| {
            if let Err(err) = result {
                st.input_error = Some(err);
            }
            let next = st.sends.close();
            self.drive(st, next);
        });
    }
}

impl<Rep: Message> CompletionHandler for ClientStreamingCall<Rep> {
    fn advance(&self, _success: bool, flags: TagFlags, outcome: Outcome) -> Advance {
        let retire = self.step(|st| {
            st.ledger.completed();
            if flags.contains(FINISH) {
                let result = match st.input_error.take() {
                    Some(err) => Err(err),
                    None => reply_of(outcome.into_batch()),
                };
                st.settle(result);
            } else {
                // A failed send means the call already ended; the close
                // batch picks up its status.
                let next = st.sends.on_sent();
                self.drive(st, next);
            }
        });
        if retire {
            Advance::Done
        } else {
            Advance::Continue
        }
    }
}

pub(crate) fn start<Req, Rep>(
    engine: &EngineHandle,
    path: &str,
    options: &CallOptions,
) -> (StreamPromise<Req>, Future<Rep>)
where
    Req: Message,
    Rep: Message,
{
    let (requests, input) = stream::<Req>();
    let queue = options.queue.unwrap_or_else(|| engine.next_queue());
    let call = match engine.transport().create_call(path, options.deadline, queue) {
        Ok(call) => call,
        Err(err) => return (requests, Future::failed(err.into())),
    };

    let (reply, future) = promise();
    let handler = engine.spawn(|id| ClientStreamingCall {
        ctx: CallCtx::new(engine, id, call),
        state: Mutex::new(State {
            sends: SendQueue::busy(),
            ledger: Ledger::default(),
            reply: Some(reply),
            settled: None,
            input_error: None,
        }),
    });

    handler.step_outside(|st| match handler.ctx.start(Batch::new().send_header(), START) {
        Ok(()) => st.ledger.submitted(),
        Err(err) => st.settle(Err(err)),
    });
    feed(handler, input);
    (requests, future)
}

fn feed<Req: Message, Rep: Message>(call: std::sync::Arc<ClientStreamingCall<Rep>>, input: StreamFuture<Req>) {
    let sender = call.clone();
    input
        .for_each(move |item: Req| sender.on_item(item.encode()))
        .then_finally_expect(move |result| call.on_input_end(result));
}
