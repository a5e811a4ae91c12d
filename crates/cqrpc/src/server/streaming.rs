//! Acceptors whose reply is a stream: server-streaming and bidirectional.
//!
//! ```text
//!   START   send header (holds the send queue until it completes)
//!   WRITE   one reply message in flight, the rest queued in order
//!   READ    bidirectional only: one request read in flight, re-armed
//!   FINISH  send status + recv close, once the reply stream ended and
//!           the send queue drained
//! ```
//!
//! The handler's reply stream drives the send loop from whichever thread
//! pushes into it; completions drive the rest. The handler retires once
//! FINISH completed and no other batch is outstanding.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::trace;

use cqrpc_core::{stream, Expected, RpcError, Status, StreamFuture};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{AcceptedCall, Batch, Message, Outcome, TagFlags};

use super::invoke;
use crate::call::{request_decode_error, CallCtx, Inbox, Ledger, FINISH, READ, START, WRITE};
use crate::send_queue::{Next, SendQueue};

struct State {
    sends: SendQueue,
    ledger: Ledger,
    /// Status to send once the queue drains.
    status: Option<Status>,
    reading: bool,
}

pub(crate) struct StreamingCall {
    ctx: CallCtx,
    requests: Option<Box<dyn Inbox>>,
    state: Mutex<State>,
}

impl StreamingCall {
    fn new(ctx: CallCtx, requests: Option<Box<dyn Inbox>>) -> Self {
        Self {
            ctx,
            state: Mutex::new(State {
                sends: SendQueue::busy(),
                ledger: Ledger::default(),
                status: None,
                reading: requests.is_some(),
            }),
            requests,
        }
    }

    fn submit(&self, st: &mut State, batch: Batch, flags: TagFlags) {
        match self.ctx.start(batch, flags) {
            Ok(()) => st.ledger.submitted(),
            Err(err) => {
                trace!(handler = %self.ctx.id(), %err, "streaming reply aborted");
                st.reading = false;
                st.ledger.finish();
            }
        }
    }

    fn drive(&self, st: &mut State, next: Next) {
        if st.ledger.is_finished() {
            return;
        }
        match next {
            Next::Send(payload) => self.submit(st, Batch::new().send_message(payload), WRITE),
            Next::Close => {
                let status = st.status.take().unwrap_or_else(Status::ok);
                self.submit(st, Batch::new().send_status(status).recv_close(), FINISH);
            }
            Next::Wait => {}
        }
    }

    fn step(&self, step: impl FnOnce(&mut State)) -> bool {
        let retire = {
            let mut st = self.state.lock();
            step(&mut st);
            st.ledger.take_retirement()
        };
        if retire {
            self.ctx.release_call();
        }
        retire
    }

    fn step_outside(&self, step: impl FnOnce(&mut State)) {
        if self.step(step) {
            self.ctx.retire();
        }
    }

    fn begin(&self) {
        self.step_outside(|st| {
            self.submit(st, Batch::new().send_header(), START);
            if st.reading {
                self.submit(st, Batch::new().recv_message(), READ);
            }
        });
    }

    fn on_reply(&self, payload: Bytes) {
        self.step_outside(|st| {
            let next = st.sends.push(payload);
            self.drive(st, next);
        });
    }

    fn on_reply_end(&self, result: Expected<()>) {
        self.step_outside(|st| {
            st.status = Some(match result {
                Ok(()) => Status::ok(),
                Err(err) => err.into(),
            });
            let next = st.sends.close();
            self.drive(st, next);
        });
    }

    /// Deliver one read to the request stream. Returns whether to read on.
    fn receive(&self, success: bool, outcome: Outcome) -> bool {
        let Some(requests) = &self.requests else {
            return false;
        };
        if !success {
            requests.close(Err(RpcError::cancelled("call cancelled by the peer")));
            return false;
        }
        match outcome.into_batch().message {
            Some(payload) => match requests.deliver(payload) {
                Ok(()) => true,
                Err(err) => {
                    requests.close(Err(request_decode_error(err)));
                    false
                }
            },
            None => {
                requests.close(Ok(()));
                false
            }
        }
    }
}

impl CompletionHandler for StreamingCall {
    fn advance(&self, success: bool, flags: TagFlags, outcome: Outcome) -> Advance {
        let read_on = flags.contains(READ) && self.receive(success, outcome);

        let retire = self.step(|st| {
            st.ledger.completed();
            if flags.contains(FINISH) {
                st.ledger.finish();
            } else if flags.contains(READ) {
                if read_on && st.reading && !st.ledger.is_finished() {
                    self.submit(st, Batch::new().recv_message(), READ);
                } else {
                    st.reading = false;
                }
            } else {
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

fn attach<Rep: Message>(call: Arc<StreamingCall>, replies: StreamFuture<Rep>) {
    let sender = call.clone();
    replies
        .for_each(move |rep: Rep| sender.on_reply(rep.encode()))
        .then_finally_expect(move |result| call.on_reply_end(result));
}

pub(crate) fn serve_server_streaming<Req, Rep, F>(engine: &EngineHandle, accepted: AcceptedCall, handler: &F)
where
    Req: Message,
    Rep: Message,
    F: Fn(Req) -> StreamFuture<Rep>,
{
    let call = engine.spawn(|id| StreamingCall::new(CallCtx::new(engine, id, accepted.call), None));

    let replies = match accepted.payload {
        Some(payload) => Req::decode(payload)
            .map_err(request_decode_error)
            .and_then(|request| invoke(|| handler(request))),
        None => Err(RpcError::invalid_argument("missing request message")),
    };

    call.begin();
    attach(call, replies.unwrap_or_else(StreamFuture::failed));
}

pub(crate) fn serve_bidir<Req, Rep, F>(engine: &EngineHandle, accepted: AcceptedCall, handler: &F)
where
    Req: Message,
    Rep: Message,
    F: Fn(StreamFuture<Req>) -> StreamFuture<Rep>,
{
    let (requests, input) = stream::<Req>();
    let call = engine.spawn(|id| {
        StreamingCall::new(CallCtx::new(engine, id, accepted.call), Some(Box::new(requests)))
    });

    let replies = invoke(|| handler(input));
    call.begin();
    attach(call, replies.unwrap_or_else(StreamFuture::failed));
}
