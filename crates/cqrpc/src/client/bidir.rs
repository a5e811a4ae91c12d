//! Bidirectional-streaming initiator.
//!
//! A handshake batch (send header + receive header) goes first. When it
//! completes, the send loop flushes whatever the caller queued and the
//! receive loop arms its first read. From then on the two loops are
//! independent:
//!
//! - send loop: one `send_message` in flight, queued items flushed in order,
//!   half-close once the caller terminates its stream and the queue drains;
//! - receive loop: one read in flight, re-armed after every message.
//!
//! The status receive goes out once both loops are done: the receive loop
//! has seen end of input and the half-close has completed. Whichever of the
//! two happens last submits it, always under the call lock, so exactly one
//! does. The reply stream resolves with that status, and the handler
//! retires once no batch of either loop remains in flight.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use cqrpc_core::{stream, Expected, RpcError, StreamFuture, StreamPromise};
use cqrpc_engine::{Advance, CompletionHandler, EngineHandle};
use cqrpc_transport::{Batch, Message, Outcome, TagFlags};

use super::CallOptions;
use crate::call::{reply_decode_error, terminal, CallCtx, Inbox, Ledger, FINISH, READ, START, WRITE};
use crate::send_queue::{Next, SendQueue};

struct State {
    sends: SendQueue,
    ledger: Ledger,
    /// The receive loop saw end of input.
    input_ended: bool,
    /// The half-close completed.
    half_closed: bool,
    /// The status receive has been submitted.
    finishing: bool,
    input_error: Option<RpcError>,
    failure: Option<RpcError>,
}

struct BidiCall {
    ctx: CallCtx,
    replies: Box<dyn Inbox>,
    state: Mutex<State>,
}

enum Read {
    Again,
    Finish,
}

impl BidiCall {
    fn submit(&self, st: &mut State, batch: Batch, flags: TagFlags) {
        match self.ctx.start(batch, flags) {
            Ok(()) => st.ledger.submitted(),
            Err(err) => {
                st.failure.get_or_insert(err);
                st.ledger.finish();
            }
        }
    }

    fn drive_send(&self, st: &mut State, next: Next) {
        if st.ledger.is_finished() {
            return;
        }
        match next {
            Next::Send(payload) => self.submit(st, Batch::new().send_message(payload), WRITE),
            Next::Close => self.submit(st, Batch::new().half_close(), WRITE),
            Next::Wait => {}
        }
    }

    fn drive_read(&self, st: &mut State, read: Read) {
        if st.ledger.is_finished() || st.input_ended {
            return;
        }
        match read {
            Read::Again => self.submit(st, Batch::new().recv_message(), READ),
            Read::Finish => {
                st.input_ended = true;
                self.finish(st);
            }
        }
    }

    fn finish(&self, st: &mut State) {
        if st.input_ended && st.half_closed && !st.finishing && !st.ledger.is_finished() {
            st.finishing = true;
            self.submit(st, Batch::new().recv_status(), FINISH);
        }
    }

    /// Run `step` under the lock; resolve the reply stream and report
    /// retirement outside it.
    fn step(&self, step: impl FnOnce(&mut State) -> Option<Expected<()>>) -> bool {
        let (resolution, retire) = {
            let mut st = self.state.lock();
            let mut resolution = step(&mut st);
            if resolution.is_none() && st.ledger.is_finished() {
                resolution = st.failure.take().map(Err);
            }
            (resolution, st.ledger.take_retirement())
        };
        if retire {
            self.ctx.release_call();
        }
        if let Some(result) = resolution {
            self.replies.close(result);
        }
        retire
    }

    fn step_outside(&self, step: impl FnOnce(&mut State) -> Option<Expected<()>>) {
        if self.step(step) {
            self.ctx.retire();
        }
    }

    fn on_item(&self, payload: Bytes) {
        self.step_outside(|st| {
            let next = st.sends.push(payload);
            self.drive_send(st, next);
            None
        });
    }

    fn on_input_end(&self, result: Expected<()>) {
        self.step_outside(|st| {
            if let Err(err) = result {
                st.input_error = Some(err);
            }
            let next = st.sends.close();
            self.drive_send(st, next);
            None
        });
    }

    /// Hand a received payload to the reply stream, outside the lock.
    fn receive(&self, success: bool, outcome: Outcome) -> Read {
        if !success {
            return Read::Finish;
        }
        match outcome.into_batch().message {
            Some(payload) => match self.replies.deliver(payload) {
                Ok(()) => Read::Again,
                Err(err) => {
                    self.state.lock().failure.get_or_insert(reply_decode_error(err));
                    Read::Finish
                }
            },
            None => Read::Finish,
        }
    }
}

impl CompletionHandler for BidiCall {
    fn advance(&self, success: bool, flags: TagFlags, outcome: Outcome) -> Advance {
        let (read, outcome) = if flags.contains(READ) {
            (Some(self.receive(success, outcome)), Outcome::Empty)
        } else {
            (None, outcome)
        };

        let retire = self.step(|st| {
            st.ledger.completed();
            if flags.contains(START) {
                let next = st.sends.on_sent();
                self.drive_send(st, next);
                self.drive_read(st, if success { Read::Again } else { Read::Finish });
                None
            } else if flags.contains(WRITE) {
                // Only one write is ever in flight, so a write completing
                // after the close was released is the half-close.
                if st.sends.is_closed() {
                    st.half_closed = true;
                    self.finish(st);
                } else {
                    let next = st.sends.on_sent();
                    self.drive_send(st, next);
                }
                None
            } else if flags.contains(FINISH) {
                st.ledger.finish();
                let status = terminal(&outcome.into_batch());
                Some(match (st.input_error.take(), st.failure.take()) {
                    (Some(err), _) | (None, Some(err)) => Err(err),
                    (None, None) => status,
                })
            } else {
                if let Some(read) = read {
                    self.drive_read(st, read);
                }
                None
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
) -> (StreamPromise<Req>, StreamFuture<Rep>)
where
    Req: Message,
    Rep: Message,
{
    let (requests, input) = stream::<Req>();
    let queue = options.queue.unwrap_or_else(|| engine.next_queue());
    let call = match engine.transport().create_call(path, options.deadline, queue) {
        Ok(call) => call,
        Err(err) => return (requests, StreamFuture::failed(err.into())),
    };

    let (replies, output) = stream::<Rep>();
    let handler = engine.spawn(|id| BidiCall {
        ctx: CallCtx::new(engine, id, call),
        replies: Box::new(replies),
        state: Mutex::new(State {
            sends: SendQueue::busy(),
            ledger: Ledger::default(),
            input_ended: false,
            half_closed: false,
            finishing: false,
            input_error: None,
            failure: None,
        }),
    });

    handler.step_outside(|st| {
        handler.submit(st, Batch::new().send_header().recv_header(), START);
        None
    });
    feed(handler, input);
    (requests, output)
}

fn feed<Req: Message>(call: Arc<BidiCall>, input: StreamFuture<Req>) {
    let sender = call.clone();
    input
        .for_each(move |item: Req| sender.on_item(item.encode()))
        .then_finally_expect(move |result| call.on_input_end(result));
}
