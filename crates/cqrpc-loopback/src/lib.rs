//! # cqrpc-loopback - In-process transport
//!
//! A complete [`Transport`] whose peers live in the same process. It keeps
//! the shape of a real completion-queue transport so the RPC core can be
//! driven end to end without a network:
//!
//! ```text
//!   create_call ──► CallState ──SendHeader──► method backlog ──┐
//!                                                             ├─ matched ──► Accepted(cq)
//!   request_call ──────────────► method waiting accepts ───────┘
//!
//!   start_batch ──► apply sends, park receives ──► progress() ──► EventQueue(cq)
//!   next(cq)    ──► expire deadlines ──► pop EventQueue or park
//! ```
//!
//! Deadlines expire lazily: any thread waiting in `next()` wakes up in time
//! for the earliest call deadline and cancels every overdue call with
//! `DeadlineExceeded`. Starting a batch expires overdue calls first, so a
//! call whose deadline already passed never gets routed.

mod call;
mod queue;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use cqrpc_core::{Status, StatusCode};
use cqrpc_transport::error::Result;
use cqrpc_transport::{
    Batch, CallHandle, Completion, CompletionTag, Event, MethodId, Outcome, PayloadHandling,
    QueueId, Transport, TransportError,
};

use crate::call::{Accept, CallState, Posts, Side};
use crate::queue::EventQueue;

#[derive(Debug, Clone, Copy)]
struct AcceptRequest {
    queue: QueueId,
    tag: CompletionTag,
}

struct MethodEntry {
    path: String,
    payload: PayloadHandling,
    waiting: VecDeque<AcceptRequest>,
    backlog: VecDeque<u64>,
    /// Torn down; the path refuses calls until registered again.
    closed: bool,
}

#[derive(Default)]
struct Core {
    next_call: u64,
    calls: HashMap<u64, CallState>,
    methods: Vec<MethodEntry>,
    by_path: HashMap<String, MethodId>,
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

/// In-process transport. Cheap to share behind an `Arc`.
pub struct Loopback {
    core: Mutex<Core>,
    queues: RwLock<Vec<Arc<EventQueue>>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self { core: Mutex::new(Core::default()), queues: RwLock::new(Vec::new()) }
    }

    /// Accepts currently outstanding for the live registration of `path`.
    pub fn pending_accepts(&self, path: &str) -> usize {
        let core = self.core.lock();
        core.by_path
            .get(path)
            .map(|id| core.methods[id.0 as usize].waiting.len())
            .unwrap_or(0)
    }

    /// Calls not yet released by both sides.
    pub fn live_calls(&self) -> usize {
        self.core.lock().calls.len()
    }

    fn queue(&self, id: QueueId) -> Option<Arc<EventQueue>> {
        self.queues.read().get(id.index()).cloned()
    }

    fn post(&self, posts: Posts) {
        if posts.is_empty() {
            return;
        }
        let queues = self.queues.read();
        for (queue, completion) in posts {
            if let Some(q) = queues.get(queue.index()) {
                q.push(completion);
            }
        }
    }

    fn fail_accept(&self, request: AcceptRequest) {
        self.post(vec![(
            request.queue,
            Completion { tag: request.tag, success: false, outcome: Outcome::Empty },
        )]);
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

// ── Core bookkeeping (always under the core lock) ──────────────────────

impl Core {
    /// Pair waiting accepts with backlogged calls of one method.
    fn match_method(&mut self, method: MethodId) -> Posts {
        let mut posts = Posts::new();
        let read_payload = self.methods[method.0 as usize].payload == PayloadHandling::ReadInitial;
        loop {
            let entry = &mut self.methods[method.0 as usize];
            if entry.waiting.is_empty() {
                break;
            }
            let Some(call_id) = entry.backlog.pop_front() else {
                break;
            };
            let Some(call) = self.calls.get_mut(&call_id) else {
                continue;
            };
            if call.is_terminated() {
                continue;
            }
            let Some(request) = self.methods[method.0 as usize].waiting.pop_front() else {
                break;
            };
            call.method = Some(method);
            call.accept = Some(Accept {
                method,
                queue: request.queue,
                tag: request.tag,
                read_payload,
            });
            posts.extend(call.progress());
        }
        posts
    }

    /// Route a call whose initiator just sent its header.
    fn route(&mut self, call_id: u64) -> Posts {
        let Some(call) = self.calls.get_mut(&call_id) else {
            return Posts::new();
        };
        if call.is_terminated() {
            return Posts::new();
        }
        match self.by_path.get(&call.path).copied() {
            Some(method) if self.methods[method.0 as usize].closed => {
                call.reject(Status::new(StatusCode::Unavailable, "server is shutting down"));
                Posts::new()
            }
            Some(method) => {
                self.methods[method.0 as usize].backlog.push_back(call_id);
                self.match_method(method)
            }
            None => {
                let msg = format!("method not found: {}", call.path);
                call.reject(Status::new(StatusCode::Unimplemented, msg));
                Posts::new()
            }
        }
    }

    fn cancel(&mut self, call_id: u64, status: Status) -> Posts {
        match self.calls.get_mut(&call_id) {
            Some(call) => {
                call.cancel(status);
                call.progress()
            }
            None => Posts::new(),
        }
    }

    fn expire(&mut self, now: Instant) -> Posts {
        let mut posts = Posts::new();
        while let Some(Reverse((deadline, call_id))) = self.deadlines.peek().copied() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let overdue = self.calls.get(&call_id).is_some_and(|c| !c.is_terminated());
            if overdue {
                trace!(call = call_id, "deadline exceeded");
                posts.extend(self.cancel(call_id, Status::new(StatusCode::DeadlineExceeded, "deadline exceeded")));
            }
        }
        posts
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
    }

    fn reclaim(&mut self, call_id: u64) {
        if self.calls.get(&call_id).is_some_and(CallState::is_reclaimable) {
            self.calls.remove(&call_id);
        }
    }
}

// ── Transport ──────────────────────────────────────────────────────────

impl Transport for Loopback {
    fn create_queue(&self) -> QueueId {
        let mut queues = self.queues.write();
        queues.push(Arc::new(EventQueue::new()));
        QueueId((queues.len() - 1) as u32)
    }

    fn next(&self, queue: QueueId, deadline: Option<Instant>) -> Event {
        let Some(q) = self.queue(queue) else {
            return Event::Shutdown;
        };

        loop {
            let (posts, next_expiry) = {
                let mut core = self.core.lock();
                let posts = core.expire(Instant::now());
                (posts, core.next_deadline())
            };
            self.post(posts);

            if let Some(completion) = q.try_pop() {
                return Event::Completion(completion);
            }
            if q.is_shut_down() {
                return match q.try_pop() {
                    Some(completion) => Event::Completion(completion),
                    None => Event::Shutdown,
                };
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Event::Timeout;
            }

            let wake_at = match (deadline, next_expiry) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            q.park(wake_at);
        }
    }

    fn shutdown_queue(&self, queue: QueueId) {
        let Some(q) = self.queue(queue) else {
            return;
        };

        let (failed, posts) = {
            let mut core = self.core.lock();
            let mut failed = Vec::new();
            for method in core.methods.iter_mut() {
                let (gone, kept): (VecDeque<_>, VecDeque<_>) =
                    method.waiting.drain(..).partition(|r| r.queue == queue);
                method.waiting = kept;
                failed.extend(gone);
            }

            let bound: Vec<u64> = core
                .calls
                .values()
                .filter(|c| c.has_pending())
                .filter(|c| {
                    c.client_queue == queue
                        || c.server_queue == Some(queue)
                        || c.accept.is_some_and(|a| a.queue == queue)
                })
                .map(|c| c.id)
                .collect();
            let mut posts = Posts::new();
            for call_id in bound {
                posts.extend(core.cancel(call_id, Status::new(StatusCode::Unavailable, "completion queue shut down")));
            }
            (failed, posts)
        };

        for request in failed {
            self.fail_accept(request);
        }
        self.post(posts);
        q.shut_down();
        debug!(%queue, "loopback queue shut down");
    }

    fn register_method(&self, path: &str, payload: PayloadHandling) -> Result<MethodId> {
        let mut core = self.core.lock();
        if let Some(live) = core.by_path.get(path) {
            if !core.methods[live.0 as usize].closed {
                return Err(TransportError::DuplicateMethod(path.to_string()));
            }
        }
        let id = MethodId(core.methods.len() as u32);
        core.methods.push(MethodEntry {
            path: path.to_string(),
            payload,
            waiting: VecDeque::new(),
            backlog: VecDeque::new(),
            closed: false,
        });
        core.by_path.insert(path.to_string(), id);
        debug!(method = %path, "registered method");
        Ok(id)
    }

    fn request_call(&self, method: MethodId, queue: QueueId, tag: CompletionTag) -> Result<()> {
        match self.queue(queue) {
            Some(q) if !q.is_shut_down() => {}
            Some(_) => return Err(TransportError::QueueShutdown),
            None => return Err(TransportError::UnknownQueue(queue.0)),
        }

        let posts = {
            let mut core = self.core.lock();
            let Some(entry) = core.methods.get_mut(method.0 as usize) else {
                return Err(TransportError::UnknownMethod);
            };
            if entry.closed {
                return Err(TransportError::Shutdown);
            }
            trace!(method = %entry.path, %queue, "accept requested");
            entry.waiting.push_back(AcceptRequest { queue, tag });
            core.match_method(method)
        };
        self.post(posts);
        Ok(())
    }

    fn shutdown_methods(&self, methods: &[MethodId]) {
        let (failed, posts) = {
            let mut core = self.core.lock();
            let mut failed = Vec::new();
            let mut cancelled = Vec::new();
            for method in methods {
                let Some(entry) = core.methods.get_mut(method.0 as usize) else {
                    continue;
                };
                if entry.closed {
                    continue;
                }
                entry.closed = true;
                failed.extend(entry.waiting.drain(..));
                cancelled.extend(entry.backlog.drain(..));
                debug!(method = %entry.path, "method shut down");
            }

            cancelled.extend(
                core.calls
                    .values()
                    .filter(|c| !c.is_terminated())
                    .filter(|c| c.method.is_some_and(|m| methods.contains(&m)))
                    .map(|c| c.id),
            );

            let mut posts = Posts::new();
            for call_id in cancelled {
                posts.extend(core.cancel(call_id, Status::new(StatusCode::Unavailable, "server is shutting down")));
            }
            (failed, posts)
        };

        for request in failed {
            self.fail_accept(request);
        }
        self.post(posts);
    }

    fn create_call(&self, path: &str, deadline: Option<Instant>, queue: QueueId) -> Result<CallHandle> {
        match self.queue(queue) {
            Some(q) if !q.is_shut_down() => {}
            Some(_) => return Err(TransportError::QueueShutdown),
            None => return Err(TransportError::UnknownQueue(queue.0)),
        }

        let mut core = self.core.lock();
        let id = core.next_call;
        core.next_call += 1;
        core.calls.insert(id, CallState::new(id, path, deadline, queue));
        if let Some(deadline) = deadline {
            core.deadlines.push(Reverse((deadline, id)));
        }
        drop(core);

        // Wake the waiters so the new deadline is taken into account.
        if deadline.is_some() {
            for q in self.queues.read().iter() {
                q.nudge();
            }
        }
        Ok(call::handle(id, Side::Client))
    }

    fn start_batch(&self, handle: CallHandle, batch: Batch, tag: CompletionTag) -> Result<()> {
        let (call_id, side) = call::split(handle);
        let expired = {
            let mut core = self.core.lock();
            core.expire(Instant::now())
        };
        self.post(expired);

        let posts = {
            let mut core = self.core.lock();
            let call = core.calls.get_mut(&call_id).ok_or(TransportError::UnknownCall)?;
            let released = match side {
                Side::Client => call.client_released,
                Side::Server => call.server_released,
            };
            if released {
                return Err(TransportError::UnknownCall);
            }
            let routed = call.start_batch(side, batch.into_ops(), tag)?;
            let mut posts = call.progress();
            if routed {
                posts.extend(core.route(call_id));
                if let Some(call) = core.calls.get_mut(&call_id) {
                    posts.extend(call.progress());
                }
            }
            posts
        };
        self.post(posts);
        Ok(())
    }

    fn release_call(&self, handle: CallHandle) {
        let (call_id, side) = call::split(handle);
        let mut core = self.core.lock();
        if let Some(call) = core.calls.get_mut(&call_id) {
            match side {
                Side::Client => call.client_released = true,
                Side::Server => call.server_released = true,
            }
        }
        core.reclaim(call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use cqrpc_transport::{AcceptedCall, HandlerId, TagFlags};
    use std::thread;
    use std::time::Duration;

    fn tag(n: u32) -> CompletionTag {
        CompletionTag::new(HandlerId::new(n, 1), TagFlags::NONE)
    }

    fn next_completion(lb: &Loopback, q: QueueId) -> Completion {
        match lb.next(q, Some(Instant::now() + Duration::from_secs(5))) {
            Event::Completion(c) => c,
            other => panic!("expected a completion, got {:?}", other),
        }
    }

    fn accepted(c: Completion) -> AcceptedCall {
        match c.outcome {
            Outcome::Accepted(a) => a,
            other => panic!("expected an accept, got {:?}", other),
        }
    }

    #[test]
    fn test_unary_round_trip() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let method = lb.register_method("/echo/Say", PayloadHandling::ReadInitial).unwrap();
        lb.request_call(method, cq, tag(1)).unwrap();
        assert_eq!(lb.pending_accepts("/echo/Say"), 1);

        let call = lb.create_call("/echo/Say", None, cq).unwrap();
        let batch = Batch::new()
            .send_header()
            .send_message(Bytes::from_static(b"ping"))
            .half_close()
            .recv_header()
            .recv_message()
            .recv_status();
        lb.start_batch(call, batch, tag(2)).unwrap();

        let c = next_completion(&lb, cq);
        assert_eq!(c.tag, tag(1));
        let accept = accepted(c);
        assert_eq!(accept.payload.as_deref(), Some(&b"ping"[..]));
        assert_eq!(lb.pending_accepts("/echo/Say"), 0);

        let reply = Batch::new()
            .send_header()
            .send_message(Bytes::from_static(b"pong"))
            .send_status(Status::ok())
            .recv_close();
        lb.start_batch(accept.call, reply, tag(3)).unwrap();

        let mut seen = vec![next_completion(&lb, cq), next_completion(&lb, cq)];
        seen.sort_by_key(|c| c.tag.as_u64());
        assert_eq!(seen[0].tag, tag(2));
        match &seen[0].outcome {
            Outcome::Batch(r) => {
                assert_eq!(r.message.as_deref(), Some(&b"pong"[..]));
                assert_eq!(r.status, Some(Status::ok()));
            }
            other => panic!("unexpected {:?}", other),
        }

        lb.release_call(call);
        assert_eq!(lb.live_calls(), 1);
        lb.release_call(accept.call);
        assert_eq!(lb.live_calls(), 0);
    }

    #[test]
    fn test_unknown_method_is_unimplemented() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let call = lb.create_call("/nope/Nope", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header().half_close().recv_status(), tag(1)).unwrap();
        let c = next_completion(&lb, cq);
        assert!(c.success);
        let status = c.outcome.into_batch().status.unwrap();
        assert_eq!(status.code, StatusCode::Unimplemented);
    }

    #[test]
    fn test_duplicate_registration() {
        let lb = Loopback::new();
        lb.register_method("/a/b", PayloadHandling::None).unwrap();
        let err = lb.register_method("/a/b", PayloadHandling::None).unwrap_err();
        assert_eq!(err, TransportError::DuplicateMethod("/a/b".into()));
    }

    #[test]
    fn test_backlogged_call_waits_for_accept() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let method = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        let call = lb.create_call("/s/m", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header(), tag(1)).unwrap();
        assert_eq!(next_completion(&lb, cq).tag, tag(1));
        assert!(matches!(lb.next(cq, Some(Instant::now())), Event::Timeout));

        lb.request_call(method, cq, tag(2)).unwrap();
        let c = next_completion(&lb, cq);
        assert_eq!(c.tag, tag(2));
        assert!(accepted(c).payload.is_none());
    }

    #[test]
    fn test_deadline_expires_call() {
        let lb = Arc::new(Loopback::new());
        let cq = lb.create_queue();
        lb.register_method("/slow/Op", PayloadHandling::None).unwrap();
        let deadline = Instant::now() + Duration::from_millis(30);
        let call = lb.create_call("/slow/Op", Some(deadline), cq).unwrap();
        lb.start_batch(call, Batch::new().send_header().half_close().recv_status(), tag(1)).unwrap();

        let c = next_completion(&lb, cq);
        assert!(Instant::now() >= deadline);
        let status = c.outcome.into_batch().status.unwrap();
        assert_eq!(status.code, StatusCode::DeadlineExceeded);
    }

    #[test]
    fn test_queue_shutdown_fails_accepts_then_reports_shutdown() {
        let lb = Arc::new(Loopback::new());
        let cq = lb.create_queue();
        let method = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        lb.request_call(method, cq, tag(1)).unwrap();

        let lb2 = lb.clone();
        let waiter = thread::spawn(move || {
            let mut events = Vec::new();
            loop {
                match lb2.next(cq, None) {
                    Event::Shutdown => break,
                    Event::Completion(c) => events.push(c),
                    Event::Timeout => {}
                }
            }
            events
        });
        thread::sleep(Duration::from_millis(20));
        lb.shutdown_queue(cq);

        let events = waiter.join().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tag, tag(1));
        assert!(!events[0].success);
        assert_eq!(lb.request_call(method, cq, tag(2)), Err(TransportError::QueueShutdown));
    }

    #[test]
    fn test_method_shutdown_refuses_new_calls() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let method = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        lb.request_call(method, cq, tag(1)).unwrap();
        lb.shutdown_methods(&[method]);
        assert!(!next_completion(&lb, cq).success);
        assert_eq!(lb.request_call(method, cq, tag(2)), Err(TransportError::Shutdown));
        lb.shutdown_methods(&[method]);

        let call = lb.create_call("/s/m", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header().recv_status(), tag(3)).unwrap();
        let status = next_completion(&lb, cq).outcome.into_batch().status.unwrap();
        assert_eq!(status.code, StatusCode::Unavailable);
    }

    #[test]
    fn test_method_shutdown_leaves_other_methods_alone() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let gone = lb.register_method("/a/m", PayloadHandling::None).unwrap();
        let kept = lb.register_method("/b/m", PayloadHandling::None).unwrap();
        lb.request_call(kept, cq, tag(1)).unwrap();
        lb.shutdown_methods(&[gone]);
        assert_eq!(lb.pending_accepts("/b/m"), 1);

        let call = lb.create_call("/b/m", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header(), tag(2)).unwrap();
        let mut tags = vec![next_completion(&lb, cq), next_completion(&lb, cq)];
        tags.sort_by_key(|c| c.tag.as_u64());
        assert_eq!(tags[0].tag, tag(1));
        assert!(tags[0].success);
        assert!(matches!(tags[0].outcome, Outcome::Accepted(_)));
    }

    #[test]
    fn test_method_shutdown_cancels_attached_calls() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let method = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        lb.request_call(method, cq, tag(1)).unwrap();
        let call = lb.create_call("/s/m", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header().recv_status(), tag(2)).unwrap();
        let server = accepted(next_completion(&lb, cq));

        lb.shutdown_methods(&[method]);
        let status = next_completion(&lb, cq).outcome.into_batch().status.unwrap();
        assert_eq!(status.code, StatusCode::Unavailable);
        lb.release_call(call);
        lb.release_call(server.call);
        assert_eq!(lb.live_calls(), 0);
    }

    #[test]
    fn test_path_registers_again_after_shutdown() {
        let lb = Loopback::new();
        let cq = lb.create_queue();
        let first = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        lb.shutdown_methods(&[first]);
        let second = lb.register_method("/s/m", PayloadHandling::None).unwrap();
        assert_ne!(first, second);
        assert_eq!(
            lb.register_method("/s/m", PayloadHandling::None),
            Err(TransportError::DuplicateMethod("/s/m".into()))
        );

        lb.request_call(second, cq, tag(1)).unwrap();
        assert_eq!(lb.pending_accepts("/s/m"), 1);
        let call = lb.create_call("/s/m", None, cq).unwrap();
        lb.start_batch(call, Batch::new().send_header(), tag(2)).unwrap();
        let mut seen = vec![next_completion(&lb, cq), next_completion(&lb, cq)];
        seen.sort_by_key(|c| c.tag.as_u64());
        assert!(matches!(seen[0].outcome, Outcome::Accepted(_)));
    }
}
