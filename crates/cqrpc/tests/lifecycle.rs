//! Deadlines, shutdown, listener liveness and registration errors.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use cqrpc::{
    promise, CallOptions, Channel, Promise, Server, ServerConfig, ServiceConfig, StatusCode,
};

use common::{engine, eventually};

fn hello() -> ServiceConfig {
    ServiceConfig::new("greeter").add_unary("Hello", None, |name: String| Ok(format!("{name}_replied")))
}

#[test]
fn test_unknown_method_is_unimplemented() {
    let (_t, engine) = engine(1);
    let _server = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let channel = Channel::new(&engine, "loopback");
    let err = channel
        .unary::<String, String>("/greeter/Goodbye", &"x".to_string(), &CallOptions::default())
        .get()
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unimplemented);
}

#[test]
fn test_stalled_handler_hits_deadline() {
    let (_t, engine) = engine(2);
    let parked: Arc<Mutex<Vec<Promise<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = parked.clone();
    let service = ServiceConfig::new("slow").add_unary_async("Never", None, move |_: String| {
        let (reply, future) = promise();
        sink.lock().push(reply);
        future
    });
    let _server = Server::start(&engine, ServerConfig::new().add_service(service)).unwrap();
    let channel = Channel::new(&engine, "loopback");

    let started = Instant::now();
    let options = CallOptions::new().with_timeout(Duration::from_millis(50));
    let err = channel.unary::<String, String>("/slow/Never", &"x".to_string(), &options).get().unwrap_err();
    assert_eq!(err.code(), StatusCode::DeadlineExceeded);
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert_eq!(parked.lock().len(), 1);

    // A late answer goes nowhere and does not disturb the next call.
    if let Some(reply) = parked.lock().pop() {
        reply.set_value("too late".to_string());
    }
    let err = channel.unary::<String, String>("/slow/Never", &"y".to_string(), &options).get().unwrap_err();
    assert_eq!(err.code(), StatusCode::DeadlineExceeded);
}

#[test]
fn test_listeners_rearm_after_every_accept() {
    let (transport, engine) = engine(3);
    let _server = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let channel = Channel::new(&engine, "loopback");
    eventually("listeners armed", || transport.pending_accepts("/greeter/Hello") == 3);

    for i in 0..20 {
        let reply: String = channel
            .unary("/greeter/Hello", &format!("n{i}"), &CallOptions::default())
            .get()
            .unwrap();
        assert_eq!(reply, format!("n{i}_replied"));
        eventually("listener re-armed", || transport.pending_accepts("/greeter/Hello") == 3);
    }
}

#[test]
fn test_default_listening_queue_subset() {
    let (transport, engine) = engine(4);
    let config = ServerConfig::new()
        .add_service(hello())
        .add_service(ServiceConfig::new("pinned").add_unary("Echo", Some(3..4), |s: String| Ok(s)))
        .add_default_listening_queues(0..2);
    let server = Server::start(&engine, config).unwrap();
    assert_eq!(server.listeners(), 3);
    assert_eq!(server.methods(), ["/greeter/Hello", "/pinned/Echo"]);
    assert_eq!(transport.pending_accepts("/greeter/Hello"), 2);
    assert_eq!(transport.pending_accepts("/pinned/Echo"), 1);

    // Calls may be submitted on any queue; matching is by path.
    let channel = Channel::new(&engine, "loopback");
    for queue in engine.queues() {
        let options = CallOptions::new().with_queue(*queue);
        let reply: String = channel.unary("/pinned/Echo", &"q".to_string(), &options).get().unwrap();
        assert_eq!(reply, "q");
    }
}

#[test]
fn test_listening_queue_out_of_range() {
    let (transport, engine) = engine(2);
    let config = ServerConfig::new().add_service(hello()).add_default_listening_queues(1..5);
    let err = Server::start(&engine, config).unwrap_err();
    assert_eq!(err.code(), StatusCode::InvalidArgument);
    assert_eq!(transport.pending_accepts("/greeter/Hello"), 0);
}

#[test]
fn test_duplicate_registration_across_servers() {
    let (_t, engine) = engine(1);
    let _first = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let err = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);

    let channel = Channel::new(&engine, "loopback");
    let reply: String = channel
        .unary("/greeter/Hello", &"still".to_string(), &CallOptions::default())
        .get()
        .unwrap();
    assert_eq!(reply, "still_replied");
}

#[test]
fn test_server_shutdown_refuses_calls_and_frees_listeners() {
    let (transport, engine) = engine(2);
    let server = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    assert_eq!(server.listeners(), 2);
    eventually("listeners registered", || engine.handle().live_handlers() == 2);

    server.shutdown();
    assert!(server.is_shut_down());
    server.shutdown();

    let channel = Channel::new(&engine, "loopback");
    let err = channel
        .unary::<String, String>("/greeter/Hello", &"late".to_string(), &CallOptions::default())
        .get()
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unavailable);

    eventually("listeners retired", || engine.handle().live_handlers() == 0);
    eventually("calls released", || transport.live_calls() == 0);
}

#[test]
fn test_engine_shutdown_with_server_running() {
    let (_t, engine) = engine(2);
    let server = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let channel = Channel::new(&engine, "loopback");
    let reply: String = channel
        .unary("/greeter/Hello", &"bye".to_string(), &CallOptions::default())
        .get()
        .unwrap();
    assert_eq!(reply, "bye_replied");

    let stats = engine.shutdown();
    assert_eq!(stats.len(), 2);
    assert!(stats.iter().map(|s| s.completions).sum::<u64>() >= 2);
    assert_eq!(engine.handle().live_handlers(), 0);
    drop(server);
}

#[test]
fn test_dropping_one_server_leaves_the_other_serving() {
    let (transport, engine) = engine(2);
    let first = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let echo = || ServiceConfig::new("echo").add_unary("Say", None, |s: String| Ok(s));
    let _second = Server::start(&engine, ServerConfig::new().add_service(echo())).unwrap();
    let channel = Channel::new(&engine, "loopback");

    drop(first);
    let reply: String = channel.unary("/echo/Say", &"still here".to_string(), &CallOptions::default()).get().unwrap();
    assert_eq!(reply, "still here");
    eventually("echo listeners armed", || transport.pending_accepts("/echo/Say") == 2);

    let err = channel
        .unary::<String, String>("/greeter/Hello", &"gone".to_string(), &CallOptions::default())
        .get()
        .unwrap_err();
    assert_eq!(err.code(), StatusCode::Unavailable);

    // The path can be served again.
    let _again = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let reply: String = channel.unary("/greeter/Hello", &"back".to_string(), &CallOptions::default()).get().unwrap();
    assert_eq!(reply, "back_replied");
}

#[test]
fn test_failed_start_rolls_back_earlier_registrations() {
    let (transport, engine) = engine(2);
    let _taken = Server::start(&engine, ServerConfig::new().add_service(hello())).unwrap();
    let fresh = || ServiceConfig::new("fresh").add_unary("Ping", None, |s: String| Ok(format!("{s}_pong")));

    let err = Server::start(&engine, ServerConfig::new().add_service(fresh()).add_service(hello())).unwrap_err();
    assert_eq!(err.code(), StatusCode::AlreadyExists);
    assert_eq!(transport.pending_accepts("/fresh/Ping"), 0);

    let _server = Server::start(&engine, ServerConfig::new().add_service(fresh())).unwrap();
    let channel = Channel::new(&engine, "loopback");
    let reply: String = channel.unary("/fresh/Ping", &"x".to_string(), &CallOptions::default()).get().unwrap();
    assert_eq!(reply, "x_pong");
    let reply: String = channel.unary("/greeter/Hello", &"y".to_string(), &CallOptions::default()).get().unwrap();
    assert_eq!(reply, "y_replied");
}
