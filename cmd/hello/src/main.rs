//! Unary calls over the in-process transport.
//!
//! Starts an engine, serves a greeter with a synchronous and a deferred
//! `Hello`, then calls both, ties two calls together and lets one call run
//! into its deadline.
//!
//! # Environment Variables
//!
//! - `CQRPC_LOG=debug` - Log filter (same syntax as `RUST_LOG`)
//! - `CQRPC_NUM_QUEUES=4` - Number of completion queues

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cqrpc::{
    promise, tie, CallOptions, Channel, Engine, Loopback, Promise, Server, ServerConfig,
    ServiceConfig,
};
use parking_lot::Mutex;
use tracing::info;

// CQRPC_LOG=debug cargo run -p cqrpc-hello
fn main() -> Result<(), Box<dyn std::error::Error>> {
    cqrpc::logging::init();

    let engine = Engine::from_env(Arc::new(Loopback::new()))?;
    let parked: Arc<Mutex<Vec<Promise<String>>>> = Arc::default();
    let sink = parked.clone();

    let greeter = ServiceConfig::new("greeter")
        .add_unary("Hello", None, |name: String| Ok(format!("{name}_replied")))
        .add_unary_async("HelloLater", None, |name: String| {
            let (reply, future) = promise();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                reply.set_value(format!("{name}_replied_later"));
            });
            future
        })
        .add_unary_async("Stall", None, move |_: String| {
            let (reply, future) = promise::<String>();
            sink.lock().push(reply);
            future
        });
    let server = Server::start(&engine, ServerConfig::new().add_service(greeter))?;
    info!(methods = ?server.methods(), listeners = server.listeners(), "serving");

    let channel = Channel::new(&engine, "loopback");
    let options = CallOptions::default();

    let reply: String = channel.unary("/greeter/Hello", &"dude".to_string(), &options).get()?;
    println!("Hello      -> {reply}");

    let reply: String = channel.unary("/greeter/HelloLater", &"dude".to_string(), &options).get()?;
    println!("HelloLater -> {reply}");

    let (a, b) = tie((
        channel.unary::<String, String>("/greeter/Hello", &"left".to_string(), &options),
        channel.unary::<String, String>("/greeter/HelloLater", &"right".to_string(), &options),
    ))
    .get()?;
    println!("tie        -> ({a}, {b})");

    let hurried = CallOptions::new().with_timeout(Duration::from_millis(100));
    match channel.unary::<String, String>("/greeter/Stall", &"dude".to_string(), &hurried).get() {
        Ok(reply) => println!("Stall      -> {reply}"),
        Err(err) => println!("Stall      -> {err}"),
    }

    match channel.unary::<String, String>("/greeter/Missing", &"dude".to_string(), &options).get() {
        Ok(reply) => println!("Missing    -> {reply}"),
        Err(err) => println!("Missing    -> {err}"),
    }

    server.shutdown();
    let stats = engine.shutdown();
    drop(parked);
    let completions: u64 = stats.iter().map(|s| s.completions).sum();
    println!("\n{} queues, {completions} completions", stats.len());
    Ok(())
}
