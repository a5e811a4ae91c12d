//! Streaming calls over the in-process transport.
//!
//! Serves a counter with all three streaming shapes and drives each one:
//! a countdown (server streaming), a sum (client streaming) and a running
//! total that answers every number as it arrives (bidirectional).
//!
//! # Environment Variables
//!
//! - `CQRPC_LOG=debug` - Log filter (same syntax as `RUST_LOG`)
//! - `CQRPC_NUM_QUEUES=4` - Number of completion queues
//! - `STREAM_ITEMS=10` - Numbers sent per stream

use std::sync::Arc;
use std::thread;

use cqrpc::{
    stream, Bytes, CallOptions, Channel, Engine, Loopback, Message, RpcError, Server,
    ServerConfig, ServiceConfig, StreamFuture,
};
use parking_lot::Mutex;
use tracing::info;

/// A number on the wire: eight big-endian bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Num(u64);

impl Message for Num {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        let raw: [u8; 8] = buf
            .as_ref()
            .try_into()
            .map_err(|_| RpcError::invalid_argument(format!("expected 8 bytes, got {}", buf.len())))?;
        Ok(Num(u64::from_be_bytes(raw)))
    }
}

fn counter() -> ServiceConfig {
    ServiceConfig::new("counter")
        .add_server_streaming("Countdown", None, |from: Num| {
            StreamFuture::from_items((0..=from.0).rev().map(Num))
        })
        .add_client_streaming("Sum", None, |numbers: StreamFuture<Num>| {
            numbers.collect().then(|all| Num(all.iter().map(|n| n.0).sum()))
        })
        .add_bidir_streaming("Running", None, |numbers: StreamFuture<Num>| {
            let (totals, out) = stream();
            let closer = totals.clone();
            let mut total = 0;
            numbers
                .for_each(move |n: Num| {
                    total += n.0;
                    totals.push(Num(total));
                })
                .then_finally_expect(move |result| {
                    closer.finish(result);
                });
            out
        })
}

// CQRPC_LOG=debug cargo run -p cqrpc-streaming
fn main() -> Result<(), Box<dyn std::error::Error>> {
    cqrpc::logging::init();
    let items: u64 = std::env::var("STREAM_ITEMS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let engine = Engine::from_env(Arc::new(Loopback::new()))?;
    let server = Server::start(&engine, ServerConfig::new().add_service(counter()))?;
    info!(methods = ?server.methods(), "serving");

    let channel = Channel::new(&engine, "loopback");
    let options = CallOptions::default();

    // Server streaming
    let countdown: Vec<u64> = channel
        .server_streaming::<Num, Num>("/counter/Countdown", &Num(items), &options)
        .collect()
        .get()?
        .into_iter()
        .map(|n| n.0)
        .collect();
    println!("Countdown -> {countdown:?}");

    // Client streaming, fed from another thread
    let (numbers, sum) = channel.client_streaming::<Num, Num>("/counter/Sum", &options);
    let producer = thread::spawn(move || {
        for n in 1..=items {
            numbers.push(Num(n));
        }
        numbers.complete();
    });
    println!("Sum       -> {}", sum.get()?.0);
    let _ = producer.join();

    // Bidirectional
    let (numbers, totals) = channel.bidir_streaming::<Num, Num>("/counter/Running", &options);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let done = totals.for_each(move |total| sink.lock().push(total.0));
    for n in 1..=items {
        numbers.push(Num(n));
    }
    numbers.complete();
    done.get()?;
    println!("Running   -> {:?}", seen.lock());

    drop(server);
    let stats = engine.shutdown();
    for (i, s) in stats.iter().enumerate() {
        println!(
            "queue {i}: {} completions, {} handlers released",
            s.completions, s.handlers_released
        );
    }
    Ok(())
}
