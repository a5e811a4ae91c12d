#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cqrpc::{Bytes, Engine, EngineConfig, Loopback, Message, RpcError};

/// A small fixed-width payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count(pub u32);

impl Message for Count {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        let raw: [u8; 4] = buf
            .as_ref()
            .try_into()
            .map_err(|_| RpcError::invalid_argument("count must be 4 bytes"))?;
        Ok(Count(u32::from_be_bytes(raw)))
    }
}

pub fn engine(queues: usize) -> (Arc<Loopback>, Arc<Engine>) {
    let transport = Arc::new(Loopback::new());
    let engine = Engine::start(transport.clone(), EngineConfig::new().num_queues(queues)).unwrap();
    (transport, engine)
}

/// Poll `cond` until it holds or a few seconds pass.
pub fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(2));
    }
}
