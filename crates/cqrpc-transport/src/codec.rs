//! Payload serializer interface.
//!
//! Encoding formats are an external concern: application payload types
//! implement [`Message`] with whatever format they use. The impls below
//! cover raw byte and text payloads.

use bytes::Bytes;
use cqrpc_core::RpcError;

/// A payload type that can cross the transport.
pub trait Message: Sized + Send + 'static {
    fn encode(&self) -> Bytes;

    fn decode(buf: Bytes) -> Result<Self, RpcError>;
}

impl Message for Bytes {
    fn encode(&self) -> Bytes {
        self.clone()
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        Ok(buf)
    }
}

impl Message for Vec<u8> {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        Ok(buf.to_vec())
    }
}

impl Message for String {
    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        String::from_utf8(buf.to_vec())
            .map_err(|_| RpcError::invalid_argument("payload is not valid UTF-8"))
    }
}

impl Message for () {
    fn encode(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(buf: Bytes) -> Result<Self, RpcError> {
        if buf.is_empty() {
            Ok(())
        } else {
            Err(RpcError::invalid_argument("expected an empty payload"))
        }
    }
}
