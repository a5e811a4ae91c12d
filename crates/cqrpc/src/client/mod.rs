//! Initiator side: [`Channel`], [`MethodStub`] and the four call shapes.

mod bidir;
mod channel;
mod client_streaming;
mod server_streaming;
mod unary;

pub use channel::{CallOptions, Channel, MethodStub};
