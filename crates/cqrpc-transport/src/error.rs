//! Transport-level errors.

use cqrpc_core::RpcError;

/// Failure to submit work to the transport.
///
/// These never cross the wire; at the state-machine boundary they become
/// `RpcError::internal`, except duplicate registration which becomes
/// `already_exists`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("completion queue is shut down")]
    QueueShutdown,

    #[error("unknown completion queue {0}")]
    UnknownQueue(u32),

    #[error("call already terminated")]
    CallTerminated,

    #[error("unknown call handle")]
    UnknownCall,

    #[error("method {0} is already registered")]
    DuplicateMethod(String),

    #[error("unknown method registration")]
    UnknownMethod,

    #[error("invalid batch: {0}")]
    InvalidBatch(&'static str),

    #[error("transport is shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::DuplicateMethod(_) => RpcError::already_exists(err.to_string()),
            other => RpcError::internal(format!("failed to start call batch: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqrpc_core::StatusCode;

    #[test]
    fn test_conversion_to_rpc_error() {
        let err: RpcError = TransportError::CallTerminated.into();
        assert_eq!(err.code(), StatusCode::Internal);
        assert!(err.message().contains("call already terminated"));

        let err: RpcError = TransportError::DuplicateMethod("/a/b".into()).into();
        assert_eq!(err.code(), StatusCode::AlreadyExists);

        let err: RpcError = TransportError::QueueShutdown.into();
        assert_eq!(err.code(), StatusCode::Internal);
    }
}
