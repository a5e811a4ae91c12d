//! Status codes and the RPC error type
//!
//! Every failure that reaches application code is an [`RpcError`]: a
//! [`StatusCode`] from the fixed enumeration plus a human-readable message.
//! The same pair travels on the wire as a terminal [`Status`].

use std::any::Any;
use std::fmt;

/// Result type carried by futures and returned by handlers.
pub type Expected<T> = Result<T, RpcError>;

/// Terminal status code of an RPC.
///
/// Numeric values are the wire values and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Decode a wire value. Values outside the enumeration map to `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            2 => StatusCode::Unknown,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unknown => "unknown",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::NotFound => "not found",
            StatusCode::AlreadyExists => "already exists",
            StatusCode::PermissionDenied => "permission denied",
            StatusCode::ResourceExhausted => "resource exhausted",
            StatusCode::FailedPrecondition => "failed precondition",
            StatusCode::Aborted => "aborted",
            StatusCode::OutOfRange => "out of range",
            StatusCode::Unimplemented => "unimplemented",
            StatusCode::Internal => "internal",
            StatusCode::Unavailable => "unavailable",
            StatusCode::DataLoss => "data loss",
            StatusCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// RpcError
// ============================================================================

/// A failed RPC: status code plus message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    code: StatusCode,
    message: String,
}

macro_rules! status_constructors {
    ($($name:ident => $code:ident),+ $(,)?) => {
        $(
            #[doc = concat!("Error with status `", stringify!($code), "`.")]
            pub fn $name(message: impl Into<String>) -> Self {
                Self::new(StatusCode::$code, message)
            }
        )+
    };
}

impl RpcError {
    /// Build an error with an explicit code.
    ///
    /// `StatusCode::Ok` is not an error; it is coerced to `Unknown`.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        let code = if code == StatusCode::Ok { StatusCode::Unknown } else { code };
        Self { code, message: message.into() }
    }

    status_constructors! {
        cancelled => Cancelled,
        unknown => Unknown,
        invalid_argument => InvalidArgument,
        deadline_exceeded => DeadlineExceeded,
        not_found => NotFound,
        already_exists => AlreadyExists,
        permission_denied => PermissionDenied,
        resource_exhausted => ResourceExhausted,
        failed_precondition => FailedPrecondition,
        aborted => Aborted,
        out_of_range => OutOfRange,
        unimplemented => Unimplemented,
        internal => Internal,
        unavailable => Unavailable,
        data_loss => DataLoss,
        unauthenticated => Unauthenticated,
    }

    #[inline]
    pub fn code(&self) -> StatusCode {
        self.code
    }

    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Convert a panic payload caught at a handler boundary.
    ///
    /// A payload raised with `std::panic::panic_any(RpcError)` keeps its
    /// code; string payloads become `Unknown` with that text.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let payload = match payload.downcast::<RpcError>() {
            Ok(err) => return *err,
            Err(other) => other,
        };
        let payload = match payload.downcast::<String>() {
            Ok(msg) => return Self::unknown(*msg),
            Err(other) => other,
        };
        match payload.downcast::<&'static str>() {
            Ok(msg) => Self::unknown(*msg),
            Err(_) => Self::unknown("handler panicked"),
        }
    }

    /// Error for a promise that was dropped before it was fulfilled.
    pub fn broken_promise() -> Self {
        Self::internal("promise dropped before fulfillment")
    }
}

// ============================================================================
// Status
// ============================================================================

/// Terminal status of a call as exchanged with the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn ok() -> Self {
        Self::new(StatusCode::Ok, "")
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn into_result(self) -> Expected<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(RpcError::new(self.code, self.message))
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::ok()
    }
}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        Self { code: err.code, message: err.message }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}
