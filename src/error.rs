/*!
 * Error types for skyhaul transfers
 *
 * Transport failures below the protocol, protocol failures reported by the
 * service, local I/O on the caller's files and sinks, validation failures,
 * and cancellation.
 * Errors are `Clone` so a download session can latch one failure and hand
 * the same value to every later `read`.
 */

use skyhaul_core_resilience::Operation;
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

/// Errors produced by the transfer engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    /// Connection, timeout or body-stream failure below the protocol layer
    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// The service answered with a non-success status
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Reading a local source or writing a local sink failed
    #[error("local I/O error ({kind}): {message}")]
    Local { kind: io::ErrorKind, message: String },

    /// Local validation failed before anything was sent
    #[error("validation error: {0}")]
    Validation(String),

    /// The session or the caller cancelled the operation
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Sub-kind of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Connect,
    Timeout,
    Io,
    Body,
    /// A range response carried fewer or more bytes than requested
    ShortRead,
    Other,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Connect => write!(f, "connect"),
            TransportKind::Timeout => write!(f, "timeout"),
            TransportKind::Io => write!(f, "io"),
            TransportKind::Body => write!(f, "body"),
            TransportKind::ShortRead => write!(f, "short read"),
            TransportKind::Other => write!(f, "other"),
        }
    }
}

/// Why an operation was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The reader or session was closed by its owner
    Closed,
    /// The caller's cancellation token fired
    Caller,
    /// The caller's deadline expired
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Closed => write!(f, "closed"),
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// A failure reported by the remote service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation}: {status}: {message}")]
pub struct ProtocolError {
    /// Which remote call failed
    pub operation: Operation,

    /// HTTP status code
    pub status: u16,

    /// Service error code (e.g. `expired_auth_token`), empty when unknown
    pub code: String,

    /// Human readable message from the service
    pub message: String,

    /// Server-supplied wait before retrying, if any
    pub retry_after: Option<Duration>,
}

impl ProtocolError {
    pub fn new(operation: Operation, status: u16, message: impl Into<String>) -> Self {
        Self {
            operation,
            status,
            code: String::new(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = code.into();
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl TransferError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        TransferError::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TransferError::Validation(message.into())
    }

    /// Wrap a failure of the caller's own file or sink. Never retried.
    pub fn local(err: io::Error) -> Self {
        TransferError::Local {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    /// True for any cancellation, including deadline expiry
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled(_))
    }

    /// True for errors that never reached the protocol layer
    pub fn is_transport(&self) -> bool {
        matches!(self, TransferError::Transport { .. })
    }

    /// True for failures of local files and sinks
    pub fn is_local(&self) -> bool {
        matches!(self, TransferError::Local { .. })
    }

    /// HTTP status, for protocol errors
    pub fn status(&self) -> Option<u16> {
        match self {
            TransferError::Protocol(e) => Some(e.status),
            _ => None,
        }
    }

    /// Failed operation, for protocol errors
    pub fn operation(&self) -> Option<Operation> {
        match self {
            TransferError::Protocol(e) => Some(e.operation),
            _ => None,
        }
    }

    /// Server-supplied wait, for protocol errors that carry one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::Protocol(e) => e.retry_after,
            _ => None,
        }
    }

    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TransferError::Validation(_)
            | TransferError::Config(_)
            | TransferError::Local { .. } => EXIT_FATAL,
            TransferError::Protocol(e) if e.status == 401 || e.status == 403 => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => TransportKind::Timeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => TransportKind::Connect,
            _ => TransportKind::Io,
        };
        TransferError::transport(kind, err.to_string())
    }
}
