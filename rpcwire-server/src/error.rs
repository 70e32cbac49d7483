//! Server error types.

use rpcwire_protocol::{FrameError, ProtocolError, ProtocolHash};
use std::io;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[source] ProtocolError),

    #[error("protocol mismatch: client protocol {client_hash} is unknown")]
    ProtocolMismatch { client_hash: ProtocolHash },

    #[error("handler panicked: {0}")]
    HandlerPanic(String),

    #[error("server shutting down")]
    ShuttingDown,

    #[error("{0} deadline exceeded")]
    DeadlineExceeded(&'static str),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<FrameError> for ServerError {
    fn from(e: FrameError) -> Self {
        ServerError::Protocol(ProtocolError::Frame(e))
    }
}

impl ServerError {
    /// Returns whether the operation may succeed if tried again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::Io(e) => is_temporary(e),
            ServerError::DeadlineExceeded(_) => true,
            _ => false,
        }
    }
}

/// Too many open files in the system.
#[cfg(unix)]
const ENFILE: i32 = 23;
/// Too many open files in the process.
#[cfg(unix)]
const EMFILE: i32 = 24;

/// Returns whether an accept error is transient.
///
/// Covers aborted or reset handshakes, interrupted calls, timeouts and file
/// descriptor exhaustion.
pub fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_fd_exhaustion(e)
}

#[cfg(unix)]
fn is_fd_exhaustion(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(ENFILE | EMFILE))
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_e: &io::Error) -> bool {
    false
}
