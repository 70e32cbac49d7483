//! Protocol error types.

use std::io;
use thiserror::Error;

/// Errors raised while splitting a byte stream into frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame header: stream ended after {got} of 4 bytes")]
    InvalidHeader { got: usize },

    #[error("truncated frame after {copied} bytes: {source}")]
    Truncated {
        /// Bytes copied into the caller's buffer before the failure.
        copied: usize,
        #[source]
        source: io::Error,
    },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Returns whether the peer closed the stream on a message boundary.
    pub fn is_closed(&self) -> bool {
        matches!(self, FrameError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// Returns whether the error came from an elapsed I/O deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            FrameError::Io(e) | FrameError::Truncated { source: e, .. } => {
                e.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

/// Protocol-level errors that can occur while encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("error reading {field}: {reason}")]
    Decode { field: &'static str, reason: String },

    #[error("no message with name {0}")]
    UnknownMessage(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("body already consumed")]
    BodyConsumed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Creates a decode error for the named field.
    pub fn decode(field: &'static str, reason: impl Into<String>) -> Self {
        ProtocolError::Decode {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_names_field() {
        let err = ProtocolError::decode("message name", "unexpected end of data");
        let msg = err.to_string();
        assert!(msg.contains("message name"));
        assert!(msg.contains("unexpected end of data"));
    }

    #[test]
    fn test_frame_error_classification() {
        let closed = FrameError::Io(io::ErrorKind::UnexpectedEof.into());
        assert!(closed.is_closed());
        assert!(!closed.is_timeout());

        let timeout = FrameError::Truncated {
            copied: 3,
            source: io::ErrorKind::TimedOut.into(),
        };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_closed());

        let header = FrameError::InvalidHeader { got: 1 };
        assert!(header.to_string().contains("1 of 4"));
    }

    #[test]
    fn test_frame_error_converts() {
        let err: ProtocolError = FrameError::MessageTooLarge { size: 10, max: 5 }.into();
        assert!(matches!(err, ProtocolError::Frame(_)));
        assert!(err.to_string().contains("10"));
    }
}
