//! # rpcwire-protocol
//!
//! Wire protocol implementation for rpcwire, a binary RPC transport in the
//! Avro IPC family.
//!
//! This crate provides:
//! - Length-prefixed framing of logical messages
//! - Handshake records and the protocol cache
//! - Request/Response envelopes with call metadata
//! - Protocol descriptors and content hashes

pub mod binary;
pub mod cache;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod metadata;

pub use cache::ProtocolCache;
pub use descriptor::{
    JsonProtocol, JsonProtocolParser, Message, Protocol, ProtocolHash, ProtocolParser, HASH_SIZE,
};
pub use error::{FrameError, ProtocolError};
pub use frame::{FrameReader, FrameWriter, END_OF_MESSAGE, FRAME_BUF_SIZE, FRAME_HEADER_SIZE};
pub use handshake::{HandshakeMatch, HandshakeRequest, HandshakeResponse};
pub use message::{Body, Request, Response};
pub use metadata::Metadata;

/// Default port for the rpcwire server.
pub const DEFAULT_PORT: u16 = 8090;

/// Default limit on the size of one logical message (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
