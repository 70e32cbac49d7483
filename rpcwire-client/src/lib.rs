//! # rpcwire-client
//!
//! Client library for rpcwire.
//!
//! This crate provides:
//! - Async TCP connection carrying framed messages
//! - Handshake negotiation that learns and caches the server's protocol
//! - Calls of named messages and pings

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
