//! # rpcwire-server
//!
//! TCP server for rpcwire.
//!
//! This crate provides:
//! - Server-side handshake negotiation with a shared protocol cache
//! - Per-connection serving with read, write and idle timeouts
//! - Pluggable request handlers
//! - Graceful and immediate shutdown
//! - Layered configuration (defaults, YAML file, environment)

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod negotiator;
pub mod server;

pub use config::{Config, ConfigError, NetworkConfig, ProtocolConfig, ShutdownConfig};
pub use connection::{ConnState, StateCell};
pub use error::ServerError;
pub use handler::{Handler, ResponseWriter};
pub use negotiator::{Negotiation, Negotiator};
pub use server::{Server, ServerConfig, ServerStats, StatsSnapshot};
