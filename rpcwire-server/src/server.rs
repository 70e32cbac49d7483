//! TCP server implementation.

use crate::connection::{non_zero, unix_secs, ConnHandle, ConnState, Connection, ConnectionContext};
use crate::error::{is_temporary, ServerError};
use crate::handler::Handler;
use crate::negotiator::Negotiator;
use parking_lot::Mutex;
use rpcwire_protocol::{
    JsonProtocolParser, Protocol, ProtocolCache, ProtocolParser, DEFAULT_MAX_MESSAGE_SIZE,
    DEFAULT_PORT,
};
use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Interval between idle-connection sweeps during a graceful shutdown.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause before accepting again after a transient accept error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server configuration.
///
/// A zero duration disables the corresponding timeout.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Time allowed to read one message.
    pub read_timeout: Duration,
    /// Time allowed to write one response.
    pub write_timeout: Duration,
    /// Time an idle connection waits for its next message. Falls back to
    /// `read_timeout` when zero.
    pub idle_timeout: Duration,
    /// Largest logical message accepted, in bytes.
    pub max_message_size: usize,
    /// Age after which a connection that has not sent a message yet may be
    /// closed by [`Server::shutdown`]. Zero keeps such connections open.
    pub new_conn_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            new_conn_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_new_conn_grace(mut self, grace: Duration) -> Self {
        self.new_conn_grace = grace;
        self
    }

    /// Returns the effective idle timeout.
    pub fn effective_idle_timeout(&self) -> Duration {
        if self.idle_timeout.is_zero() {
            self.read_timeout
        } else {
            self.idle_timeout
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// A point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_total: u64,
    pub errors_total: u64,
}

impl ServerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<u64, CancellationToken>,
    conns: HashMap<u64, ConnHandle>,
}

/// State shared between the server and its connection tasks.
#[derive(Default)]
pub(crate) struct Shared {
    in_shutdown: AtomicBool,
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    pub stats: ServerStats,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn is_shutting_down(&self) -> bool {
        self.in_shutdown.load(Ordering::SeqCst)
    }

    /// Registers a listener. Fails once shutdown has begun.
    fn track_listener(&self, id: u64, stop: CancellationToken) -> bool {
        let mut registry = self.registry.lock();
        if self.is_shutting_down() {
            return false;
        }
        registry.listeners.insert(id, stop);
        true
    }

    fn untrack_listener(&self, id: u64) {
        self.registry.lock().listeners.remove(&id);
    }

    /// Registers a connection. Once shutdown has begun the connection is
    /// closed instead, so a stream accepted while closing is not served.
    pub(crate) fn track_conn(&self, id: u64, handle: ConnHandle) {
        let mut registry = self.registry.lock();
        if self.is_shutting_down() {
            handle.close.cancel();
            return;
        }
        registry.conns.insert(id, handle);
    }

    pub(crate) fn untrack_conn(&self, id: u64) {
        self.registry.lock().conns.remove(&id);
    }

    /// Marks shutdown and stops every listener.
    fn begin_shutdown(&self) {
        let mut registry = self.registry.lock();
        self.in_shutdown.store(true, Ordering::SeqCst);
        for (_, stop) in registry.listeners.drain() {
            stop.cancel();
        }
    }

    /// Closes idle connections, and `New` ones older than `grace` if given.
    /// Returns whether no connection is left.
    fn close_idle_conns(&self, grace: Option<Duration>) -> bool {
        let now = unix_secs();
        let mut registry = self.registry.lock();
        registry.conns.retain(|_, conn| {
            let (state, since) = conn.state.load();
            let closable = match state {
                ConnState::Idle | ConnState::Closed => true,
                ConnState::New => grace.map_or(false, |grace| {
                    Duration::from_secs(now.saturating_sub(since)) >= grace
                }),
                ConnState::Active => false,
            };
            if closable {
                conn.close.cancel();
            }
            !closable
        });
        registry.conns.is_empty()
    }

    pub(crate) fn conn_count(&self) -> usize {
        self.registry.lock().conns.len()
    }
}

/// TCP server for rpcwire.
pub struct Server {
    config: ServerConfig,
    protocol: Arc<dyn Protocol>,
    handler: Arc<dyn Handler>,
    cache: Arc<ProtocolCache>,
    parser: Arc<dyn ProtocolParser>,
    shared: Arc<Shared>,
}

impl Server {
    /// Creates a new server speaking `protocol` and dispatching calls to
    /// `handler`.
    pub fn new(config: ServerConfig, protocol: Arc<dyn Protocol>, handler: Arc<dyn Handler>) -> Self {
        Self {
            config,
            protocol,
            handler,
            cache: Arc::new(ProtocolCache::new()),
            parser: Arc::new(JsonProtocolParser),
            shared: Arc::new(Shared::default()),
        }
    }

    /// Uses `cache` for client protocols instead of a private one.
    pub fn with_cache(mut self, cache: Arc<ProtocolCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses `parser` for client protocols sent during handshakes.
    pub fn with_parser(mut self, parser: Arc<dyn ProtocolParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn protocol(&self) -> &Arc<dyn Protocol> {
        &self.protocol
    }

    pub fn cache(&self) -> &Arc<ProtocolCache> {
        &self.cache
    }

    /// Binds the configured address and serves on it.
    pub async fn listen_and_serve(&self) -> Result<(), ServerError> {
        if self.shared.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` and serves each on its own task.
    ///
    /// Returns [`ServerError::ShuttingDown`] once the server is closed or
    /// shut down, or the first accept error that is not transient.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.protocol.describe().is_empty() {
            return Err(ServerError::Config("protocol is required".to_string()));
        }

        let listener_id = self.shared.next_id();
        let stop = CancellationToken::new();
        if !self.shared.track_listener(listener_id, stop.clone()) {
            return Err(ServerError::ShuttingDown);
        }

        let local_addr = listener.local_addr()?;
        tracing::info!(
            %local_addr,
            protocol = self.protocol.name(),
            hash = %self.protocol.hash(),
            "Server listening"
        );

        let ctx = Arc::new(ConnectionContext {
            handler: self.handler.clone(),
            negotiator: Negotiator::new(
                self.protocol.clone(),
                self.cache.clone(),
                self.parser.clone(),
            ),
            read_timeout: non_zero(self.config.read_timeout),
            write_timeout: non_zero(self.config.write_timeout),
            idle_timeout: non_zero(self.config.effective_idle_timeout()),
            max_message_size: self.config.max_message_size,
            shared: self.shared.clone(),
        });

        let result = loop {
            let accepted = tokio::select! {
                _ = stop.cancelled() => break Err(ServerError::ShuttingDown),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => self.spawn_connection(stream, addr, &ctx),
                Err(_) if self.shared.is_shutting_down() => break Err(ServerError::ShuttingDown),
                Err(e) if is_temporary(&e) => {
                    tracing::warn!(error = %e, "Accept error, retrying");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed");
                    break Err(ServerError::Io(e));
                }
            }
        };

        self.shared.untrack_listener(listener_id);
        tracing::info!(%local_addr, "Listener closed");
        result
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr, ctx: &Arc<ConnectionContext>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(remote_addr = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let conn = Connection::new(self.shared.next_id(), stream, addr.to_string(), ctx.clone());
        tokio::spawn(conn.serve());
    }

    /// Closes every listener and connection immediately.
    ///
    /// In-flight calls are interrupted; use [`Server::shutdown`] to let them
    /// finish.
    pub fn close(&self) {
        self.shared.begin_shutdown();
        let mut registry = self.shared.registry.lock();
        let count = registry.conns.len();
        for (_, conn) in registry.conns.drain() {
            conn.close.cancel();
        }
        tracing::info!(connections = count, "Server closed");
    }

    /// Shuts the server down gracefully within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ServerError> {
        self.shutdown_with(tokio::time::sleep(timeout)).await
    }

    /// Shuts the server down gracefully.
    ///
    /// Stops all listeners, then closes connections as they become idle
    /// until none remain. If `signal` completes first, returns
    /// [`ServerError::DeadlineExceeded`] and leaves the remaining
    /// connections open; call [`Server::close`] to drop them.
    pub async fn shutdown_with<F: Future>(&self, signal: F) -> Result<(), ServerError> {
        self.shared.begin_shutdown();
        tracing::info!("Server shutting down");

        let grace = non_zero(self.config.new_conn_grace);
        tokio::pin!(signal);
        let mut ticker = tokio::time::interval(SHUTDOWN_POLL_INTERVAL);
        loop {
            if self.shared.close_idle_conns(grace) {
                tracing::info!("Server shut down");
                return Ok(());
            }

            tokio::select! {
                _ = &mut signal => {
                    tracing::warn!(
                        connections = self.shared.conn_count(),
                        "Shutdown deadline exceeded"
                    );
                    return Err(ServerError::DeadlineExceeded("shutdown"));
                }
                _ = ticker.tick() => {}
            }
        }
    }

    /// Returns whether close or shutdown has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }

    /// Returns the number of tracked connections.
    pub fn connection_count(&self) -> usize {
        self.shared.conn_count()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.shared.stats
    }
}
