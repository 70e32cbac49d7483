//! Per-connection serving loop and lifecycle state.

use crate::error::ServerError;
use crate::handler::{Handler, ResponseWriter};
use crate::negotiator::Negotiator;
use crate::server::Shared;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use rpcwire_protocol::{FrameReader, FrameWriter, HandshakeResponse, Protocol, Request, Response};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Upper bound on flushing a closing connection when no write timeout is set.
const CLOSE_FLUSH_LIMIT: Duration = Duration::from_secs(5);

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, no message read yet.
    New = 0,
    /// Reading or serving a message.
    Active = 1,
    /// Waiting for the next message.
    Idle = 2,
    /// Torn down.
    Closed = 3,
}

impl ConnState {
    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            _ => ConnState::Closed,
        }
    }
}

/// A connection state and the unix second it was entered, packed into one
/// atomic word: tag in the low 8 bits, timestamp above.
#[derive(Debug)]
pub struct StateCell(AtomicU64);

impl StateCell {
    pub fn new(state: ConnState) -> Self {
        Self(AtomicU64::new(pack(state, unix_secs())))
    }

    pub fn store(&self, state: ConnState) {
        self.0.store(pack(state, unix_secs()), Ordering::Release);
    }

    /// Returns the current state and when it was entered.
    pub fn load(&self) -> (ConnState, u64) {
        let word = self.0.load(Ordering::Acquire);
        (ConnState::from_tag(word as u8), word >> 8)
    }

    pub fn state(&self) -> ConnState {
        self.load().0
    }
}

fn pack(state: ConnState, secs: u64) -> u64 {
    (secs << 8) | state as u64
}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// What the server keeps about a live connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    pub state: Arc<StateCell>,
    pub close: CancellationToken,
}

/// Settings and collaborators shared by every connection of one listener.
pub(crate) struct ConnectionContext {
    pub handler: Arc<dyn Handler>,
    pub negotiator: Negotiator,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub max_message_size: usize,
    pub shared: Arc<Shared>,
}

/// One accepted stream and its serving state.
pub(crate) struct Connection<S> {
    id: u64,
    remote_addr: String,
    reader: FrameReader<BufReader<ReadHalf<S>>>,
    writer: FrameWriter<BufWriter<WriteHalf<S>>>,
    state: Arc<StateCell>,
    close: CancellationToken,
    /// The client's protocol, once a handshake succeeded.
    remote: Option<Arc<dyn Protocol>>,
    ctx: Arc<ConnectionContext>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wraps an accepted stream and registers it with the server as `New`.
    pub fn new(id: u64, stream: S, remote_addr: String, ctx: Arc<ConnectionContext>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let state = Arc::new(StateCell::new(ConnState::New));
        let close = CancellationToken::new();

        ctx.shared.track_conn(
            id,
            ConnHandle {
                state: state.clone(),
                close: close.clone(),
            },
        );
        ctx.shared.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        ctx.shared.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        Self {
            id,
            remote_addr,
            reader: FrameReader::new(BufReader::new(read_half)),
            writer: FrameWriter::new(BufWriter::new(write_half)),
            state,
            close,
            remote: None,
            ctx,
        }
    }

    /// Serves messages until the peer leaves, an error occurs, or the server
    /// closes the connection. Teardown runs on every exit, panics included.
    pub async fn serve(mut self) {
        tracing::info!(conn_id = self.id, remote_addr = %self.remote_addr, "Client connected");

        let result = AssertUnwindSafe(self.serve_loop()).catch_unwind().await;
        let result = match result {
            Ok(result) => result,
            Err(payload) => Err(ServerError::HandlerPanic(panic_message(payload))),
        };

        match result {
            Ok(()) | Err(ServerError::ShuttingDown) => {}
            Err(ServerError::HandlerPanic(ref msg)) => {
                tracing::error!(conn_id = self.id, panic = %msg, "Handler panicked, closing connection");
                self.ctx.shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!(conn_id = self.id, error = %e, "Connection error");
                self.ctx.shared.stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.teardown().await;
    }

    async fn serve_loop(&mut self) -> Result<(), ServerError> {
        loop {
            let read = with_deadline(
                self.ctx.read_timeout,
                "read",
                self.reader.read_message(self.ctx.max_message_size),
            );
            let message = tokio::select! {
                biased;
                _ = self.close.cancelled() => return Err(ServerError::ShuttingDown),
                message = read => message?,
            };
            let Some(message) = message else {
                tracing::debug!(conn_id = self.id, "Connection closed by client");
                return Ok(());
            };

            self.state.store(ConnState::Active);
            self.ctx.shared.stats.requests_total.fetch_add(1, Ordering::Relaxed);
            self.serve_message(message).await?;
            self.state.store(ConnState::Idle);

            // Wait for the first byte of the next message
            let wait = with_deadline(self.ctx.idle_timeout, "idle", self.reader.wait_readable());
            let readable = tokio::select! {
                biased;
                _ = self.close.cancelled() => return Err(ServerError::ShuttingDown),
                readable = wait => readable,
            };
            match readable {
                Ok(true) => self.state.store(ConnState::Active),
                Ok(false) => {
                    tracing::debug!(conn_id = self.id, "Connection closed by client");
                    return Ok(());
                }
                Err(ServerError::DeadlineExceeded(_)) => {
                    tracing::debug!(conn_id = self.id, "Idle timeout");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Negotiates if needed, then dispatches the call and writes the reply.
    async fn serve_message(&mut self, message: BytesMut) -> Result<(), ServerError> {
        let mut message = message.freeze();

        let mut handshake = None;
        if self.remote.is_none() {
            let negotiation = self.ctx.negotiator.negotiate(&mut message)?;
            tracing::debug!(
                conn_id = self.id,
                matched = %negotiation.matched(),
                "Handshake"
            );
            match negotiation.remote {
                Some(remote) => self.remote = Some(remote),
                None => {
                    let err = ServerError::ProtocolMismatch {
                        client_hash: negotiation.client_hash,
                    };
                    tracing::warn!(conn_id = self.id, error = %err, "Handshake failed to match");
                    // The call is dropped; the client resends with its protocol
                    return self.write_reply(Some(negotiation.response), None).await;
                }
            }
            handshake = Some(negotiation.response);
        }

        // Cancelled once the response is flushed or the call fails
        let cancel = self.close.child_token();
        let result = match self.dispatch(&mut message, cancel.clone()).await {
            Ok(response) => self.write_reply(handshake, Some(response)).await,
            Err(e) => Err(e),
        };
        cancel.cancel();
        result
    }

    async fn dispatch(
        &mut self,
        message: &mut Bytes,
        cancel: CancellationToken,
    ) -> Result<Response, ServerError> {
        let mut request = Request::read(message)?;
        request.set_remote_addr(self.remote_addr.clone());

        if request.is_ping() {
            tracing::debug!(conn_id = self.id, "Ping");
            return Ok(Response::ok(Bytes::new()));
        }

        let local = self.ctx.negotiator.local().clone();
        if local.message(&request.name).is_none() {
            tracing::warn!(conn_id = self.id, message = %request.name, "Unknown message");
            return Ok(Response::system_error(&format!(
                "unknown message: {}",
                request.name
            )));
        }
        request.set_protocol(local);

        tracing::debug!(conn_id = self.id, message = %request.name, "Request");
        let request = request.with_context(cancel);
        let mut w = ResponseWriter::new();
        let served = tokio::select! {
            biased;
            _ = self.close.cancelled() => false,
            _ = self.ctx.handler.serve(&mut w, request) => true,
        };
        if !served {
            return Err(ServerError::ShuttingDown);
        }

        let response = w.into_response();
        tracing::debug!(
            conn_id = self.id,
            error = response.error,
            bytes = response.body.len(),
            "Response"
        );
        Ok(response)
    }

    /// Writes an optional handshake response and an optional call response
    /// as one logical message. A server close interrupts a blocked write.
    async fn write_reply(
        &mut self,
        handshake: Option<HandshakeResponse>,
        response: Option<Response>,
    ) -> Result<(), ServerError> {
        let writer = &mut self.writer;
        let write = async move {
            if let Some(handshake) = handshake {
                let mut buf = BytesMut::new();
                handshake.encode(&mut buf);
                writer.write(&buf).await?;
            }
            if let Some(mut response) = response {
                response.write(&mut *writer).await?;
            }
            writer.end_message().await?;
            Ok::<(), ServerError>(())
        };
        let write = with_deadline(self.ctx.write_timeout, "write", write);
        tokio::select! {
            biased;
            _ = self.close.cancelled() => Err(ServerError::ShuttingDown),
            written = write => written,
        }
    }

    async fn teardown(mut self) {
        // A server close drops the stream without waiting on the peer
        let forced = self.close.is_cancelled();
        self.state.store(ConnState::Closed);
        self.close.cancel();

        if !forced {
            let limit = self.ctx.write_timeout.unwrap_or(CLOSE_FLUSH_LIMIT);
            let inner = self.writer.get_mut();
            if let Err(e) = with_deadline(Some(limit), "close", inner.shutdown()).await {
                tracing::debug!(conn_id = self.id, error = %e, "Error closing connection");
            }
        }

        self.ctx.shared.untrack_conn(self.id);
        self.ctx
            .shared
            .stats
            .connections_active
            .fetch_sub(1, Ordering::Relaxed);
        tracing::info!(conn_id = self.id, remote_addr = %self.remote_addr, "Client disconnected");
    }
}

/// Runs `fut` under an optional deadline.
async fn with_deadline<T, E, F>(
    limit: Option<Duration>,
    what: &'static str,
    fut: F,
) -> Result<T, ServerError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<ServerError>,
{
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(ServerError::DeadlineExceeded(what)),
        },
        None => fut.await.map_err(Into::into),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Returns the timeout, treating zero as none.
pub(crate) fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rpcwire_protocol::{
        HandshakeRequest, JsonProtocol, JsonProtocolParser, ProtocolCache,
    };
    use tokio::io::DuplexStream;

    const PROTOCOL: &str = r#"{"protocol":"test","messages":{"echo":{"request":[],"response":"bytes"}}}"#;

    /// Keeps the call's context and answers with a reply larger than the
    /// test pipe.
    #[derive(Default)]
    struct Capture(parking_lot::Mutex<Option<CancellationToken>>);

    #[async_trait]
    impl Handler for Capture {
        async fn serve(&self, w: &mut ResponseWriter, req: Request) {
            *self.0.lock() = Some(req.context().clone());
            w.write(&[0x42; 8192]);
        }
    }

    fn context(handler: Arc<Capture>) -> Arc<ConnectionContext> {
        let protocol: Arc<dyn Protocol> = Arc::new(JsonProtocol::parse(PROTOCOL).unwrap());
        Arc::new(ConnectionContext {
            handler,
            negotiator: Negotiator::new(
                protocol,
                Arc::new(ProtocolCache::new()),
                Arc::new(JsonProtocolParser),
            ),
            read_timeout: None,
            write_timeout: None,
            idle_timeout: None,
            max_message_size: 1 << 20,
            shared: Arc::new(Shared::default()),
        })
    }

    async fn send_echo(client: &mut DuplexStream) {
        let protocol = JsonProtocol::parse(PROTOCOL).unwrap();
        let mut buf = BytesMut::new();
        HandshakeRequest {
            client_hash: protocol.hash(),
            client_protocol: Some(protocol.describe().to_string()),
            server_hash: protocol.hash(),
            meta: None,
        }
        .encode(&mut buf);
        Request::new(Arc::new(protocol), "echo", Bytes::new())
            .unwrap()
            .encode(&mut buf)
            .unwrap();

        let mut writer = FrameWriter::new(client);
        writer.write(&buf).await.unwrap();
        writer.end_message().await.unwrap();
    }

    async fn captured(handler: &Capture) -> CancellationToken {
        loop {
            if let Some(token) = handler.0.lock().clone() {
                return token;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_call_context_outlives_blocked_write() {
        let (mut client, server) = tokio::io::duplex(64);
        let handler = Arc::new(Capture::default());
        let conn = Connection::new(1, server, "pipe".to_string(), context(handler.clone()));
        tokio::spawn(conn.serve());

        send_echo(&mut client).await;
        let token = captured(&handler).await;

        // The reply cannot be flushed until the client reads it
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());

        let mut reader = FrameReader::new(&mut client);
        let reply = reader.read_message(1 << 20).await.unwrap().unwrap();
        assert!(reply.len() > 8192);

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        let (mut client, server) = tokio::io::duplex(64);
        let handler = Arc::new(Capture::default());
        let ctx = context(handler.clone());
        let conn = Connection::new(1, server, "pipe".to_string(), ctx.clone());
        let close = conn.close.clone();
        let task = tokio::spawn(conn.serve());

        send_echo(&mut client).await;
        captured(&handler).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ctx.shared.stats.connections_active.load(Ordering::Relaxed), 1);

        // The client never reads the reply
        close.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.shared.stats.connections_active.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.shared.conn_count(), 0);
    }

    #[test]
    fn test_state_packing() {
        let cell = StateCell::new(ConnState::New);
        let (state, since) = cell.load();
        assert_eq!(state, ConnState::New);
        assert!(since > 0);

        for next in [ConnState::Active, ConnState::Idle, ConnState::Closed] {
            cell.store(next);
            assert_eq!(cell.state(), next);
        }
    }

    #[test]
    fn test_pack_keeps_timestamp() {
        let word = pack(ConnState::Idle, 1_700_000_000);
        assert_eq!(word as u8, ConnState::Idle as u8);
        assert_eq!(word >> 8, 1_700_000_000);
    }

    #[test]
    fn test_non_zero() {
        assert_eq!(non_zero(Duration::ZERO), None);
        assert_eq!(non_zero(Duration::from_millis(5)), Some(Duration::from_millis(5)));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("boom")), "boom");
        assert_eq!(panic_message(Box::new(String::from("bang"))), "bang");
        assert_eq!(panic_message(Box::new(7u8)), "unknown panic");
    }

    #[tokio::test]
    async fn test_with_deadline() {
        let ok = with_deadline(None, "read", async { Ok::<_, ServerError>(1) }).await;
        assert_eq!(ok.unwrap(), 1);

        let slow = with_deadline(
            Some(Duration::from_millis(10)),
            "read",
            std::future::pending::<Result<(), ServerError>>(),
        )
        .await;
        assert!(matches!(slow, Err(ServerError::DeadlineExceeded("read"))));
    }
}
