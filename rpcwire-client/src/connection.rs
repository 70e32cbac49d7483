//! Connection management.

use crate::error::ClientError;
use bytes::Bytes;
use rpcwire_protocol::{FrameReader, FrameWriter, DEFAULT_MAX_MESSAGE_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Time allowed for one request/response exchange.
    pub request_timeout: Duration,
    /// Largest response message accepted, in bytes.
    pub max_message_size: usize,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }
}

struct Transport {
    reader: FrameReader<BufReader<OwnedReadHalf>>,
    writer: FrameWriter<BufWriter<OwnedWriteHalf>>,
}

/// A connection to an rpcwire server.
///
/// Exchanges are serialized: one logical message is written and its reply
/// read before the next exchange starts.
pub struct Connection {
    config: ConnectionConfig,
    transport: Mutex<Option<Transport>>,
    connected: AtomicBool,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            transport: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        *self.transport.lock().await = Some(Transport {
            reader: FrameReader::new(BufReader::new(read_half)),
            writer: FrameWriter::new(BufWriter::new(write_half)),
        });
        self.connected.store(true, Ordering::SeqCst);

        tracing::debug!("Connected to {}", self.config.addr);
        Ok(())
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Writes `message` as one logical message and reads the reply.
    ///
    /// Any failure drops the stream, since its framing state is unknown.
    pub async fn exchange(&self, message: &[u8]) -> Result<Bytes, ClientError> {
        let mut guard = self.transport.lock().await;
        let transport = guard.as_mut().ok_or(ClientError::NotConnected)?;
        let max = self.config.max_message_size;

        let result = tokio::time::timeout(self.config.request_timeout, async {
            transport.writer.write(message).await?;
            transport.writer.end_message().await?;

            let reply = transport
                .reader
                .read_message(max)
                .await?
                .ok_or(ClientError::ConnectionClosed)?;
            Ok::<_, ClientError>(reply.freeze())
        })
        .await
        .unwrap_or_else(|_| {
            tracing::debug!("Request timeout");
            Err(ClientError::Timeout)
        });

        if let Err(ref e) = result {
            tracing::debug!("Exchange failed: {}", e);
            *guard = None;
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut transport) = self.transport.lock().await.take() {
            transport.writer.get_mut().shutdown().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_exchange_before_connect() {
        let conn = Connection::new(ConnectionConfig::new("127.0.0.1:1".parse().unwrap()));
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.exchange(b"hi").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_exchange_echoes_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, w) = stream.into_split();
            let mut reader = FrameReader::new(r);
            let mut writer = FrameWriter::new(w);
            while let Some(message) = reader.read_message(1024).await.unwrap() {
                writer.write(&message).await.unwrap();
                writer.end_message().await.unwrap();
            }
        });

        let conn = Connection::new(ConnectionConfig::new(addr));
        conn.connect().await.unwrap();
        assert!(conn.is_connected());

        let reply = conn.exchange(b"hello").await.unwrap();
        assert_eq!(&reply[..], b"hello");
        let reply = conn.exchange(b"again").await.unwrap();
        assert_eq!(&reply[..], b"again");

        conn.close().await.unwrap();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_exchange_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = FrameReader::new(stream);
            reader.read_message(1024).await.unwrap();
            // Dropping the stream closes it without a reply
        });

        let conn = Connection::new(ConnectionConfig::new(addr));
        conn.connect().await.unwrap();

        let err = conn.exchange(b"hello").await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            // Hold the stream open without replying
            let _ = done_rx.await;
        });

        let config = ConnectionConfig::new(addr).with_request_timeout(Duration::from_millis(50));
        let conn = Connection::new(config);
        conn.connect().await.unwrap();

        let err = conn.exchange(b"hello").await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout));
        let _ = done_tx.send(());
    }
}
