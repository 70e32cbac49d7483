//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use rpcwire_protocol::{
    HandshakeMatch, HandshakeRequest, HandshakeResponse, JsonProtocolParser, Metadata, Protocol,
    ProtocolCache, ProtocolHash, ProtocolParser, Request, Response,
};
use std::sync::Arc;
use tokio::sync::Mutex;

/// What the client knows about the server's protocol.
#[derive(Debug)]
struct HandshakeState {
    /// Hash the client believes the server speaks.
    server_hash: ProtocolHash,
    server_protocol: Option<Arc<dyn Protocol>>,
    /// The server accepted this client's protocol on this connection.
    negotiated: bool,
    /// Include the client's protocol text in handshakes.
    send_protocol: bool,
}

/// High-level client for rpcwire.
///
/// The first call on a connection carries a handshake. The client starts
/// out assuming the server speaks its own protocol and corrects itself from
/// the server's reply, retrying once with its protocol text inline when the
/// server does not know it.
pub struct Client {
    conn: Arc<Connection>,
    local: Arc<dyn Protocol>,
    parser: Arc<dyn ProtocolParser>,
    cache: Arc<ProtocolCache>,
    state: Mutex<HandshakeState>,
}

impl Client {
    /// Creates a new client speaking `protocol`.
    pub fn new(config: ConnectionConfig, protocol: Arc<dyn Protocol>) -> Self {
        let server_hash = protocol.hash();
        Self {
            conn: Arc::new(Connection::new(config)),
            local: protocol,
            parser: Arc::new(JsonProtocolParser),
            cache: Arc::new(ProtocolCache::new()),
            state: Mutex::new(HandshakeState {
                server_hash,
                server_protocol: None,
                negotiated: false,
                send_protocol: false,
            }),
        }
    }

    /// Uses `cache` for server protocols, so clients can share what they
    /// learned.
    pub fn with_cache(mut self, cache: Arc<ProtocolCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Uses `parser` for protocols sent by the server.
    pub fn with_parser(mut self, parser: Arc<dyn ProtocolParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Sets the hash the client assumes the server speaks.
    pub fn with_server_hash(mut self, hash: ProtocolHash) -> Self {
        self.state.get_mut().server_hash = hash;
        self
    }

    /// Connects to the server. A new connection needs a new handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;
        self.state.lock().await.negotiated = false;
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Returns the server's protocol, once a handshake revealed it.
    pub async fn server_protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.state.lock().await.server_protocol.clone()
    }

    /// Returns the hash the client currently assumes the server speaks.
    pub async fn server_hash(&self) -> ProtocolHash {
        self.state.lock().await.server_hash
    }

    /// Calls the message `name` with an encoded request value.
    ///
    /// Error responses holding a system error become
    /// [`ClientError::Remote`]; other error responses are returned with
    /// their error flag set.
    pub async fn call(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<Response, ClientError> {
        let payload = payload.into();
        let response = self
            .send(|| {
                let mut request = Request::new(self.local.clone(), name, payload.clone())?;
                request.metadata = metadata.clone();
                Ok(request)
            })
            .await?;

        match response.system_error_message() {
            Some(message) => Err(ClientError::Remote { message }),
            None => Ok(response),
        }
    }

    /// Pings the server.
    pub async fn ping(&self) -> Result<(), ClientError> {
        let response = self.send(|| Ok(Request::ping())).await?;
        if response.error {
            return Err(ClientError::Remote {
                message: response
                    .system_error_message()
                    .unwrap_or_else(|| "ping failed".to_string()),
            });
        }
        Ok(())
    }

    async fn send<F>(&self, make_request: F) -> Result<Response, ClientError>
    where
        F: Fn() -> Result<Request, ClientError>,
    {
        let mut state = self.state.lock().await;
        loop {
            let mut request = make_request()?;
            let handshake = !state.negotiated;

            let mut buf = BytesMut::new();
            if handshake {
                self.handshake_request(&state).encode(&mut buf);
            }
            request.encode(&mut buf)?;

            let mut reply = self.conn.exchange(&buf).await?;

            if handshake {
                let response = HandshakeResponse::decode(&mut reply)?;
                tracing::debug!(matched = %response.matched, "Handshake response");
                self.learn_server(&mut state, &response)?;

                if response.matched == HandshakeMatch::None {
                    if state.send_protocol {
                        return Err(ClientError::ProtocolMismatch {
                            server_hash: state.server_hash,
                        });
                    }
                    state.send_protocol = true;
                    continue;
                }
                state.negotiated = true;
            }

            return Ok(Response::read(&mut reply)?);
        }
    }

    fn handshake_request(&self, state: &HandshakeState) -> HandshakeRequest {
        HandshakeRequest {
            client_hash: self.local.hash(),
            client_protocol: state
                .send_protocol
                .then(|| self.local.describe().to_string()),
            server_hash: state.server_hash,
            meta: None,
        }
    }

    /// Records the server protocol and hash a handshake response carries.
    fn learn_server(
        &self,
        state: &mut HandshakeState,
        response: &HandshakeResponse,
    ) -> Result<(), ClientError> {
        let Some(hash) = response.server_hash else {
            return Ok(());
        };

        let protocol = match response.server_protocol {
            Some(ref text) => Some(self.cache.insert(hash, self.parser.parse(text)?)),
            None => self.cache.get(&hash),
        };

        if hash != state.server_hash {
            tracing::debug!(server_hash = %hash, "Server protocol changed");
        }
        state.server_hash = hash;
        if protocol.is_some() {
            state.server_protocol = protocol;
        }
        Ok(())
    }
}
