//! Server side of the handshake.

use crate::error::ServerError;
use bytes::Buf;
use rpcwire_protocol::{
    HandshakeMatch, HandshakeRequest, HandshakeResponse, Protocol, ProtocolCache, ProtocolHash,
    ProtocolParser,
};
use std::sync::Arc;

/// Outcome of negotiating one handshake request.
#[derive(Debug)]
pub struct Negotiation {
    /// Hash the client claimed for its protocol.
    pub client_hash: ProtocolHash,
    /// Response to send back to the client.
    pub response: HandshakeResponse,
    /// The client's protocol, when the server knows it.
    pub remote: Option<Arc<dyn Protocol>>,
}

impl Negotiation {
    pub fn matched(&self) -> HandshakeMatch {
        self.response.matched
    }
}

/// Resolves client handshakes against the local protocol and a cache of
/// remote protocols shared by all connections of a server.
#[derive(Clone)]
pub struct Negotiator {
    local: Arc<dyn Protocol>,
    cache: Arc<ProtocolCache>,
    parser: Arc<dyn ProtocolParser>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("local", &self.local.name())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Negotiator {
    pub fn new(
        local: Arc<dyn Protocol>,
        cache: Arc<ProtocolCache>,
        parser: Arc<dyn ProtocolParser>,
    ) -> Self {
        Self {
            local,
            cache,
            parser,
        }
    }

    /// Returns the protocol the server speaks.
    pub fn local(&self) -> &Arc<dyn Protocol> {
        &self.local
    }

    pub fn cache(&self) -> &Arc<ProtocolCache> {
        &self.cache
    }

    /// Reads a handshake request from `buf` and decides the verdict.
    ///
    /// An unknown client protocol sent inline is parsed and cached under the
    /// client's hash. Decode and parse failures are [`ServerError::Handshake`].
    pub fn negotiate(&self, buf: &mut impl Buf) -> Result<Negotiation, ServerError> {
        let request = HandshakeRequest::decode(buf).map_err(ServerError::Handshake)?;

        let remote = match self.cache.get(&request.client_hash) {
            Some(protocol) => Some(protocol),
            None => match request.client_protocol {
                Some(ref text) => {
                    let protocol = self.parser.parse(text).map_err(ServerError::Handshake)?;
                    tracing::debug!(
                        client_hash = %request.client_hash,
                        protocol = protocol.name(),
                        "Caching client protocol"
                    );
                    Some(self.cache.insert(request.client_hash, protocol))
                }
                None => None,
            },
        };

        let local_hash = self.local.hash();
        let matched = match remote {
            Some(_) if request.server_hash == local_hash => HandshakeMatch::Both,
            Some(_) => HandshakeMatch::Client,
            None => HandshakeMatch::None,
        };

        let server_protocol = match matched {
            HandshakeMatch::Both => None,
            _ => Some(self.local.describe().to_string()),
        };

        Ok(Negotiation {
            client_hash: request.client_hash,
            response: HandshakeResponse {
                matched,
                server_protocol,
                server_hash: Some(local_hash),
                meta: None,
            },
            remote,
        })
    }
}
