//! Handshake records exchanged at the start of a connection.
//!
//! ```text
//! HandshakeRequest:  clientHash fixed(16) | clientProtocol [null, string]
//!                    serverHash fixed(16) | meta [null, map<bytes>]
//! HandshakeResponse: match enum{BOTH, CLIENT, NONE} | serverProtocol [null, string]
//!                    serverHash [null, fixed(16)]   | meta [null, map<bytes>]
//! ```

use crate::binary;
use crate::descriptor::{ProtocolHash, HASH_SIZE};
use crate::error::ProtocolError;
use crate::metadata::Metadata;
use bytes::{Buf, BufMut};
use std::fmt;

/// Outcome of a handshake as seen by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMatch {
    /// Both sides know each other's protocol.
    Both,
    /// The server knows the client's protocol, but the client has a stale
    /// idea of the server's.
    Client,
    /// The server does not know the client's protocol.
    None,
}

impl HandshakeMatch {
    const SYMBOLS: [HandshakeMatch; 3] = [
        HandshakeMatch::Both,
        HandshakeMatch::Client,
        HandshakeMatch::None,
    ];

    /// Returns the enum symbol used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HandshakeMatch::Both => "BOTH",
            HandshakeMatch::Client => "CLIENT",
            HandshakeMatch::None => "NONE",
        }
    }

    fn index(&self) -> usize {
        match self {
            HandshakeMatch::Both => 0,
            HandshakeMatch::Client => 1,
            HandshakeMatch::None => 2,
        }
    }
}

impl fmt::Display for HandshakeMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handshake sent by the client before its first call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeRequest {
    pub client_hash: ProtocolHash,
    pub client_protocol: Option<String>,
    pub server_hash: ProtocolHash,
    pub meta: Option<Metadata>,
}

impl HandshakeRequest {
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(self.client_hash.as_bytes());
        put_optional_string(buf, self.client_protocol.as_deref());
        buf.put_slice(self.server_hash.as_bytes());
        put_optional_meta(buf, self.meta.as_ref());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let client_hash = binary::get_fixed::<HASH_SIZE>(buf, "handshake client hash")?;
        let client_protocol = get_optional_string(buf, "handshake client protocol")?;
        let server_hash = binary::get_fixed::<HASH_SIZE>(buf, "handshake server hash")?;
        let meta = get_optional_meta(buf, "handshake request metadata")?;

        Ok(Self {
            client_hash: client_hash.into(),
            client_protocol,
            server_hash: server_hash.into(),
            meta,
        })
    }
}

/// Handshake returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResponse {
    pub matched: HandshakeMatch,
    pub server_protocol: Option<String>,
    pub server_hash: Option<ProtocolHash>,
    pub meta: Option<Metadata>,
}

impl HandshakeResponse {
    pub fn encode(&self, buf: &mut impl BufMut) {
        binary::put_long(buf, self.matched.index() as i64);
        put_optional_string(buf, self.server_protocol.as_deref());
        match self.server_hash {
            Some(hash) => {
                binary::put_union_index(buf, 1);
                buf.put_slice(hash.as_bytes());
            }
            None => binary::put_union_index(buf, 0),
        }
        put_optional_meta(buf, self.meta.as_ref());
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, ProtocolError> {
        let index = binary::get_long(buf, "handshake match")?;
        let matched = usize::try_from(index)
            .ok()
            .and_then(|i| HandshakeMatch::SYMBOLS.get(i).copied())
            .ok_or_else(|| {
                ProtocolError::decode("handshake match", format!("unknown symbol index {}", index))
            })?;
        let server_protocol = get_optional_string(buf, "handshake server protocol")?;
        let server_hash = match binary::get_union_index(buf, 2, "handshake server hash")? {
            0 => None,
            _ => Some(binary::get_fixed::<HASH_SIZE>(buf, "handshake server hash")?.into()),
        };
        let meta = get_optional_meta(buf, "handshake response metadata")?;

        Ok(Self {
            matched,
            server_protocol,
            server_hash,
            meta,
        })
    }
}

fn put_optional_string(buf: &mut impl BufMut, value: Option<&str>) {
    match value {
        Some(s) => {
            binary::put_union_index(buf, 1);
            binary::put_string(buf, s);
        }
        None => binary::put_union_index(buf, 0),
    }
}

fn get_optional_string(
    buf: &mut impl Buf,
    field: &'static str,
) -> Result<Option<String>, ProtocolError> {
    match binary::get_union_index(buf, 2, field)? {
        0 => Ok(None),
        _ => Ok(Some(binary::get_string(buf, field)?)),
    }
}

fn put_optional_meta(buf: &mut impl BufMut, meta: Option<&Metadata>) {
    match meta {
        Some(meta) => {
            binary::put_union_index(buf, 1);
            meta.encode(buf);
        }
        None => binary::put_union_index(buf, 0),
    }
}

fn get_optional_meta(
    buf: &mut impl Buf,
    field: &'static str,
) -> Result<Option<Metadata>, ProtocolError> {
    match binary::get_union_index(buf, 2, field)? {
        0 => Ok(None),
        _ => Ok(Some(Metadata::decode(buf, field)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let request = HandshakeRequest {
            client_hash: ProtocolHash::new([0x11; 16]),
            client_protocol: None,
            server_hash: ProtocolHash::new([0x22; 16]),
            meta: None,
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);

        let mut expected = vec![0x11; 16];
        expected.push(0x00);
        expected.extend_from_slice(&[0x22; 16]);
        expected.push(0x00);
        assert_eq!(buf, expected);

        let decoded = HandshakeRequest::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_request_with_protocol_and_meta() {
        let mut meta = Metadata::new();
        meta.set("trace", &b"abc"[..]);
        let request = HandshakeRequest {
            client_hash: ProtocolHash::new([0x01; 16]),
            client_protocol: Some(r#"{"protocol":"p"}"#.to_string()),
            server_hash: ProtocolHash::new([0x02; 16]),
            meta: Some(meta),
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);

        let decoded = HandshakeRequest::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_layout() {
        let response = HandshakeResponse {
            matched: HandshakeMatch::Client,
            server_protocol: Some("p".to_string()),
            server_hash: Some(ProtocolHash::new([0x33; 16])),
            meta: None,
        };
        let mut buf = Vec::new();
        response.encode(&mut buf);

        let mut expected = vec![0x02, 0x02, 0x02, b'p', 0x02];
        expected.extend_from_slice(&[0x33; 16]);
        expected.push(0x00);
        assert_eq!(buf, expected);

        let decoded = HandshakeResponse::decode(&mut &buf[..]).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_match_symbols() {
        assert_eq!(HandshakeMatch::Both.to_string(), "BOTH");
        assert_eq!(HandshakeMatch::Client.to_string(), "CLIENT");
        assert_eq!(HandshakeMatch::None.to_string(), "NONE");
    }

    #[test]
    fn test_response_unknown_symbol() {
        let data = [0x06, 0x00, 0x00, 0x00];
        let err = HandshakeResponse::decode(&mut &data[..]).unwrap_err();
        assert!(err.to_string().contains("handshake match"));
    }

    #[test]
    fn test_truncated_request() {
        let data = [0x11; 10];
        let err = HandshakeRequest::decode(&mut &data[..]).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Decode {
                field: "handshake client hash",
                ..
            }
        ));
    }
}
