//! Protocol descriptors: the shared definition of callable messages.
//!
//! The wire layer only needs a protocol's content hash, its text and the set
//! of message names, so those are all the [`Protocol`] trait exposes. Value
//! schemas of requests and responses are kept as raw JSON for the payload
//! codec that sits above this crate.

use crate::error::ProtocolError;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Size of a protocol hash in bytes.
pub const HASH_SIZE: usize = 16;

/// Content hash identifying a protocol description.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolHash([u8; HASH_SIZE]);

impl ProtocolHash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Hashes protocol text (first 16 bytes of its SHA-256 digest).
    pub fn of(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; HASH_SIZE];
        bytes.copy_from_slice(&digest[..HASH_SIZE]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for ProtocolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ProtocolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolHash({})", self)
    }
}

impl From<[u8; HASH_SIZE]> for ProtocolHash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

/// A message a protocol defines.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub name: String,
    /// Request parameters schema.
    pub request: Value,
    /// Response schema.
    pub response: Value,
    /// Declared error schemas, if any.
    pub errors: Option<Value>,
    /// One-way messages have no response.
    pub one_way: bool,
}

/// A remote interface description.
pub trait Protocol: Send + Sync + fmt::Debug {
    /// Returns the protocol name.
    fn name(&self) -> &str;

    /// Returns the content hash of the protocol text.
    fn hash(&self) -> ProtocolHash;

    /// Returns the protocol text sent to peers during the handshake.
    fn describe(&self) -> &str;

    /// Looks up a message by name.
    fn message(&self, name: &str) -> Option<&Message>;
}

/// Parses protocol text received from a peer.
pub trait ProtocolParser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Arc<dyn Protocol>, ProtocolError>;
}

#[derive(Deserialize)]
struct ProtocolDoc {
    protocol: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    messages: BTreeMap<String, MessageDoc>,
}

#[derive(Deserialize)]
struct MessageDoc {
    #[serde(default)]
    request: Value,
    #[serde(default)]
    response: Value,
    #[serde(default)]
    errors: Option<Value>,
    #[serde(default, rename = "one-way")]
    one_way: bool,
}

/// A protocol described in the JSON protocol declaration format.
///
/// The text is normalized (compact, keys sorted) before hashing so that
/// formatting differences between peers do not change the hash.
#[derive(Debug, Clone)]
pub struct JsonProtocol {
    name: String,
    namespace: Option<String>,
    messages: BTreeMap<String, Message>,
    text: String,
    hash: ProtocolHash,
}

impl JsonProtocol {
    /// Parses a JSON protocol declaration.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidProtocol(
                "protocol must be a JSON object".to_string(),
            ));
        }
        let doc: ProtocolDoc = serde_json::from_value(value.clone())?;
        if doc.protocol.is_empty() {
            return Err(ProtocolError::InvalidProtocol(
                "protocol name is empty".to_string(),
            ));
        }

        let mut messages = BTreeMap::new();
        for (name, msg) in doc.messages {
            if msg.one_way && !(msg.response.is_null() || msg.response == "null") {
                return Err(ProtocolError::InvalidProtocol(format!(
                    "one-way message {} must have a null response",
                    name
                )));
            }
            messages.insert(
                name.clone(),
                Message {
                    name,
                    request: msg.request,
                    response: msg.response,
                    errors: msg.errors,
                    one_way: msg.one_way,
                },
            );
        }

        let text = serde_json::to_string(&value)?;
        let hash = ProtocolHash::of(&text);

        Ok(Self {
            name: doc.protocol,
            namespace: doc.namespace,
            messages,
            text,
            hash,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Returns the names of all messages.
    pub fn message_names(&self) -> impl Iterator<Item = &str> {
        self.messages.keys().map(String::as_str)
    }
}

impl Protocol for JsonProtocol {
    fn name(&self) -> &str {
        &self.name
    }

    fn hash(&self) -> ProtocolHash {
        self.hash
    }

    fn describe(&self) -> &str {
        &self.text
    }

    fn message(&self, name: &str) -> Option<&Message> {
        self.messages.get(name)
    }
}

/// Parser for [`JsonProtocol`] declarations.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonProtocolParser;

impl ProtocolParser for JsonProtocolParser {
    fn parse(&self, text: &str) -> Result<Arc<dyn Protocol>, ProtocolError> {
        Ok(Arc::new(JsonProtocol::parse(text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ECHO: &str = r#"
    {
        "protocol": "test",
        "messages": {
            "echo": {
                "request": [{"name": "text", "type": "string"}],
                "response": "string"
            }
        }
    }"#;

    #[test]
    fn test_parse_messages() {
        let protocol = JsonProtocol::parse(ECHO).unwrap();
        assert_eq!(protocol.name(), "test");
        assert!(protocol.namespace().is_none());

        let echo = protocol.message("echo").unwrap();
        assert_eq!(echo.name, "echo");
        assert_eq!(echo.response, "string");
        assert!(!echo.one_way);
        assert!(protocol.message("missing").is_none());
        assert_eq!(protocol.message_names().collect::<Vec<_>>(), vec!["echo"]);
    }

    #[test]
    fn test_hash_ignores_formatting() {
        let compact = r#"{"messages":{"echo":{"response":"string","request":[{"type":"string","name":"text"}]}},"protocol":"test"}"#;
        let a = JsonProtocol::parse(ECHO).unwrap();
        let b = JsonProtocol::parse(compact).unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.describe(), b.describe());
    }

    #[test]
    fn test_hash_differs_between_protocols() {
        let other = JsonProtocol::parse(r#"{"protocol":"other"}"#).unwrap();
        let echo = JsonProtocol::parse(ECHO).unwrap();
        assert_ne!(other.hash(), echo.hash());
    }

    #[test]
    fn test_describe_reparses_to_same_hash() {
        let protocol = JsonProtocol::parse(ECHO).unwrap();
        let reparsed = JsonProtocolParser.parse(protocol.describe()).unwrap();
        assert_eq!(reparsed.hash(), protocol.hash());
    }

    #[test]
    fn test_invalid_protocols() {
        assert!(matches!(
            JsonProtocol::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
        assert!(matches!(
            JsonProtocol::parse(r#"["protocol"]"#),
            Err(ProtocolError::InvalidProtocol(_))
        ));
        assert!(matches!(
            JsonProtocol::parse(r#"{"protocol": ""}"#),
            Err(ProtocolError::InvalidProtocol(_))
        ));
        assert!(matches!(
            JsonProtocol::parse(
                r#"{"protocol": "p", "messages": {"fire": {"request": [], "response": "string", "one-way": true}}}"#
            ),
            Err(ProtocolError::InvalidProtocol(_))
        ));
    }

    #[test]
    fn test_hash_display() {
        let hash = ProtocolHash::new([0xAB; HASH_SIZE]);
        assert_eq!(hash.to_string(), "ab".repeat(HASH_SIZE));
        assert!(format!("{:?}", hash).starts_with("ProtocolHash("));
    }
}
