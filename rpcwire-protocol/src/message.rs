//! Request and response envelopes.
//!
//! ```text
//! Request:  metadata map<bytes> | message name string | payload ...
//! Response: metadata map<bytes> | error flag boolean  | payload ...
//! ```
//!
//! The payload is opaque and runs to the end of the logical message; its
//! length is implied by the framing.

use crate::binary;
use crate::descriptor::Protocol;
use crate::error::ProtocolError;
use crate::frame::FrameWriter;
use crate::metadata::Metadata;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;

/// A one-shot message payload.
#[derive(Debug, Default)]
pub struct Body(Option<Bytes>);

impl Body {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(Some(bytes.into()))
    }

    pub fn empty() -> Self {
        Self(Some(Bytes::new()))
    }

    /// Takes the payload. Returns `None` once it has been consumed.
    pub fn take(&mut self) -> Option<Bytes> {
        self.0.take()
    }

    pub fn is_consumed(&self) -> bool {
        self.0.is_none()
    }

    /// Returns the payload length, or 0 once consumed.
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, Bytes::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A call of a named message.
#[derive(Debug)]
pub struct Request {
    /// Name of the called message. Empty for a ping.
    pub name: String,
    pub metadata: Metadata,
    pub body: Body,
    protocol: Option<Arc<dyn Protocol>>,
    remote_addr: Option<String>,
    context: CancellationToken,
}

impl Request {
    /// Creates a request for a message the protocol defines.
    ///
    /// `body` is the already encoded request value.
    pub fn new(
        protocol: Arc<dyn Protocol>,
        name: &str,
        body: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        if protocol.message(name).is_none() {
            return Err(ProtocolError::UnknownMessage(name.to_string()));
        }
        let mut request = Self::unchecked(name, body);
        request.protocol = Some(protocol);
        Ok(request)
    }

    /// Creates a ping: a call with an empty name and no payload.
    pub fn ping() -> Self {
        Self::unchecked("", Bytes::new())
    }

    fn unchecked(name: &str, body: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            metadata: Metadata::new(),
            body: Body::new(body),
            protocol: None,
            remote_addr: None,
            context: CancellationToken::new(),
        }
    }

    pub fn is_ping(&self) -> bool {
        self.name.is_empty()
    }

    /// Returns the protocol the request was resolved against.
    pub fn protocol(&self) -> Option<&Arc<dyn Protocol>> {
        self.protocol.as_ref()
    }

    pub fn set_protocol(&mut self, protocol: Arc<dyn Protocol>) {
        self.protocol = Some(protocol);
    }

    /// Returns the peer address, for requests read from a connection.
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn set_remote_addr(&mut self, addr: impl Into<String>) {
        self.remote_addr = Some(addr.into());
    }

    /// Returns the request's cancellation token.
    ///
    /// Cancellation is advisory: handlers should check it or select on it.
    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Replaces the request's cancellation token.
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
        self
    }

    fn encode_prefix(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        binary::put_string(buf, &self.name);
    }

    /// Encodes the envelope and the payload, consuming the body.
    pub fn encode(&mut self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = self.body.take().ok_or(ProtocolError::BodyConsumed)?;
        self.encode_prefix(buf);
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Writes the envelope as its own frame followed by the payload,
    /// consuming the body. The caller ends the message.
    pub async fn write<W: AsyncWrite + Unpin>(
        &mut self,
        w: &mut FrameWriter<W>,
    ) -> Result<(), ProtocolError> {
        let body = self.body.take().ok_or(ProtocolError::BodyConsumed)?;
        let mut prefix = BytesMut::new();
        self.encode_prefix(&mut prefix);
        w.write(&prefix).await?;
        w.flush().await?;
        w.write(&body).await?;
        Ok(())
    }

    /// Reads the envelope from a logical message. The rest of the message
    /// becomes the body.
    pub fn read(message: &mut Bytes) -> Result<Self, ProtocolError> {
        let metadata = Metadata::decode(message, "request metadata")?;
        let name = binary::get_string(message, "message name")?;
        let body = message.split_off(0);

        let mut request = Self::unchecked(&name, body);
        request.metadata = metadata;
        Ok(request)
    }
}

/// The reply to a request.
#[derive(Debug, Default)]
pub struct Response {
    /// Whether the payload holds an error value.
    pub error: bool,
    pub metadata: Metadata,
    pub body: Body,
}

impl Response {
    /// Creates a successful response with an encoded value.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            error: false,
            metadata: Metadata::new(),
            body: Body::new(body),
        }
    }

    /// Creates an error response with an encoded error value.
    pub fn error(body: impl Into<Bytes>) -> Self {
        Self {
            error: true,
            metadata: Metadata::new(),
            body: Body::new(body),
        }
    }

    /// Creates an error response carrying a system error message.
    ///
    /// System errors are the `string` branch (index 0) of the error union.
    pub fn system_error(message: &str) -> Self {
        let mut buf = BytesMut::new();
        binary::put_union_index(&mut buf, 0);
        binary::put_string(&mut buf, message);
        Self::error(buf.freeze())
    }

    /// Decodes the system error message of an error response, if the
    /// payload holds one.
    pub fn system_error_message(&self) -> Option<String> {
        if !self.error {
            return None;
        }
        let mut payload = self.body.0.clone()?;
        match binary::get_union_index(&mut payload, 1, "error")
            .and_then(|_| binary::get_string(&mut payload, "error"))
        {
            Ok(message) => Some(message),
            Err(_) => None,
        }
    }

    fn encode_prefix(&self, buf: &mut BytesMut) {
        self.metadata.encode(buf);
        binary::put_bool(buf, self.error);
    }

    /// Encodes the envelope and the payload, consuming the body.
    pub fn encode(&mut self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let body = self.body.take().ok_or(ProtocolError::BodyConsumed)?;
        self.encode_prefix(buf);
        buf.extend_from_slice(&body);
        Ok(())
    }

    /// Writes the envelope as its own frame followed by the payload,
    /// consuming the body. The caller ends the message.
    pub async fn write<W: AsyncWrite + Unpin>(
        &mut self,
        w: &mut FrameWriter<W>,
    ) -> Result<(), ProtocolError> {
        let body = self.body.take().ok_or(ProtocolError::BodyConsumed)?;
        let mut prefix = BytesMut::new();
        self.encode_prefix(&mut prefix);
        w.write(&prefix).await?;
        w.flush().await?;
        w.write(&body).await?;
        Ok(())
    }

    /// Reads the envelope from a logical message. The rest of the message
    /// becomes the body.
    pub fn read(message: &mut Bytes) -> Result<Self, ProtocolError> {
        let metadata = Metadata::decode(message, "response metadata")?;
        let error = binary::get_bool(message, "response error flag")?;
        let body = message.split_off(0);

        Ok(Self {
            error,
            metadata,
            body: Body::new(body),
        })
    }
}
