//! Request handlers.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use rpcwire_protocol::{Metadata, Request, Response};
use std::sync::Arc;

/// Serves calls resolved against the server's protocol.
///
/// A handler receives every call whose message name the protocol defines.
/// Whatever it writes to the [`ResponseWriter`] is sent back once it returns.
/// Handlers run on the connection's task, so a connection serves one call at
/// a time. `req.context()` is cancelled when the connection is closed.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn serve(&self, w: &mut ResponseWriter, req: Request);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn serve(&self, w: &mut ResponseWriter, req: Request) {
        (**self).serve(w, req).await
    }
}

/// Collects the response to a call.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    metadata: Metadata,
    body: BytesMut,
    error: bool,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a response metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.metadata.set(key, value);
    }

    /// Appends an encoded response value.
    pub fn write(&mut self, value: &[u8]) {
        self.body.extend_from_slice(value);
    }

    /// Replaces the response with an encoded error value.
    pub fn write_error(&mut self, value: &[u8]) {
        self.error = true;
        self.body.clear();
        self.body.extend_from_slice(value);
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    /// Returns the number of payload bytes written so far.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn into_response(self) -> Response {
        let mut response = if self.error {
            Response::error(self.body.freeze())
        } else {
            Response::ok(self.body.freeze())
        };
        response.metadata = self.metadata;
        response
    }
}
