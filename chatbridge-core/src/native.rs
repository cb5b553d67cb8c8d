//! Platform request transport: the event-driven side of an HTTP exchange.
//!
//! A transport resolves once the response head is known and then delivers the body
//! through a [`BridgeWriter`] as `data` events followed by one `end` or `error`.
//! It must stop delivering (and release the connection) once the writer reports
//! that the consumer destroyed the exchange.

use async_trait::async_trait;
use bytes::Bytes;

use crate::bridge::BridgeWriter;
use crate::error::CoreResult;

/// Outbound request in the shape the native transport accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// Status line and headers, delivered once per exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NativeResponseHead {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait NativeTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Issue `req`. Resolves with the response head; body events flow into `body`
    /// afterwards. A request-level failure (DNS, TLS, refused connection) is an `Err`
    /// and no body events are produced.
    async fn start(&self, req: NativeRequest, body: BridgeWriter) -> CoreResult<NativeResponseHead>;
}
