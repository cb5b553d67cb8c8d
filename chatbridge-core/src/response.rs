//! Fetch-shaped response envelope built from a native response head and a body.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;

use crate::bridge::BridgedStream;
use crate::error::{ChatBridgeError, CoreResult};
use crate::native::NativeResponseHead;

/// Response headers, stored verbatim and in arrival order.
/// Lookups through [`Headers::get`] ignore ASCII case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value whose name matches `name` case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<(String, String)> {
        self.0
    }
}

impl From<Vec<(String, String)>> for Headers {
    fn from(v: Vec<(String, String)>) -> Self {
        Self(v)
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Boxed stream of body chunks.
pub type ByteStream = BoxStream<'static, CoreResult<Bytes>>;

#[derive(Debug)]
pub enum ResponseBody {
    /// Body still arriving through the bridge.
    Streaming(BridgedStream),
    /// Body read to completion before the envelope was built.
    Buffered(Bytes),
}

/// Immutable response value: status, status text, headers and a single-use body.
#[derive(Debug)]
pub struct ResponseEnvelope {
    status: u16,
    status_text: String,
    headers: Headers,
    body: ResponseBody,
}

/// Pure construction; copies the head without touching names or values.
pub fn adapt(head: NativeResponseHead, body: ResponseBody) -> ResponseEnvelope {
    ResponseEnvelope {
        status: head.status,
        status_text: head.status_text,
        headers: Headers::from(head.headers),
        body,
    }
}

impl ResponseEnvelope {
    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// True for 2xx statuses.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.body, ResponseBody::Streaming(_))
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Body as a chunk stream regardless of how it was constructed.
    pub fn into_byte_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Streaming(s) => s.boxed(),
            ResponseBody::Buffered(b) if b.is_empty() => stream::empty().boxed(),
            ResponseBody::Buffered(b) => stream::once(async move { Ok(b) }).boxed(),
        }
    }

    pub async fn bytes(self) -> CoreResult<Bytes> {
        match self.body {
            ResponseBody::Streaming(s) => s.collect_bytes().await,
            ResponseBody::Buffered(b) => Ok(b),
        }
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub async fn text(self) -> CoreResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> CoreResult<T> {
        let status = self.status;
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ChatBridgeError::ProviderError {
            provider: "http".into(),
            code: status.to_string(),
            message: format!("json decode error: {e}"),
        })
    }
}
