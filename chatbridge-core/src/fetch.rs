//! Fetch-shaped transport injection point and its native-backed implementation.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::bridge;
use crate::error::{ChatBridgeError, CoreResult};
use crate::native::{NativeRequest, NativeTransport};
use crate::response::{ResponseBody, ResponseEnvelope, adapt};

/// Request body as handed over by a client.
pub enum RequestBody {
    /// Structured value, serialized to JSON by the fetch layer.
    Json(serde_json::Value),
    Text(String),
    Bytes(Bytes),
    /// Streaming upload; the native transport only writes complete bodies.
    Stream(BoxStream<'static, CoreResult<Bytes>>),
}

impl RequestBody {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Json(_) => "json",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Stream(_) => "stream",
        }
    }
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Self::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Connection-pooling options some clients attach to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOptions {
    pub keep_alive: bool,
    pub max_sockets: Option<usize>,
}

#[derive(Debug)]
pub struct RequestDescriptor {
    pub method: http::Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub agent: Option<AgentOptions>,
}

impl RequestDescriptor {
    pub fn new(method: http::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            agent: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(http::Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(http::Method::POST, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn json(self, value: serde_json::Value) -> Self {
        self.body(RequestBody::Json(value))
    }

    pub fn agent(mut self, agent: AgentOptions) -> Self {
        self.agent = Some(agent);
        self
    }
}

/// Transport function shape consumed by [`crate::client::ChatCompletionClient`].
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, req: RequestDescriptor) -> CoreResult<ResponseEnvelope>;
}

/// How [`NativeFetch`] resolves the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Resolve on the response head; the body stays live.
    Streaming,
    /// Read the whole body before resolving.
    Buffered,
}

/// [`Fetch`] over a [`NativeTransport`], bridging its body events.
#[derive(Clone)]
pub struct NativeFetch {
    transport: Arc<dyn NativeTransport>,
    mode: BodyMode,
}

impl NativeFetch {
    pub fn new(transport: Arc<dyn NativeTransport>, mode: BodyMode) -> Self {
        Self { transport, mode }
    }

    pub fn streaming(transport: Arc<dyn NativeTransport>) -> Self {
        Self::new(transport, BodyMode::Streaming)
    }

    pub fn buffered(transport: Arc<dyn NativeTransport>) -> Self {
        Self::new(transport, BodyMode::Buffered)
    }

    pub fn mode(&self) -> BodyMode {
        self.mode
    }
}

#[async_trait]
impl Fetch for NativeFetch {
    async fn fetch(&self, req: RequestDescriptor) -> CoreResult<ResponseEnvelope> {
        let native = prepare(req)?;
        let (writer, body) = bridge::channel();
        let head = self.transport.start(native, writer).await?;
        let body = match self.mode {
            BodyMode::Streaming => ResponseBody::Streaming(body),
            BodyMode::Buffered => ResponseBody::Buffered(body.collect_bytes().await?),
        };
        Ok(adapt(head, body))
    }
}

/// Derive the native request. Fails before anything touches the network.
pub(crate) fn prepare(req: RequestDescriptor) -> CoreResult<NativeRequest> {
    let RequestDescriptor {
        method,
        url,
        headers,
        body,
        agent,
    } = req;

    if let Some(agent) = agent {
        tracing::debug!(
            ?agent,
            "connection agent is not supported by the native transport; dropped"
        );
    }

    // content-length is computed by the native transport
    let mut headers: Vec<(String, String)> = headers
        .into_iter()
        .filter(|(k, _)| {
            !k.eq_ignore_ascii_case("content-length") && !k.eq_ignore_ascii_case("agent")
        })
        .collect();

    let body = match body {
        None => None,
        Some(RequestBody::Json(value)) => {
            let encoded = serde_json::to_vec(&value).map_err(|e| ChatBridgeError::Other(e.into()))?;
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-type"));
            headers.push(("Content-Type".into(), "application/json".into()));
            Some(Bytes::from(encoded))
        }
        Some(RequestBody::Text(s)) => Some(Bytes::from(s)),
        Some(RequestBody::Bytes(b)) => Some(b),
        Some(other) => return Err(ChatBridgeError::UnsupportedBodyType(other.kind())),
    };

    Ok(NativeRequest {
        method,
        url,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{ScriptedTransport, Step};
    use serde_json::json;

    #[test]
    fn json_body_sets_content_type_and_drops_agent() {
        let req = RequestDescriptor::post("http://x/v1")
            .header("content-type", "text/plain")
            .header("Content-Length", "999")
            .header("agent", "pooled")
            .header("Authorization", "Bearer k")
            .agent(AgentOptions { keep_alive: true, max_sockets: Some(4) })
            .json(json!({"a": 1}));
        let native = prepare(req).unwrap();

        assert_eq!(native.method, http::Method::POST);
        assert_eq!(
            native.headers,
            vec![
                ("Authorization".to_string(), "Bearer k".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ]
        );
        assert_eq!(native.body.as_deref(), Some(&br#"{"a":1}"#[..]));
    }

    #[test]
    fn text_and_bytes_pass_through_unchanged() {
        let native = prepare(
            RequestDescriptor::post("http://x")
                .header("content-type", "text/plain")
                .body(RequestBody::Text("hi".into())),
        )
        .unwrap();
        assert_eq!(native.body.as_deref(), Some(&b"hi"[..]));
        assert_eq!(native.headers, vec![("content-type".to_string(), "text/plain".to_string())]);

        let raw = Bytes::from_static(&[0, 159, 146]);
        let native =
            prepare(RequestDescriptor::post("http://x").body(RequestBody::Bytes(raw))).unwrap();
        assert_eq!(native.body.as_deref(), Some(&[0u8, 159, 146][..]));
        assert!(native.headers.is_empty());
    }

    #[tokio::test]
    async fn stream_body_is_rejected_before_native_request() {
        let transport = Arc::new(ScriptedTransport::ok(vec![Step::End]));
        let fetch = NativeFetch::streaming(transport.clone());
        let body = RequestBody::Stream(Box::pin(futures::stream::empty()));
        let err = fetch
            .fetch(RequestDescriptor::post("http://x").body(body))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatBridgeError::UnsupportedBodyType("stream")));
        assert_eq!(transport.starts(), 0);
    }

    #[tokio::test]
    async fn streaming_mode_resolves_with_live_body() {
        let transport = Arc::new(ScriptedTransport::ok(vec![
            Step::Data("a".into()),
            Step::Data("b".into()),
            Step::End,
        ]));
        let fetch = NativeFetch::streaming(transport.clone());
        let resp = fetch.fetch(RequestDescriptor::get("http://x")).await.unwrap();
        assert!(resp.is_streaming());
        assert_eq!(resp.text().await.unwrap(), "ab");
        assert_eq!(transport.starts(), 1);
    }

    #[tokio::test]
    async fn buffered_mode_reads_body_before_resolving() {
        let transport = Arc::new(ScriptedTransport::ok(vec![
            Step::Data("{\"ok\":".into()),
            Step::Data("true}".into()),
            Step::End,
        ]));
        let fetch = NativeFetch::buffered(transport);
        let resp = fetch.fetch(RequestDescriptor::get("http://x")).await.unwrap();
        assert!(!resp.is_streaming());
        let v: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(v, json!({"ok": true}));
    }

    #[tokio::test]
    async fn buffered_mode_surfaces_body_error() {
        let transport = Arc::new(ScriptedTransport::ok(vec![
            Step::Data("partial".into()),
            Step::Error("connection reset".into()),
        ]));
        let fetch = NativeFetch::buffered(transport);
        let err = fetch.fetch(RequestDescriptor::get("http://x")).await.unwrap_err();
        assert!(matches!(err, ChatBridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn request_failure_is_rejected() {
        let transport = Arc::new(ScriptedTransport::refused("dns lookup failed"));
        let fetch = NativeFetch::streaming(transport.clone());
        let err = fetch.fetch(RequestDescriptor::get("http://x")).await.unwrap_err();
        match err {
            ChatBridgeError::Transport(msg) => assert!(msg.contains("dns")),
            other => panic!("expected Transport, got {other:?}"),
        }
        assert_eq!(transport.starts(), 1);
    }
}
