use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use http::StatusCode;
use reqwest::Client;
use tracing_futures::Instrument;

use crate::bridge::BridgeWriter;
use crate::config::HttpCfg;
use crate::error::{ChatBridgeError, CoreResult};
use crate::native::{NativeRequest, NativeResponseHead, NativeTransport};
use crate::response::Headers;

/// reqwest-backed native transport. Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| ChatBridgeError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: format!("chatbridge/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}

#[async_trait]
impl NativeTransport for HttpClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(
        &self,
        req: NativeRequest,
        body: BridgeWriter,
    ) -> CoreResult<NativeResponseHead> {
        let NativeRequest {
            method,
            url,
            headers,
            body: payload,
        } = req;

        let mut rb = self.inner.request(method, &url);
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            rb = rb.header("User-Agent", &self.user_agent);
        }
        for (k, v) in &headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(p) = payload {
            rb = rb.body(p);
        }

        let resp = tokio::select! {
            _ = body.destroyed() => {
                return Err(ChatBridgeError::Transport("request destroyed before response".into()));
            }
            r = rb.send() => r.map_err(|e| ChatBridgeError::Transport(e.to_string()))?,
        };

        let status = resp.status();
        let head = NativeResponseHead {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers: resp
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        String::from_utf8_lossy(v.as_bytes()).into_owned(),
                    )
                })
                .collect(),
        };

        let span = tracing::debug_span!("native.body", url = %url, status = head.status);
        tokio::spawn(pump_body(resp, body).instrument(span));
        Ok(head)
    }
}

/// Forward the response body into the bridge until end, error or destruction.
/// Returning drops the response, which releases the connection.
async fn pump_body(resp: reqwest::Response, body: BridgeWriter) {
    let mut chunks = resp.bytes_stream();
    loop {
        tokio::select! {
            biased;
            _ = body.destroyed() => {
                tracing::debug!(reason = ?body.destroy_reason(), "native exchange destroyed");
                break;
            }
            next = chunks.next() => match next {
                Some(Ok(chunk)) => {
                    body.data(chunk);
                }
                Some(Err(e)) => {
                    body.error(ChatBridgeError::Transport(format!("body read failed: {e}")));
                    break;
                }
                None => {
                    body.end();
                    break;
                }
            },
        }
    }
}

pub(crate) fn extract_request_id(headers: &Headers) -> Option<String> {
    static CANDIDATES: [&str; 5] = [
        "x-request-id",
        "request-id",
        "x-amzn-requestid",
        "x-amz-request-id",
        "x-cdn-request-id",
    ];
    CANDIDATES
        .iter()
        .find_map(|k| headers.get(k))
        .map(str::to_string)
}

pub(crate) fn parse_retry_after(headers: &Headers) -> Option<u64> {
    // HTTP-date forms are ignored; providers send seconds in practice.
    headers
        .get("retry-after")
        .and_then(|s| s.trim().parse::<u64>().ok())
}

pub(crate) fn map_http_error(
    provider: &str,
    status: u16,
    retry_after: Option<u64>,
    body: &str,
) -> ChatBridgeError {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::TOO_MANY_REQUESTS) => ChatBridgeError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        Ok(s) if s.is_server_error() => ChatBridgeError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        _ => ChatBridgeError::ProviderError {
            provider: provider.to_string(),
            code: status.to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}
