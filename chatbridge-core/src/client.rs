//! OpenAI-compatible chat completion client over an injected [`Fetch`].

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};

use crate::config::ProviderConfig;
use crate::error::{ChatBridgeError, CoreResult};
use crate::fetch::{Fetch, RequestDescriptor};
use crate::http_client::{extract_request_id, map_http_error, parse_retry_after};
use crate::model::{ChatCompletion, ChatCompletionRequest};
use crate::response::ResponseEnvelope;
use crate::stream::{DeltaStream, decode_chunks};

#[derive(Clone)]
pub struct ChatCompletionClient {
    fetch: Arc<dyn Fetch>,
    base: String,
    api_key: SecretString,
    name: String,
}

impl std::fmt::Debug for ChatCompletionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionClient")
            .field("base", &self.base)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ChatCompletionClient {
    pub fn new(fetch: Arc<dyn Fetch>, cfg: &ProviderConfig) -> Self {
        Self {
            fetch,
            base: cfg.api_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            name: "openai".into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn descriptor(&self, req: &ChatCompletionRequest) -> CoreResult<RequestDescriptor> {
        let body = serde_json::to_value(req).map_err(|e| ChatBridgeError::Other(e.into()))?;
        let accept = if req.stream { "text/event-stream" } else { "application/json" };
        Ok(RequestDescriptor::post(format!("{}/chat/completions", self.base))
            .header("Authorization", format!("Bearer {}", self.api_key.expose_secret()))
            .header("Accept", accept)
            .json(body))
    }

    /// Map a non-2xx envelope to a typed error; 2xx passes through.
    async fn check_status(&self, resp: ResponseEnvelope) -> CoreResult<ResponseEnvelope> {
        let request_id = extract_request_id(resp.headers());
        if resp.ok() {
            tracing::debug!(
                provider = %self.name,
                status = resp.status(),
                request_id = ?request_id,
                "completion response"
            );
            return Ok(resp);
        }
        let status = resp.status();
        let retry_after = parse_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(
            provider = %self.name,
            status,
            request_id = ?request_id,
            "completion request failed"
        );
        Err(map_http_error(&self.name, status, retry_after, &body))
    }

    /// Single non-streaming completion.
    pub async fn create(&self, mut req: ChatCompletionRequest) -> CoreResult<ChatCompletion> {
        req.stream = false;
        let resp = self.fetch.fetch(self.descriptor(&req)?).await?;
        let resp = self.check_status(resp).await?;
        resp.json::<ChatCompletion>().await
    }

    /// Streaming completion; resolves once the response head is in and yields
    /// decoded chunks as they arrive.
    pub async fn create_stream(&self, mut req: ChatCompletionRequest) -> CoreResult<DeltaStream> {
        req.stream = true;
        let resp = self.fetch.fetch(self.descriptor(&req)?).await?;
        let resp = self.check_status(resp).await?;
        Ok(decode_chunks(resp.into_byte_stream()))
    }
}
