use serde::Serialize;

use super::keys::*;

/// One finished prompt, as reported to a [`super::TelemetrySink`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TurnLog {
    pub model: Option<String>,
    pub provider_url: Option<String>,
    /// `completed`, `aborted` or `failed`.
    pub outcome: Option<String>,
    pub deltas: usize,
    pub latency_ms: Option<u64>,
    pub stop_reason: Option<String>,
    pub tokens_prompt: Option<usize>,
    pub tokens_completion: Option<usize>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub text: Option<String>,
}

impl TurnLog {
    pub fn new() -> Self { Self::default() }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn provider_url(mut self, v: &str) -> Self { self.provider_url = Some(v.to_string()); self }
    pub fn outcome(mut self, v: &str) -> Self { self.outcome = Some(v.to_string()); self }
    pub fn deltas(mut self, n: usize) -> Self { self.deltas = n; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn stop_reason(mut self, v: &str) -> Self { self.stop_reason = Some(v.to_string()); self }
    pub fn text(mut self, v: &str) -> Self { self.text = Some(v.to_string()); self }
    pub fn tokens(mut self, prompt: usize, completion: usize) -> Self {
        self.tokens_prompt = Some(prompt);
        self.tokens_completion = Some(completion);
        self
    }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }

    /// Flattened key/value view; unset fields are omitted and `text` is never included.
    pub fn attributes(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        let mut push = |k: &'static str, v: Option<String>| {
            if let Some(v) = v {
                out.push((k, v));
            }
        };
        push(KEY_MODEL, self.model.clone());
        push(KEY_PROVIDER_URL, self.provider_url.clone());
        push(KEY_OUTCOME, self.outcome.clone());
        push(KEY_DELTAS, Some(self.deltas.to_string()));
        push(KEY_LATENCY_MS, self.latency_ms.map(|v| v.to_string()));
        push(KEY_STOP_REASON, self.stop_reason.clone());
        push(KEY_TOKENS_PROMPT, self.tokens_prompt.map(|v| v.to_string()));
        push(KEY_TOKENS_COMPLETION, self.tokens_completion.map(|v| v.to_string()));
        push(KEY_ERROR_KIND, self.error_kind.clone());
        push(KEY_ERROR_MESSAGE, self.error_message.clone());
        out
    }
}
