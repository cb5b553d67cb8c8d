//! Streaming chat session: history, tokenizer, abort flag and the per-prompt loop.
//!
//! A prompt moves `Idle -> Streaming -> {Completed, Aborted, Failed} -> Idle`.
//! History survives across prompts; a second prompt while one is streaming is
//! rejected with [`ChatBridgeError::SessionBusy`] before anything is mutated.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing_futures::Instrument;

use crate::client::ChatCompletionClient;
use crate::config::ProviderConfig;
use crate::error::{ChatBridgeError, CoreResult};
use crate::fetch::Fetch;
use crate::model::{
    ChatCompletionChunk, ChatCompletionRequest, ConversationMessage, StopReason, TokenDelta,
};
use crate::telemetry::{self, TurnLog};
use crate::tokenizer::{Tokenizer, TokenizerRegistry};

/// Event name every sink message is sent under.
pub const TOKEN_STREAM_EVENT: &str = "tokenStream";
/// Return value of [`ChatSession::streaming_prompt`] when the exchange failed.
pub const FAILURE_SENTINEL: &str = "error";

/// Receiver of streamed tokens and in-band error messages.
pub trait TokenSink: Send + Sync {
    fn send(&self, event: &str, payload: TokenDelta);
}

impl<F> TokenSink for F
where
    F: Fn(&str, TokenDelta) + Send + Sync,
{
    fn send(&self, event: &str, payload: TokenDelta) {
        self(event, payload)
    }
}

/// Sink forwarding into an unbounded channel, for hosts that consume tokens on another task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<(String, TokenDelta)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, TokenDelta)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TokenSink for ChannelSink {
    fn send(&self, event: &str, payload: TokenDelta) {
        if self.tx.send((event.to_string(), payload)).is_err() {
            tracing::trace!("token receiver dropped");
        }
    }
}

#[derive(Debug, Default)]
struct AbortInner {
    requested: AtomicBool,
    notify: Notify,
}

/// Shared abort flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortInner>,
}

impl AbortHandle {
    /// Request the in-flight prompt to stop. Idempotent.
    pub fn abort(&self) {
        self.inner.requested.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_requested(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.inner.requested.store(false, Ordering::SeqCst);
    }

    /// Resolves once an abort has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register before checking so an abort between the check and the await is not lost
            notified.as_mut().enable();
            if self.is_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// How a prompt ended.
#[derive(Debug)]
pub enum PromptOutcome {
    Completed {
        text: String,
        stop_reason: Option<StopReason>,
    },
    /// Stopped by [`ChatSession::abort`]; `text` holds what was forwarded before.
    Aborted { text: String },
    /// The exchange failed; `partial` holds what was forwarded before the failure.
    Failed {
        partial: String,
        error: ChatBridgeError,
    },
}

impl PromptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Aborted { .. } => "aborted",
            Self::Failed { .. } => "failed",
        }
    }

    /// Text accumulated from forwarded deltas.
    pub fn text(&self) -> &str {
        match self {
            Self::Completed { text, .. } | Self::Aborted { text } => text,
            Self::Failed { partial, .. } => partial,
        }
    }
}

/// Message forwarded to the sink when the exchange fails.
pub fn describe_error(err: &ChatBridgeError) -> String {
    format!("Error during chat streaming session: {err}\n")
}

struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> CoreResult<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ChatBridgeError::SessionBusy)?;
        Ok(Self(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum Next {
    Aborted,
    Item(Option<CoreResult<ChatCompletionChunk>>),
}

pub struct ChatSession {
    model: String,
    provider: ProviderConfig,
    client: ChatCompletionClient,
    tokenizer: Tokenizer,
    history: Mutex<Vec<ConversationMessage>>,
    abort: AbortHandle,
    busy: AtomicBool,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("model", &self.model)
            .field("api_url", &self.provider.api_url)
            .field("tokenizer", &self.tokenizer.kind())
            .field("history_len", &self.history.lock().len())
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Create a session for `model` using the built-in tokenizer table.
    pub fn initialize(
        model: impl Into<String>,
        provider: ProviderConfig,
        fetch: Arc<dyn Fetch>,
    ) -> CoreResult<Self> {
        Self::with_tokenizers(model, provider, fetch, &TokenizerRegistry::default())
    }

    pub fn with_tokenizers(
        model: impl Into<String>,
        provider: ProviderConfig,
        fetch: Arc<dyn Fetch>,
        tokenizers: &TokenizerRegistry,
    ) -> CoreResult<Self> {
        let model = model.into();
        let tokenizer = tokenizers.tokenizer_for(&model)?;
        let client = ChatCompletionClient::new(fetch, &provider);
        Ok(Self {
            model,
            provider,
            client,
            tokenizer,
            history: Mutex::new(Vec::new()),
            abort: AbortHandle::default(),
            busy: AtomicBool::new(false),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn client(&self) -> &ChatCompletionClient {
        &self.client
    }

    pub fn tokenize(&self, text: &str) -> Vec<u32> {
        self.tokenizer.encode(text)
    }

    /// Configured context length, or 0 when none was given.
    pub fn context_length(&self) -> u32 {
        self.provider.context_length.unwrap_or(0)
    }

    pub fn abort(&self) {
        self.abort.abort();
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn history(&self) -> Vec<ConversationMessage> {
        self.history.lock().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().clear();
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one prompt to its outcome. Only pre-stream rejections are `Err`;
    /// exchange failures come back as [`PromptOutcome::Failed`] after an
    /// error message was forwarded to `sink`.
    pub async fn run_prompt(
        &self,
        prompt: &str,
        sink: &dyn TokenSink,
        ignore_history: bool,
    ) -> CoreResult<PromptOutcome> {
        let _busy = BusyGuard::acquire(&self.busy)?;
        self.abort.reset();

        let messages: Vec<_> = {
            let mut history = self.history.lock();
            if ignore_history {
                history.clear();
            }
            history.push(ConversationMessage::user(prompt));
            history.iter().map(ConversationMessage::to_wire).collect()
        };

        let prompt_tokens = self.tokenizer.count(prompt);
        let span = tracing::info_span!(
            "chat.prompt",
            model = %self.model,
            history_len = messages.len(),
            prompt_tokens,
            outcome = tracing::field::Empty,
            deltas = tracing::field::Empty,
        );
        let started = Instant::now();
        let req = ChatCompletionRequest::new(self.model.clone(), messages).streaming();
        let (outcome, deltas) = self.drive(req, sink).instrument(span.clone()).await;

        span.record("outcome", outcome.label());
        span.record("deltas", deltas);
        if let PromptOutcome::Failed { error, partial } = &outcome {
            tracing::warn!(
                parent: &span,
                error = %error,
                kind = error.kind(),
                partial_len = partial.len(),
                "chat prompt failed"
            );
            sink.send(TOKEN_STREAM_EVENT, TokenDelta::error(describe_error(error)));
        }

        let mut log = TurnLog::new()
            .model(&self.model)
            .provider_url(&self.provider.api_url)
            .outcome(outcome.label())
            .deltas(deltas)
            .latency_ms(started.elapsed().as_millis() as u64)
            .tokens(prompt_tokens, self.tokenizer.count(outcome.text()))
            .text(outcome.text());
        match &outcome {
            PromptOutcome::Completed {
                stop_reason: Some(reason),
                ..
            } => log = log.stop_reason(&format!("{reason:?}")),
            PromptOutcome::Failed { error, .. } => {
                log = log.error(error.kind(), &error.to_string())
            }
            _ => {}
        }
        telemetry::emit_turn(log);

        Ok(outcome)
    }

    async fn drive(
        &self,
        req: ChatCompletionRequest,
        sink: &dyn TokenSink,
    ) -> (PromptOutcome, usize) {
        let mut text = String::new();
        let mut deltas = 0usize;
        let mut stop_reason = None;

        let started = tokio::select! {
            biased;
            _ = self.abort.wait() => None,
            r = self.client.create_stream(req) => Some(r),
        };
        let mut stream = match started {
            None => return (PromptOutcome::Aborted { text }, deltas),
            Some(Err(error)) => return (PromptOutcome::Failed { partial: text, error }, deltas),
            Some(Ok(s)) => s,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.wait() => Next::Aborted,
                item = stream.next() => Next::Item(item),
            };
            match next {
                Next::Aborted => {
                    tracing::debug!(deltas, "abort requested; dropping delta stream");
                    return (PromptOutcome::Aborted { text }, deltas);
                }
                Next::Item(None) => {
                    return (PromptOutcome::Completed { text, stop_reason }, deltas);
                }
                Next::Item(Some(Err(error))) => {
                    return (PromptOutcome::Failed { partial: text, error }, deltas);
                }
                Next::Item(Some(Ok(chunk))) => {
                    // the sink may have requested an abort while handling the previous delta
                    if self.abort.is_requested() {
                        return (PromptOutcome::Aborted { text }, deltas);
                    }
                    stop_reason = chunk.stop_reason().or(stop_reason);
                    let content = chunk.delta_text();
                    text.push_str(content);
                    self.history
                        .lock()
                        .push(ConversationMessage::assistant(content));
                    sink.send(TOKEN_STREAM_EVENT, TokenDelta::success(content));
                    deltas += 1;
                }
            }
        }
    }

    /// Compatibility form of [`Self::run_prompt`]: returns the accumulated text, or
    /// [`FAILURE_SENTINEL`] when the exchange failed.
    pub async fn streaming_prompt(
        &self,
        prompt: &str,
        sink: &dyn TokenSink,
        ignore_history: bool,
    ) -> CoreResult<String> {
        Ok(match self.run_prompt(prompt, sink, ignore_history).await? {
            PromptOutcome::Completed { text, .. } | PromptOutcome::Aborted { text } => text,
            PromptOutcome::Failed { .. } => FAILURE_SENTINEL.to_string(),
        })
    }
}
