//! Test doubles: a scripted native transport and a recording sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::bridge::BridgeWriter;
use crate::error::{ChatBridgeError, CoreResult};
use crate::model::TokenDelta;
use crate::native::{NativeRequest, NativeResponseHead, NativeTransport};
use crate::session::{AbortHandle, TokenSink};

/// One scripted body event.
#[derive(Debug, Clone)]
pub enum Step {
    Data(String),
    End,
    Error(String),
}

/// Native transport replaying a fixed head and body script.
/// A script without a terminal step holds the body open until the consumer destroys it.
pub struct ScriptedTransport {
    head: NativeResponseHead,
    steps: Vec<Step>,
    refuse: Option<String>,
    stall: bool,
    starts: AtomicUsize,
    last_request: Mutex<Option<NativeRequest>>,
    destroy_reason: Arc<Mutex<Option<String>>>,
}

impl ScriptedTransport {
    pub fn with_head(head: NativeResponseHead, steps: Vec<Step>) -> Self {
        Self {
            head,
            steps,
            refuse: None,
            stall: false,
            starts: AtomicUsize::new(0),
            last_request: Mutex::new(None),
            destroy_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn ok(steps: Vec<Step>) -> Self {
        Self::with_head(
            NativeResponseHead {
                status: 200,
                status_text: "OK".into(),
                headers: vec![("content-type".into(), "text/event-stream".into())],
            },
            steps,
        )
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self::with_head(
            NativeResponseHead {
                status,
                status_text: String::new(),
                headers: Vec::new(),
            },
            vec![Step::Data(body.to_string()), Step::End],
        )
    }

    /// Transport whose request fails before any response head.
    pub fn refused(reason: &str) -> Self {
        let mut t = Self::ok(Vec::new());
        t.refuse = Some(reason.to_string());
        t
    }

    /// Transport whose response head never arrives; the exchange only ends when destroyed.
    pub fn stalled() -> Self {
        let mut t = Self::ok(Vec::new());
        t.stall = true;
        t
    }

    /// Script streaming one SSE chat chunk per delta, then `[DONE]`.
    pub fn sse(deltas: &[&str]) -> Self {
        let mut steps: Vec<Step> = deltas.iter().map(|d| Step::Data(sse_chunk(d))).collect();
        steps.push(Step::Data("data: [DONE]\n\n".into()));
        steps.push(Step::End);
        Self::ok(steps)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<NativeRequest> {
        self.last_request.lock().clone()
    }

    pub fn destroy_reason(&self) -> Option<String> {
        self.destroy_reason.lock().clone()
    }
}

#[async_trait]
impl NativeTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(
        &self,
        req: NativeRequest,
        body: BridgeWriter,
    ) -> CoreResult<NativeResponseHead> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(req);
        if let Some(reason) = &self.refuse {
            return Err(ChatBridgeError::Transport(reason.clone()));
        }

        let destroy_reason = self.destroy_reason.clone();
        if self.stall {
            tokio::spawn(async move {
                body.destroyed().await;
                *destroy_reason.lock() = body.destroy_reason();
            });
            return std::future::pending().await;
        }

        let steps = self.steps.clone();
        tokio::spawn(async move {
            let mut terminal = false;
            for step in steps {
                tokio::task::yield_now().await;
                match step {
                    Step::Data(s) => {
                        body.data(Bytes::from(s));
                    }
                    Step::End => {
                        body.end();
                        terminal = true;
                    }
                    Step::Error(e) => {
                        body.error(ChatBridgeError::Transport(e));
                        terminal = true;
                    }
                }
            }
            if !terminal {
                body.destroyed().await;
                *destroy_reason.lock() = body.destroy_reason();
            }
        });
        Ok(self.head.clone())
    }
}

/// SSE event carrying one content delta.
pub fn sse_chunk(content: &str) -> String {
    let payload = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {"content": content}, "finish_reason": null}]
    });
    format!("data: {payload}\n\n")
}

type Hook = Box<dyn Fn(usize) + Send + Sync>;

/// Sink that records every event; optionally runs a hook after each success message.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, TokenDelta)>>,
    on_success: Option<Hook>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests an abort right after the `k`-th success message was recorded.
    pub fn aborting_after(k: usize, handle: AbortHandle) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            on_success: Some(Box::new(move |n| {
                if n == k {
                    handle.abort();
                }
            })),
        }
    }

    pub fn events(&self) -> Vec<(String, TokenDelta)> {
        self.events.lock().clone()
    }

    pub fn successes(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(_, d)| d.message_type == crate::model::MessageStatus::Success)
            .map(|(_, d)| d.content.clone())
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(_, d)| d.message_type == crate::model::MessageStatus::Error)
            .map(|(_, d)| d.content.clone())
            .collect()
    }
}

impl TokenSink for RecordingSink {
    fn send(&self, event: &str, payload: TokenDelta) {
        let is_success = payload.message_type == crate::model::MessageStatus::Success;
        let successes = {
            let mut events = self.events.lock();
            events.push((event.to_string(), payload));
            events
                .iter()
                .filter(|(_, d)| d.message_type == crate::model::MessageStatus::Success)
                .count()
        };
        if is_success && let Some(hook) = &self.on_success {
            hook(successes);
        }
    }
}
