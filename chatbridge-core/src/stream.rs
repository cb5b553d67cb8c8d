//! Decoding of streamed chat completions.
//!
//! Contract:
//! - The response body is split into lines; `data:` lines are joined per SSE event and
//!   each event is decoded into one [`ChatCompletionChunk`].
//! - `data: [DONE]` ends the sequence. A body that ends without it still ends the
//!   sequence after the last complete event.
//! - The first error of any kind is yielded once and the sequence ends after it.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use crate::error::{ChatBridgeError, CoreResult};
use crate::model::ChatCompletionChunk;
use crate::response::ByteStream;

/// Lazy sequence of decoded delta events.
pub type DeltaStream = BoxStream<'static, CoreResult<ChatCompletionChunk>>;

const DONE_MARKER: &str = "[DONE]";

/// Decode an SSE byte stream into chat completion chunks.
pub fn decode_chunks(body: ByteStream) -> DeltaStream {
    let state = Decoder {
        lines: LineStream::new(body),
        data: Vec::new(),
        finished: false,
    };
    stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        let item = st.next_event().await?;
        if item.is_err() {
            st.finished = true;
        }
        Some((item, st))
    })
    .boxed()
}

struct Decoder {
    lines: LineStream,
    /// `data:` lines of the event being assembled.
    data: Vec<String>,
    finished: bool,
}

impl Decoder {
    async fn next_event(&mut self) -> Option<CoreResult<ChatCompletionChunk>> {
        loop {
            match self.lines.next().await {
                Some(Ok(line)) => {
                    if line.is_empty() {
                        if self.data.is_empty() {
                            continue;
                        }
                        return self.dispatch();
                    }
                    if let Some(value) = line.strip_prefix("data:") {
                        self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
                    }
                    // event:, id:, retry: and `:` comments carry nothing for chat chunks
                }
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.finished = true;
                    if self.data.is_empty() {
                        return None;
                    }
                    return self.dispatch();
                }
            }
        }
    }

    fn dispatch(&mut self) -> Option<CoreResult<ChatCompletionChunk>> {
        let data = self.data.join("\n");
        self.data.clear();
        if data.trim() == DONE_MARKER {
            self.finished = true;
            return None;
        }
        Some(decode_payload(&data))
    }
}

fn decode_payload(data: &str) -> CoreResult<ChatCompletionChunk> {
    let value: serde_json::Value = serde_json::from_str(data)
        .map_err(|e| ChatBridgeError::StreamDecoding(format!("invalid event payload: {e}")))?;
    if let Some(err) = value.get("error") {
        let code = err
            .get("code")
            .or_else(|| err.get("type"))
            .and_then(|c| {
                c.as_str()
                    .map(str::to_string)
                    .or_else(|| c.as_u64().map(|n| n.to_string()))
            })
            .unwrap_or_else(|| "stream".to_string());
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error")
            .to_string();
        return Err(ChatBridgeError::ProviderError {
            provider: "sse".into(),
            code,
            message,
        });
    }
    serde_json::from_value(value)
        .map_err(|e| ChatBridgeError::StreamDecoding(format!("unexpected chunk shape: {e}")))
}

/// Line splitter over a byte stream. Splits on `\n`, strips a trailing `\r`,
/// and keeps multi-byte characters intact across chunk boundaries.
struct LineStream {
    inner: ByteStream,
    buf: BytesMut,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    flushed_tail: bool,
}

impl LineStream {
    fn new(inner: ByteStream) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            scanned: 0,
            flushed_tail: false,
        }
    }

    fn take_line(&mut self, end: usize) -> CoreResult<String> {
        let mut line = self.buf.split_to(end);
        self.scanned = 0;
        if line.last() == Some(&b'\n') {
            line.truncate(line.len() - 1);
        }
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        String::from_utf8(line.to_vec())
            .map_err(|e| ChatBridgeError::StreamDecoding(format!("invalid utf-8 in stream: {e}")))
    }
}

impl Stream for LineStream {
    type Item = CoreResult<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let from = self.scanned;
            if let Some(idx) = self.buf[from..].iter().position(|b| *b == b'\n') {
                return Poll::Ready(Some(self.take_line(from + idx + 1)));
            }
            self.scanned = self.buf.len();

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    if !self.flushed_tail && !self.buf.is_empty() {
                        self.flushed_tail = true;
                        let len = self.buf.len();
                        return Poll::Ready(Some(self.take_line(len)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
