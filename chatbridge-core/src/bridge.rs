//! Chunk-stream bridge: turns push-style body events (`data` / `end` / `error`)
//! delivered by a native transport into a pull-based byte stream.
//!
//! Contract:
//! - Chunks are handed out in arrival order; nothing is dropped while the bridge is open.
//! - Exactly one terminal transition is visible to the consumer. `end` drains buffered
//!   chunks first; `error` discards them and is reported once. Any later terminal event
//!   from the native side is ignored.
//! - `cancel` (or dropping the stream) destroys the native exchange and turns every later
//!   writer call into a no-op.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::error::{ChatBridgeError, CoreResult};

const DROPPED_REASON: &str = "stream dropped by consumer";

/// A body chunk as produced by the native side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeChunk {
    /// Native, growable buffer; normalized to `Bytes` before the consumer sees it.
    Buffer(BytesMut),
    /// Already flat bytes; passed through unchanged.
    Flat(Bytes),
}

impl NativeChunk {
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Buffer(buf) => buf.freeze(),
            Self::Flat(bytes) => bytes,
        }
    }
}

impl From<Bytes> for NativeChunk {
    fn from(b: Bytes) -> Self {
        Self::Flat(b)
    }
}

impl From<BytesMut> for NativeChunk {
    fn from(b: BytesMut) -> Self {
        Self::Buffer(b)
    }
}

impl From<&'static str> for NativeChunk {
    fn from(s: &'static str) -> Self {
        Self::Flat(Bytes::from_static(s.as_bytes()))
    }
}

enum Terminal {
    Open,
    Ended,
    /// `Some` until the consumer has observed the error.
    Errored(Option<ChatBridgeError>),
    Cancelled,
}

struct State {
    queue: VecDeque<Bytes>,
    terminal: Terminal,
    pending_pull: Option<Waker>,
    destroy_reason: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    destroy: CancellationToken,
}

/// Create a connected writer/stream pair for one response body.
pub fn channel() -> (BridgeWriter, BridgedStream) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State {
            queue: VecDeque::new(),
            terminal: Terminal::Open,
            pending_pull: None,
            destroy_reason: None,
        }),
        destroy: CancellationToken::new(),
    });
    (
        BridgeWriter {
            shared: shared.clone(),
        },
        BridgedStream { shared },
    )
}

/// Native-facing half. Held by the transport for the lifetime of the body.
pub struct BridgeWriter {
    shared: Arc<Shared>,
}

impl BridgeWriter {
    /// Deliver one chunk. Returns `false` once the bridge is terminal.
    pub fn data(&self, chunk: impl Into<NativeChunk>) -> bool {
        let waker = {
            let mut st = self.shared.state.lock();
            if !matches!(st.terminal, Terminal::Open) {
                return false;
            }
            st.queue.push_back(chunk.into().into_bytes());
            st.pending_pull.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    /// Natural end of body. Returns `false` if a terminal state was already reached.
    pub fn end(&self) -> bool {
        self.finish(Terminal::Ended)
    }

    /// Body failed. Returns `false` if a terminal state was already reached.
    pub fn error(&self, err: ChatBridgeError) -> bool {
        self.finish(Terminal::Errored(Some(err)))
    }

    fn finish(&self, terminal: Terminal) -> bool {
        let waker = {
            let mut st = self.shared.state.lock();
            if !matches!(st.terminal, Terminal::Open) {
                return false;
            }
            if matches!(terminal, Terminal::Errored(_)) {
                st.queue.clear();
            }
            st.terminal = terminal;
            st.pending_pull.take()
        };
        if let Some(w) = waker {
            w.wake();
        }
        true
    }

    /// Resolves once the consumer cancelled or dropped the stream.
    pub fn destroyed(&self) -> WaitForCancellationFuture<'_> {
        self.shared.destroy.cancelled()
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroy.is_cancelled()
    }

    pub fn destroy_reason(&self) -> Option<String> {
        self.shared.state.lock().destroy_reason.clone()
    }
}

impl Drop for BridgeWriter {
    fn drop(&mut self) {
        // A transport that goes away without a terminal event must not leave the consumer pending.
        self.error(ChatBridgeError::Transport(
            "native response closed before end of body".into(),
        ));
    }
}

/// Consumer-facing half: a single-use, pull-based byte stream.
pub struct BridgedStream {
    shared: Arc<Shared>,
}

impl BridgedStream {
    /// Abort the exchange. Idempotent, safe after natural completion.
    pub fn cancel(&self, reason: impl Into<String>) {
        let (waker, was_open) = {
            let mut st = self.shared.state.lock();
            let was_open = matches!(st.terminal, Terminal::Open);
            if was_open {
                st.terminal = Terminal::Cancelled;
            }
            st.queue.clear();
            if st.destroy_reason.is_none() {
                st.destroy_reason = Some(reason.into());
            }
            (st.pending_pull.take(), was_open)
        };
        if was_open {
            tracing::debug!("bridged stream cancelled before end of body");
        }
        self.shared.destroy.cancel();
        if let Some(w) = waker {
            w.wake();
        }
    }

    /// True once a terminal state has been reached (end, error or cancel).
    pub fn is_terminated(&self) -> bool {
        !matches!(self.shared.state.lock().terminal, Terminal::Open)
    }

    /// Drain the whole body into one buffer.
    pub async fn collect_bytes(mut self) -> CoreResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for BridgedStream {
    type Item = CoreResult<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut st = self.shared.state.lock();
        if let Terminal::Errored(err) = &mut st.terminal {
            return Poll::Ready(err.take().map(Err));
        }
        if let Some(chunk) = st.queue.pop_front() {
            return Poll::Ready(Some(Ok(chunk)));
        }
        match st.terminal {
            Terminal::Open => {
                st.pending_pull = Some(cx.waker().clone());
                Poll::Pending
            }
            _ => Poll::Ready(None),
        }
    }
}

impl Drop for BridgedStream {
    fn drop(&mut self) {
        self.cancel(DROPPED_REASON);
    }
}

impl std::fmt::Debug for BridgedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgedStream")
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(stream: &mut BridgedStream) -> Vec<CoreResult<Bytes>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn buffered_chunks_drain_before_end() {
        let (w, mut s) = channel();
        assert!(w.data("a"));
        assert!(w.data(BytesMut::from(&b"bc"[..])));
        assert!(w.end());

        let items = drain(&mut s).await;
        let bytes: Vec<Bytes> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(bytes, vec![Bytes::from_static(b"a"), Bytes::from_static(b"bc")]);
        // pulls after end keep reporting end-of-stream
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn pending_pull_is_woken_by_data() {
        let (w, mut s) = channel();
        let reader = tokio::spawn(async move { s.next().await.map(|r| r.unwrap()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        w.data("late");
        let got = reader.await.unwrap();
        assert_eq!(got, Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn end_then_error_yields_single_terminal() {
        let (w, mut s) = channel();
        w.data("x");
        assert!(w.end());
        assert!(!w.error(ChatBridgeError::Transport("late".into())));
        assert!(!w.end());
        assert!(!w.data("ignored"));

        let items = drain(&mut s).await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn error_then_end_yields_single_error() {
        let (w, mut s) = channel();
        w.data("dropped by error");
        assert!(w.error(ChatBridgeError::Transport("reset".into())));
        assert!(!w.end());

        let items = drain(&mut s).await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(ChatBridgeError::Transport(msg)) => assert_eq!(msg, "reset"),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn cancel_destroys_native_side_with_reason() {
        let (w, s) = channel();
        w.data("buffered");
        s.cancel("user abort");
        tokio::time::timeout(Duration::from_secs(1), w.destroyed())
            .await
            .expect("destroy signal");
        assert!(w.is_destroyed());
        assert_eq!(w.destroy_reason().as_deref(), Some("user abort"));
        assert!(!w.data("after cancel"));
        assert!(!w.end());
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_safe_after_end() {
        let (w, mut s) = channel();
        w.data("a");
        w.end();
        assert_eq!(drain(&mut s).await.len(), 1);
        s.cancel("first");
        s.cancel("second");
        assert_eq!(w.destroy_reason().as_deref(), Some("first"));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_destroys_native_side() {
        let (w, s) = channel();
        drop(s);
        assert!(w.is_destroyed());
        assert_eq!(w.destroy_reason().as_deref(), Some(DROPPED_REASON));
    }

    #[tokio::test]
    async fn dropped_writer_surfaces_transport_error() {
        let (w, mut s) = channel();
        w.data("partial");
        drop(w);
        let items = drain(&mut s).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ChatBridgeError::Transport(_))));
    }

    #[tokio::test]
    async fn collect_bytes_concatenates_in_order() {
        let (w, s) = channel();
        for part in ["he", "ll", "o"] {
            w.data(part);
        }
        w.end();
        assert_eq!(s.collect_bytes().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn buffer_chunks_are_normalized() {
        let chunk = NativeChunk::from(BytesMut::from(&b"xyz"[..]));
        assert_eq!(chunk.into_bytes(), Bytes::from_static(b"xyz"));
        let flat = Bytes::from_static(b"abc");
        assert_eq!(NativeChunk::from(flat.clone()).into_bytes(), flat);
    }
}
