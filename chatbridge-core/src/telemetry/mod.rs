//! Turn telemetry.
//! By default nothing is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive one [`TurnLog`] per finished prompt.
///
/// Implementations must be `Send + Sync + 'static`; `record_turn` may be called
/// from any thread and should stay cheap.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record_turn(&self, log: TurnLog);
}

/// Sink that writes each turn as a `tracing` event on target `chatbridge::turn`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn record_turn(&self, log: TurnLog) {
        let attrs = log
            .attributes()
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        if log.error_kind.is_some() {
            tracing::warn!(target: "chatbridge::turn", "{attrs}");
        } else {
            tracing::info!(target: "chatbridge::turn", "{attrs}");
        }
    }
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

// In tests, gate emission to the calling test thread to avoid cross-test interference.
#[cfg(test)]
thread_local! {
    static TEST_CAPTURE: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install the global sink. Returns `false` if one is already installed.
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

#[inline]
pub(crate) fn emit_turn(log: TurnLog) {
    #[cfg(test)]
    {
        if !TEST_CAPTURE.with(|c| c.get()) {
            return;
        }
    }
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record_turn(log);
    }
}

#[cfg(test)]
/// Test-only: enable or disable emission for the current thread.
pub fn test_set_capture_enabled(enabled: bool) {
    TEST_CAPTURE.with(|c| c.set(enabled));
}
