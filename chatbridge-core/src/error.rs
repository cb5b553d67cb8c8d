use thiserror::Error;

/// Core error type for chatbridge.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum ChatBridgeError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request body shape the native transport cannot write.
    #[error("unsupported body type: {0}")]
    UnsupportedBodyType(&'static str),

    /// Native request-level failure (DNS, TLS, connection reset, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or truncated streaming payload.
    #[error("stream decoding error: {0}")]
    StreamDecoding(String),

    #[error("tokenizer initialization failed for model '{model}': {reason}")]
    TokenizerInitialization { model: String, reason: String },

    #[error("session is busy with another prompt")]
    SessionBusy,

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ChatBridgeError {
    /// Short, stable name of the variant for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::UnsupportedBodyType(_) => "unsupported_body_type",
            Self::Transport(_) => "transport",
            Self::StreamDecoding(_) => "stream_decoding",
            Self::TokenizerInitialization { .. } => "tokenizer_initialization",
            Self::SessionBusy => "session_busy",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, ChatBridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_kind() {
        let err = ChatBridgeError::UnsupportedBodyType("stream");
        assert_eq!(err.to_string(), "unsupported body type: stream");
        assert_eq!(err.kind(), "unsupported_body_type");

        let err = ChatBridgeError::TokenizerInitialization {
            model: "gpt-x".into(),
            reason: "boom".into(),
        };
        assert!(err.to_string().contains("gpt-x"));
        assert_eq!(ChatBridgeError::SessionBusy.kind(), "session_busy");
    }
}
