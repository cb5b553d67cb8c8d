/// Attribute keys for turn logs.
/// Keep these stable; renaming one breaks anything that filters on it.
pub const KEY_MODEL: &str = "chat.model";
pub const KEY_PROVIDER_URL: &str = "chat.provider_url";
pub const KEY_OUTCOME: &str = "turn.outcome";
pub const KEY_DELTAS: &str = "turn.deltas";

pub const KEY_LATENCY_MS: &str = "latency.ms";
pub const KEY_STOP_REASON: &str = "finish.reason";
pub const KEY_TOKENS_PROMPT: &str = "tokens.prompt";
pub const KEY_TOKENS_COMPLETION: &str = "tokens.completion";

pub const KEY_ERROR_KIND: &str = "error.kind";
pub const KEY_ERROR_MESSAGE: &str = "error.message";
