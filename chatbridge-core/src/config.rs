use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::error::{ChatBridgeError, CoreResult};

pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProviderCfg {
    /// Inline credential. Takes precedence over `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Name of the environment variable that contains the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub context_length: Option<u32>,
}

impl std::fmt::Debug for ProviderCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCfg")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("api_url", &self.api_url)
            .field("context_length", &self.context_length)
            .finish()
    }
}

impl Default for ProviderCfg {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: Some("OPENAI_API_KEY".into()),
            api_url: default_api_url(),
            context_length: None,
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl ProviderCfg {
    /// Resolve the credential and produce the runtime provider configuration.
    pub fn resolve(&self) -> CoreResult<ProviderConfig> {
        let key = match (&self.api_key, &self.api_key_env) {
            (Some(k), _) if !k.is_empty() => k.clone(),
            (_, Some(var)) => std::env::var(var).map_err(|_| {
                ChatBridgeError::Validation(format!("environment variable '{var}' is not set"))
            })?,
            _ => {
                return Err(ChatBridgeError::Validation(
                    "provider needs either api_key or api_key_env".into(),
                ));
            }
        };
        if key.trim().is_empty() {
            return Err(ChatBridgeError::Validation("provider api key is empty".into()));
        }
        let mut cfg = ProviderConfig::new(SecretString::new(key.into()), self.api_url.clone());
        cfg.context_length = self.context_length;
        Ok(cfg)
    }
}

/// Runtime provider configuration handed to a session. Read-only and shareable.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: SecretString,
    pub api_url: String,
    pub context_length: Option<u32>,
}

impl ProviderConfig {
    pub fn new(api_key: SecretString, api_url: impl Into<String>) -> Self {
        Self {
            api_key,
            api_url: api_url.into(),
            context_length: None,
        }
    }

    pub fn with_context_length(mut self, n: u32) -> Self {
        self.context_length = Some(n);
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 300000ms; covers the whole stream)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    300_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TokenizerRule {
    /// Regex applied to the model identifier, e.g. ^my-finetune-.*
    pub model: String,
    /// Encoding to use when this rule matches, e.g. "o200k_base"
    pub encoding: crate::tokenizer::TokenizerKind,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderCfg,
    #[serde(default)]
    pub http: HttpCfg,
    /// Model used when the caller does not name one.
    #[serde(default = "default_model")]
    pub model: String,
    /// Extra tokenizer rules, checked before the built-in table.
    #[serde(default)]
    pub tokenizers: Vec<TokenizerRule>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderCfg::default(),
            http: HttpCfg::default(),
            model: default_model(),
            tokenizers: Vec::new(),
        }
    }
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(ChatBridgeError::from)?;
        let s = std::str::from_utf8(&bytes).map_err(|e| ChatBridgeError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                serde_json::from_str::<Self>(s).map_err(|e| ChatBridgeError::Other(e.into()))?
            }
            Some("toml") => {
                toml::from_str::<Self>(s).map_err(|e| ChatBridgeError::Other(e.into()))?
            }
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| ChatBridgeError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s).map_err(|e| ChatBridgeError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
