use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tiktoken_rs::CoreBPE;

use crate::config::TokenizerRule;
use crate::error::{ChatBridgeError, CoreResult};

/// BPE encodings a model can be mapped to.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    O200kBase,
    Cl100kBase,
    P50kBase,
    R50kBase,
}

impl TokenizerKind {
    /// Encoding used for identifiers no rule matches (the gpt-3.5 family).
    pub const DEFAULT: Self = Self::Cl100kBase;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::O200kBase => "o200k_base",
            Self::Cl100kBase => "cl100k_base",
            Self::P50kBase => "p50k_base",
            Self::R50kBase => "r50k_base",
        }
    }

    fn build(&self) -> anyhow::Result<CoreBPE> {
        match self {
            Self::O200kBase => tiktoken_rs::o200k_base(),
            Self::Cl100kBase => tiktoken_rs::cl100k_base(),
            Self::P50kBase => tiktoken_rs::p50k_base(),
            Self::R50kBase => tiktoken_rs::r50k_base(),
        }
    }
}

// Order matters: gpt-4o must be tried before gpt-4.
const BUILTIN_RULES: &[(&str, TokenizerKind)] = &[
    (r"^(gpt-4o|gpt-4\.1|gpt-4\.5|chatgpt-4o|o1|o3|o4)", TokenizerKind::O200kBase),
    (
        r"^(gpt-4|gpt-3\.5|gpt-35|text-embedding-3|text-embedding-ada-002)",
        TokenizerKind::Cl100kBase,
    ),
    (r"^(davinci|babbage)-002$", TokenizerKind::Cl100kBase),
    (r"^(text-davinci-00[23]|code-davinci|code-cushman)", TokenizerKind::P50kBase),
    (r"^(text-)?(davinci|curie|babbage|ada)(-001)?$", TokenizerKind::R50kBase),
];

#[derive(Debug)]
struct CompiledRule {
    regex: Regex,
    kind: TokenizerKind,
}

/// Explicit model-identifier to encoding mapping. First matching rule wins;
/// configured rules are checked before the built-in table.
#[derive(Debug)]
pub struct TokenizerRegistry {
    rules: Vec<CompiledRule>,
    default_kind: TokenizerKind,
}

impl Default for TokenizerRegistry {
    fn default() -> Self {
        let rules = BUILTIN_RULES
            .iter()
            .filter_map(|(pattern, kind)| {
                Regex::new(pattern).ok().map(|regex| CompiledRule { regex, kind: *kind })
            })
            .collect();
        Self {
            rules,
            default_kind: TokenizerKind::DEFAULT,
        }
    }
}

impl TokenizerRegistry {
    /// Built-in table extended with configured rules.
    pub fn with_rules(extra: &[TokenizerRule]) -> CoreResult<Self> {
        let mut compiled = Vec::with_capacity(extra.len());
        for TokenizerRule { model, encoding } in extra {
            let regex = Regex::new(model).map_err(|e| {
                ChatBridgeError::Validation(format!("invalid tokenizer regex '{model}': {e}"))
            })?;
            compiled.push(CompiledRule {
                regex,
                kind: *encoding,
            });
        }
        let mut reg = Self::default();
        compiled.append(&mut reg.rules);
        reg.rules = compiled;
        Ok(reg)
    }

    pub fn kind_for(&self, model: &str) -> TokenizerKind {
        self.rules
            .iter()
            .find(|r| r.regex.is_match(model))
            .map(|r| r.kind)
            .unwrap_or(self.default_kind)
    }

    /// Build the tokenizer selected for `model`.
    pub fn tokenizer_for(&self, model: &str) -> CoreResult<Tokenizer> {
        let kind = self.kind_for(model);
        tracing::debug!(model, encoding = kind.as_str(), "selected tokenizer");
        Tokenizer::new(kind).map_err(|e| match e {
            ChatBridgeError::TokenizerInitialization { reason, .. } => {
                ChatBridgeError::TokenizerInitialization {
                    model: model.to_string(),
                    reason,
                }
            }
            other => other,
        })
    }
}

/// Text to token-id encoder. Cheap to clone.
#[derive(Clone)]
pub struct Tokenizer {
    kind: TokenizerKind,
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer").field("kind", &self.kind).finish()
    }
}

impl Tokenizer {
    pub fn new(kind: TokenizerKind) -> CoreResult<Self> {
        let bpe = kind.build().map_err(|e| ChatBridgeError::TokenizerInitialization {
            model: kind.as_str().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            kind,
            bpe: Arc::new(bpe),
        })
    }

    pub fn kind(&self) -> TokenizerKind {
        self.kind
    }

    pub fn encode(&self, text: &str) -> Vec<u32> {
        self.bpe
            .encode_with_special_tokens(text)
            .into_iter()
            .map(|t| t as u32)
            .collect()
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
