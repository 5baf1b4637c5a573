//! Compilation context: the caller's situation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::canonical::{fingerprint_hex, FingerprintKind};

/// Default number of semantic hits requested from a searcher.
pub const DEFAULT_SEMANTIC_TOP_K: usize = 20;

/// Context dimension, shared by atom selectors and `current_context` facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Operational mode (e.g. `active`, `dream`).
    OperationalMode,
    /// Campaign phase.
    CampaignPhase,
    /// Build layer.
    BuildLayer,
    /// Intent verb (e.g. `fix`, `review`).
    IntentVerb,
    /// Intent target. Context-only, atoms cannot select on it.
    IntentTarget,
    /// Shard type (e.g. `coder`).
    ShardType,
    /// Programming language.
    Language,
    /// Frameworks (multi-valued).
    Framework,
    /// World states (multi-valued).
    WorldState,
}

impl Dimension {
    /// Fact name of the dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OperationalMode => "operational_mode",
            Self::CampaignPhase => "campaign_phase",
            Self::BuildLayer => "build_layer",
            Self::IntentVerb => "intent_verb",
            Self::IntentTarget => "intent_target",
            Self::ShardType => "shard_type",
            Self::Language => "language",
            Self::Framework => "framework",
            Self::WorldState => "world_state",
        }
    }

    /// Parse a dimension name as stored in tag association rows.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('/').to_lowercase().as_str() {
            "operational_mode" | "mode" => Some(Self::OperationalMode),
            "campaign_phase" | "phase" => Some(Self::CampaignPhase),
            "build_layer" | "layer" => Some(Self::BuildLayer),
            "intent_verb" | "intent" | "verb" => Some(Self::IntentVerb),
            "intent_target" => Some(Self::IntentTarget),
            "shard_type" | "shard" => Some(Self::ShardType),
            "language" => Some(Self::Language),
            "framework" | "frameworks" => Some(Self::Framework),
            "world_state" | "world_states" => Some(Self::WorldState),
            _ => None,
        }
    }

    /// Whether the context carries a set of values for this dimension.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, Self::Framework | Self::WorldState)
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Description of the situation a prompt is compiled for.
///
/// Only the budget fields are required. Everything else narrows selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationContext {
    /// Total token budget for the prompt.
    pub token_budget: usize,
    /// Tokens reserved for the conversation and response.
    pub reserved_tokens: usize,
    /// Shard type, e.g. `coder` or `legislator`.
    pub shard_type: Option<String>,
    /// Shard instance identifier; selects the shard-scoped store.
    pub shard_id: Option<String>,
    /// Operational mode.
    pub operational_mode: Option<String>,
    /// Campaign phase.
    pub campaign_phase: Option<String>,
    /// Build layer.
    pub build_layer: Option<String>,
    /// Intent verb.
    pub intent_verb: Option<String>,
    /// Intent target.
    pub intent_target: Option<String>,
    /// Programming language.
    pub language: Option<String>,
    /// Frameworks in use.
    pub frameworks: BTreeSet<String>,
    /// Active world states.
    pub world_states: BTreeSet<String>,
    /// Free text for semantic search.
    pub semantic_query: Option<String>,
    /// Number of semantic hits to request.
    pub semantic_top_k: usize,
    /// Outer deadline for the whole compilation.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

impl CompilationContext {
    /// Create a context with a budget and reserved headroom.
    pub fn new(token_budget: usize, reserved_tokens: usize) -> Self {
        Self {
            token_budget,
            reserved_tokens,
            semantic_top_k: DEFAULT_SEMANTIC_TOP_K,
            ..Self::default()
        }
    }

    /// Set the shard type.
    pub fn with_shard_type(mut self, shard_type: impl Into<String>) -> Self {
        self.shard_type = Some(shard_type.into());
        self
    }

    /// Set the shard instance ID.
    pub fn with_shard_id(mut self, shard_id: impl Into<String>) -> Self {
        self.shard_id = Some(shard_id.into());
        self
    }

    /// Set the operational mode.
    pub fn with_operational_mode(mut self, mode: impl Into<String>) -> Self {
        self.operational_mode = Some(mode.into());
        self
    }

    /// Set the campaign phase.
    pub fn with_campaign_phase(mut self, phase: impl Into<String>) -> Self {
        self.campaign_phase = Some(phase.into());
        self
    }

    /// Set the build layer.
    pub fn with_build_layer(mut self, layer: impl Into<String>) -> Self {
        self.build_layer = Some(layer.into());
        self
    }

    /// Set the intent verb and optional target.
    pub fn with_intent(mut self, verb: impl Into<String>, target: Option<String>) -> Self {
        self.intent_verb = Some(verb.into());
        self.intent_target = target;
        self
    }

    /// Set the language.
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Add a framework.
    pub fn with_framework(mut self, framework: impl Into<String>) -> Self {
        self.frameworks.insert(framework.into());
        self
    }

    /// Add a world state.
    pub fn with_world_state(mut self, state: impl Into<String>) -> Self {
        self.world_states.insert(state.into());
        self
    }

    /// Set the semantic query and top-K.
    pub fn with_semantic_query(mut self, query: impl Into<String>, top_k: usize) -> Self {
        self.semantic_query = Some(query.into());
        self.semantic_top_k = top_k;
        self
    }

    /// Set an outer deadline for the compilation.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Tokens available to atoms, or `None` when headroom eats the budget.
    pub fn available_tokens(&self) -> Option<usize> {
        self.token_budget
            .checked_sub(self.reserved_tokens)
            .filter(|available| *available > 0)
    }

    /// Single context value for a dimension.
    pub fn value(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::OperationalMode => self.operational_mode.as_deref(),
            Dimension::CampaignPhase => self.campaign_phase.as_deref(),
            Dimension::BuildLayer => self.build_layer.as_deref(),
            Dimension::IntentVerb => self.intent_verb.as_deref(),
            Dimension::IntentTarget => self.intent_target.as_deref(),
            Dimension::ShardType => self.shard_type.as_deref(),
            Dimension::Language => self.language.as_deref(),
            Dimension::Framework | Dimension::WorldState => None,
        }
    }

    /// All context values for a dimension, in canonical order.
    pub fn values(&self, dimension: Dimension) -> Vec<&str> {
        match dimension {
            Dimension::Framework => self.frameworks.iter().map(String::as_str).collect(),
            Dimension::WorldState => self.world_states.iter().map(String::as_str).collect(),
            _ => self
                .value(dimension)
                .filter(|v| !v.trim().is_empty())
                .into_iter()
                .collect(),
        }
    }

    /// Whether the context is the Mangle authoring situation.
    pub fn is_mangle_authoring(&self) -> bool {
        let shard = self
            .shard_type
            .as_deref()
            .map(normalize_tag)
            .unwrap_or_default();
        let language = self
            .language
            .as_deref()
            .map(normalize_tag)
            .unwrap_or_default();
        (shard == "legislator" || shard == "mangle_repair") && language == "mangle"
    }

    /// Deterministic hash of everything that influences selection.
    pub fn context_hash(&self) -> String {
        fingerprint_hex(FingerprintKind::Context, self)
    }
}

/// Normalize a tag for comparison: trimmed, no leading slash, lowercase.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_available_tokens() {
        assert_eq!(CompilationContext::new(10_000, 1_000).available_tokens(), Some(9_000));
        assert_eq!(CompilationContext::new(1_000, 1_000).available_tokens(), None);
        assert_eq!(CompilationContext::new(500, 1_000).available_tokens(), None);
    }

    #[test]
    fn test_context_hash_determinism() {
        let a = CompilationContext::new(8_000, 500)
            .with_shard_type("coder")
            .with_framework("axum")
            .with_framework("tokio");
        let b = CompilationContext::new(8_000, 500)
            .with_shard_type("coder")
            .with_framework("tokio")
            .with_framework("axum");
        assert_eq!(a.context_hash(), b.context_hash());

        let c = a.clone().with_language("rust");
        assert_ne!(a.context_hash(), c.context_hash());
    }

    #[test]
    fn test_mangle_authoring() {
        let ctx = CompilationContext::new(1_000, 0)
            .with_shard_type("/legislator")
            .with_language("Mangle");
        assert!(ctx.is_mangle_authoring());
        assert!(!CompilationContext::new(1_000, 0)
            .with_shard_type("coder")
            .with_language("mangle")
            .is_mangle_authoring());
    }

    #[test]
    fn test_dimension_parsing() {
        assert_eq!(Dimension::from_str("/shard_type"), Some(Dimension::ShardType));
        assert_eq!(Dimension::from_str("frameworks"), Some(Dimension::Framework));
        assert_eq!(Dimension::from_str("unknown"), None);
    }
}
