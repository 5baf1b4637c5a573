//! Prompt atoms: self-contained, named prompt fragments.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::category::Category;
use super::context::{normalize_tag, CompilationContext, Dimension};
use crate::canonical_content::compute_content_hash;

/// Which variant of an atom's content is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderMode {
    /// Full content.
    Standard,
    /// Concise variant.
    Concise,
    /// Minimal variant.
    Min,
}

impl RenderMode {
    /// Downgrade cascade, most expensive first.
    pub const CASCADE: [RenderMode; 3] = [Self::Standard, Self::Concise, Self::Min];

    /// Name used in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Concise => "concise",
            Self::Min => "min",
        }
    }
}

impl Default for RenderMode {
    fn default() -> Self {
        Self::Standard
    }
}

impl std::fmt::Display for RenderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Estimate the token cost of a text.
///
/// Four characters per token, rounded up. Empty text costs nothing.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Per-dimension context selectors of an atom.
///
/// A non-empty set on a dimension is a constraint: the context value must be
/// a member. Empty sets do not constrain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SelectorMap", into = "SelectorMap")]
pub struct ContextSelectors {
    /// Tags per dimension. Kept normalized (no leading slash, lowercase).
    tags: SelectorMap,
}

type SelectorMap = BTreeMap<Dimension, BTreeSet<String>>;

impl From<SelectorMap> for ContextSelectors {
    fn from(raw: SelectorMap) -> Self {
        let mut selectors = Self::default();
        for (dimension, tags) in raw {
            for tag in tags {
                selectors.insert(dimension, &tag);
            }
        }
        selectors
    }
}

impl From<ContextSelectors> for SelectorMap {
    fn from(selectors: ContextSelectors) -> Self {
        selectors.tags
    }
}

impl ContextSelectors {
    /// Create empty selectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tag on a dimension. `IntentTarget` is not selectable and is ignored.
    pub fn insert(&mut self, dimension: Dimension, tag: &str) {
        if dimension == Dimension::IntentTarget {
            return;
        }
        let tag = normalize_tag(tag);
        if tag.is_empty() {
            return;
        }
        self.tags.entry(dimension).or_default().insert(tag);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, dimension: Dimension, tag: &str) -> Self {
        self.insert(dimension, tag);
        self
    }

    /// Tags on a dimension.
    pub fn get(&self, dimension: Dimension) -> Option<&BTreeSet<String>> {
        self.tags.get(&dimension).filter(|set| !set.is_empty())
    }

    /// Constrained dimensions and their tags, in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &BTreeSet<String>)> {
        self.tags
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(dim, set)| (*dim, set))
    }

    /// Whether any dimension is constrained.
    pub fn is_unconstrained(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Whether a constrained dimension accepts the context.
    fn dimension_matches(dimension: Dimension, tags: &BTreeSet<String>, ctx: &CompilationContext) -> bool {
        ctx.values(dimension)
            .into_iter()
            .any(|value| tags.contains(&normalize_tag(value)))
    }

    /// Whether every constrained dimension accepts the context.
    pub fn matches(&self, ctx: &CompilationContext) -> bool {
        self.iter()
            .all(|(dim, tags)| Self::dimension_matches(dim, tags, ctx))
    }

    /// Heuristic logic score: matched / constrained dimensions, 0.5 when
    /// nothing is constrained.
    pub fn match_score(&self, ctx: &CompilationContext) -> f32 {
        let mut constrained = 0usize;
        let mut matched = 0usize;
        for (dim, tags) in self.iter() {
            constrained += 1;
            if Self::dimension_matches(dim, tags, ctx) {
                matched += 1;
            }
        }
        if constrained == 0 {
            0.5
        } else {
            matched as f32 / constrained as f32
        }
    }
}

/// A prompt atom.
///
/// Immutable once built; the compiler clones rather than mutates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// Stable, globally unique identifier.
    pub id: String,
    /// Monotonically increasing version.
    #[serde(default = "default_version")]
    pub version: u32,
    /// SHA-256 of the canonical primary content.
    #[serde(default)]
    pub content_hash: String,
    /// Primary content.
    pub content: String,
    /// Concise variant.
    #[serde(default)]
    pub content_concise: Option<String>,
    /// Minimal variant.
    #[serde(default)]
    pub content_min: Option<String>,
    /// Precomputed token cost of the primary content (0 = unknown).
    #[serde(default)]
    pub token_count: usize,
    /// Precomputed token cost of the concise variant.
    #[serde(default)]
    pub concise_token_count: Option<usize>,
    /// Precomputed token cost of the minimal variant.
    #[serde(default)]
    pub min_token_count: Option<usize>,
    /// Category.
    pub category: Category,
    /// Free-form subcategory.
    #[serde(default)]
    pub subcategory: Option<String>,
    /// Higher = prefer. Conventionally 0..=100.
    #[serde(default)]
    pub priority: i32,
    /// Mandatory atoms are never dropped by scoring or budgeting.
    #[serde(default)]
    pub is_mandatory: bool,
    /// At most one atom per group survives resolution.
    #[serde(default)]
    pub exclusion_group: Option<String>,
    /// IDs that must precede this atom.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// IDs that cannot co-occur with this atom.
    #[serde(default)]
    pub conflicts_with: BTreeSet<String>,
    /// Context selectors.
    #[serde(default)]
    pub selectors: ContextSelectors,
}

fn default_version() -> u32 {
    1
}

impl Atom {
    /// Create an atom with content and category; the content hash is computed.
    pub fn new(id: impl Into<String>, category: Category, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: id.into(),
            version: 1,
            content_hash: compute_content_hash(&content),
            content,
            content_concise: None,
            content_min: None,
            token_count: 0,
            concise_token_count: None,
            min_token_count: None,
            category,
            subcategory: None,
            priority: 0,
            is_mandatory: false,
            exclusion_group: None,
            depends_on: BTreeSet::new(),
            conflicts_with: BTreeSet::new(),
            selectors: ContextSelectors::new(),
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark as mandatory.
    pub fn mandatory(mut self) -> Self {
        self.is_mandatory = true;
        self
    }

    /// Set the precomputed primary token cost.
    pub fn with_tokens(mut self, tokens: usize) -> Self {
        self.token_count = tokens;
        self
    }

    /// Set the concise variant and its token cost.
    pub fn with_concise(mut self, content: impl Into<String>, tokens: Option<usize>) -> Self {
        self.content_concise = Some(content.into());
        self.concise_token_count = tokens;
        self
    }

    /// Set the minimal variant and its token cost.
    pub fn with_min(mut self, content: impl Into<String>, tokens: Option<usize>) -> Self {
        self.content_min = Some(content.into());
        self.min_token_count = tokens;
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Add a conflict.
    pub fn conflicts_with(mut self, id: impl Into<String>) -> Self {
        self.conflicts_with.insert(id.into());
        self
    }

    /// Set the exclusion group.
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.exclusion_group = Some(group.into());
        self
    }

    /// Add a selector tag.
    pub fn with_selector(mut self, dimension: Dimension, tag: &str) -> Self {
        self.selectors.insert(dimension, tag);
        self
    }

    /// Whether the atom belongs to a skeleton category.
    pub fn is_skeleton(&self) -> bool {
        self.category.is_skeleton()
    }

    /// Content for a render mode, if the variant exists.
    pub fn content_for(&self, mode: RenderMode) -> Option<&str> {
        match mode {
            RenderMode::Standard => Some(self.content.as_str()),
            RenderMode::Concise => self.content_concise.as_deref(),
            RenderMode::Min => self.content_min.as_deref(),
        }
    }

    /// Token cost of a render mode, if the variant exists.
    ///
    /// Uses the precomputed count when present, otherwise an estimate.
    pub fn tokens_for(&self, mode: RenderMode) -> Option<usize> {
        match mode {
            RenderMode::Standard => Some(if self.token_count > 0 {
                self.token_count
            } else {
                estimate_tokens(&self.content)
            }),
            RenderMode::Concise => self
                .content_concise
                .as_deref()
                .map(|text| self.concise_token_count.unwrap_or_else(|| estimate_tokens(text))),
            RenderMode::Min => self
                .content_min
                .as_deref()
                .map(|text| self.min_token_count.unwrap_or_else(|| estimate_tokens(text))),
        }
    }

    /// Whether the atom applies to a context.
    pub fn matches_context(&self, ctx: &CompilationContext) -> bool {
        self.selectors.matches(ctx)
    }

    /// Whether the atom targets a language (used by the Mangle override).
    pub fn has_language(&self, language: &str) -> bool {
        self.selectors
            .get(Dimension::Language)
            .map(|tags| tags.contains(&normalize_tag(language)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn test_tokens_for_variants() {
        let atom = Atom::new("lang/rust", Category::Language, "x".repeat(40))
            .with_tokens(800)
            .with_concise("short", Some(300));
        assert_eq!(atom.tokens_for(RenderMode::Standard), Some(800));
        assert_eq!(atom.tokens_for(RenderMode::Concise), Some(300));
        assert_eq!(atom.tokens_for(RenderMode::Min), None);

        let estimated = Atom::new("lang/go", Category::Language, "x".repeat(40));
        assert_eq!(estimated.tokens_for(RenderMode::Standard), Some(10));
    }

    #[test]
    fn test_selector_matching() {
        let atom = Atom::new("fw/axum", Category::Framework, "axum tips")
            .with_selector(Dimension::ShardType, "/coder")
            .with_selector(Dimension::Framework, "axum");

        let ctx = CompilationContext::new(1_000, 0)
            .with_shard_type("coder")
            .with_framework("axum")
            .with_framework("tokio");
        assert!(atom.matches_context(&ctx));
        assert_eq!(atom.selectors.match_score(&ctx), 1.0);

        let other = CompilationContext::new(1_000, 0).with_shard_type("coder");
        assert!(!atom.matches_context(&other));
        assert_eq!(atom.selectors.match_score(&other), 0.5);
    }

    #[test]
    fn test_unconstrained_matches_everything() {
        let atom = Atom::new("ctx/any", Category::Context, "anything");
        let ctx = CompilationContext::new(1_000, 0);
        assert!(atom.matches_context(&ctx));
        assert_eq!(atom.selectors.match_score(&ctx), 0.5);
    }

    #[test]
    fn test_intent_target_not_selectable() {
        let selectors = ContextSelectors::new().with(Dimension::IntentTarget, "main.rs");
        assert!(selectors.is_unconstrained());
    }
}
