//! Compiler configuration.
//!
//! ## Float Normalization for Deterministic Hashing
//!
//! Floats are quantized to integers before hashing so `params_hash` does not
//! depend on float formatting. The quantization factor is 1e6 (multiply by
//! 1,000,000 and round to i64). The hash is part of the compile cache key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::budget::{BudgetConfig, BudgetStrategy, BudgetTier};
use crate::canonical::{fingerprint_hex, FingerprintKind};
use crate::types::Category;
use crate::DEFAULT_CONFIG_VERSION;

/// Quantization factor for float normalization.
const FLOAT_QUANTIZATION_FACTOR: f64 = 1_000_000.0;

/// Default sub-deadline for vector search.
pub const DEFAULT_VECTOR_TIMEOUT: Duration = Duration::from_secs(10);

/// Quantize a float to an i64 for deterministic hashing.
pub(crate) fn quantize_float(value: f32) -> i64 {
    ((value as f64) * FLOAT_QUANTIZATION_FACTOR).round() as i64
}

/// How unreciprocated conflicts are arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Only conflicts declared by already-admitted atoms exclude later ones.
    Asymmetric,
    /// A later atom declaring a conflict with an admitted atom is dropped too.
    Symmetric,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self::Asymmetric
    }
}

/// Caps of the Mangle authoring override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MangleOverride {
    /// Whether the override runs at all.
    pub enabled: bool,
    /// Absolute token cap.
    pub max_tokens: usize,
    /// Atom count cap.
    pub max_atoms: usize,
    /// Cap as a fraction of the available budget (0.0-1.0).
    pub max_budget_fraction: f32,
}

impl MangleOverride {
    /// Effective token cap for an available budget.
    pub fn token_cap(&self, available: usize) -> usize {
        let fraction = (available as f64 * self.max_budget_fraction as f64).floor() as usize;
        self.max_tokens.min(fraction)
    }
}

impl Default for MangleOverride {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: 900_000,
            max_atoms: 600,
            max_budget_fraction: 0.9,
        }
    }
}

/// Compile cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileCacheConfig {
    /// Whether results are cached.
    pub enabled: bool,
    /// Maximum cached results.
    pub max_entries: usize,
}

impl Default for CompileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 64,
        }
    }
}

/// Compiler configuration.
///
/// ## Parameters
///
/// - `vector_weight`: share of the vector score in the combined flesh score
/// - `vector_timeout_ms`: sub-deadline of vector search, independent of the
///   caller's deadline
/// - `allow_missing_deps`: keep atoms whose dependencies are absent
/// - `conflict_policy`: asymmetric (default) or symmetric arbitration
/// - `sort_by_category`: reorder output by `category_order`
/// - `require_rule_engine`: fail the skeleton phase when no engine is attached
/// - `knowledge_top_k`: fragments requested from the knowledge store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Config version identifier.
    pub version: String,
    /// Weight of the vector score (0.0-1.0).
    pub vector_weight: f32,
    /// Vector search sub-deadline in milliseconds.
    pub vector_timeout_ms: u64,
    /// Keep atoms whose dependencies are absent.
    pub allow_missing_deps: bool,
    /// Conflict arbitration policy.
    pub conflict_policy: ConflictPolicy,
    /// Order the output by category.
    pub sort_by_category: bool,
    /// Canonical category order.
    pub category_order: Vec<Category>,
    /// Fail instead of falling back when no rule engine is attached.
    pub require_rule_engine: bool,
    /// Knowledge fragments requested per compilation.
    pub knowledge_top_k: usize,
    /// Mangle authoring override.
    pub mangle: MangleOverride,
    /// Compile cache.
    pub cache: CompileCacheConfig,
    /// Token budget allocation.
    pub budget: BudgetConfig,
}

/// Quantized category budget for deterministic hashing.
#[derive(Serialize)]
struct QuantizedCategoryBudget {
    base_percent: i64,
    min_tokens: usize,
    max_tokens: usize,
    tier: BudgetTier,
    can_exceed_max: bool,
}

/// Quantized compiler parameters for deterministic hashing.
#[derive(Serialize)]
struct QuantizedConfigParams {
    version: String,
    vector_weight: i64,
    vector_timeout_ms: u64,
    allow_missing_deps: bool,
    conflict_policy: ConflictPolicy,
    sort_by_category: bool,
    category_order: Vec<Category>,
    require_rule_engine: bool,
    knowledge_top_k: usize,
    mangle_enabled: bool,
    mangle_max_tokens: usize,
    mangle_max_atoms: usize,
    mangle_max_budget_fraction: i64,
    budget_strategy: BudgetStrategy,
    budget_categories: BTreeMap<Category, QuantizedCategoryBudget>,
}

impl CompilerConfig {
    /// Create a config with custom selection parameters and defaults elsewhere.
    pub fn new(vector_weight: f32, vector_timeout: Duration, allow_missing_deps: bool) -> Self {
        Self {
            vector_weight: vector_weight.clamp(0.0, 1.0),
            vector_timeout_ms: vector_timeout.as_millis() as u64,
            allow_missing_deps,
            ..Self::default()
        }
    }

    /// Vector search sub-deadline.
    pub fn vector_timeout(&self) -> Duration {
        Duration::from_millis(self.vector_timeout_ms)
    }

    /// Rank of a category in the canonical order. Unknown categories rank
    /// after every known one.
    pub fn category_rank(&self, category: Category) -> usize {
        self.category_order
            .iter()
            .position(|c| *c == category)
            .unwrap_or(self.category_order.len())
    }

    /// Use a different budget configuration.
    pub fn with_budget(mut self, budget: BudgetConfig) -> Self {
        self.budget = budget;
        self
    }

    /// Use a different conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Compute a hash of the configuration parameters.
    ///
    /// Uses quantized float representation so the hash is stable across
    /// float serialization settings.
    pub fn params_hash(&self) -> String {
        fingerprint_hex(FingerprintKind::Config, &self.to_quantized())
    }

    fn to_quantized(&self) -> QuantizedConfigParams {
        QuantizedConfigParams {
            version: self.version.clone(),
            vector_weight: quantize_float(self.vector_weight),
            vector_timeout_ms: self.vector_timeout_ms,
            allow_missing_deps: self.allow_missing_deps,
            conflict_policy: self.conflict_policy,
            sort_by_category: self.sort_by_category,
            category_order: self.category_order.clone(),
            require_rule_engine: self.require_rule_engine,
            knowledge_top_k: self.knowledge_top_k,
            mangle_enabled: self.mangle.enabled,
            mangle_max_tokens: self.mangle.max_tokens,
            mangle_max_atoms: self.mangle.max_atoms,
            mangle_max_budget_fraction: quantize_float(self.mangle.max_budget_fraction),
            budget_strategy: self.budget.strategy,
            budget_categories: self
                .budget
                .categories
                .iter()
                .map(|(category, rule)| {
                    (
                        *category,
                        QuantizedCategoryBudget {
                            base_percent: quantize_float(rule.base_percent),
                            min_tokens: rule.min_tokens,
                            max_tokens: rule.max_tokens,
                            tier: rule.tier,
                            can_exceed_max: rule.can_exceed_max,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Canonical presentation order of categories.
pub fn default_category_order() -> Vec<Category> {
    vec![
        Category::Identity,
        Category::Safety,
        Category::Protocol,
        Category::Methodology,
        Category::Hallucination,
        Category::Language,
        Category::Framework,
        Category::Domain,
        Category::Context,
        Category::WorldState,
        Category::BuildLayer,
        Category::Intent,
        Category::Knowledge,
        Category::Campaign,
        Category::Init,
        Category::Reviewer,
        Category::Exemplar,
        Category::Northstar,
        Category::Ouroboros,
    ]
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CONFIG_VERSION.to_string(),
            vector_weight: 0.3,
            vector_timeout_ms: DEFAULT_VECTOR_TIMEOUT.as_millis() as u64,
            allow_missing_deps: false,
            conflict_policy: ConflictPolicy::default(),
            sort_by_category: true,
            category_order: default_category_order(),
            require_rule_engine: false,
            knowledge_top_k: 5,
            mangle: MangleOverride::default(),
            cache: CompileCacheConfig::default(),
            budget: BudgetConfig::default(),
        }
    }
}
