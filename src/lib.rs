//! # jit-prompt-compiler
//!
//! Just-in-time system prompt compilation from fine-grained atoms.
//!
//! The compiler answers one question:
//!
//! > Given a runtime context and a token budget, which prompt atoms go into
//! > the system prompt, in which order, and in which variant?
//!
//! ## Core Contract
//!
//! 1. A deterministic **skeleton** (identity, protocol, safety, methodology)
//!    is always present, or compilation fails CRITICAL
//! 2. Probabilistic **flesh** enriches the skeleton from rule engine logic
//!    and vector similarity, degrading to context matching
//! 3. Dependencies are honored, cycles are fatal, conflicts and exclusion
//!    groups are arbitrated
//! 4. The result fits the budget by category, downscaling to concise and
//!    minimal variants, and every decision lands in the manifest
//!
//! ## Architecture
//!
//! ```text
//! Context → Collector → Selector → Resolver → Budgeter → Assembler → Result
//!              ↓           ↓
//!         AtomStore    RuleEngine / Searcher
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same context + same candidates + same config → byte-identical prompt
//! - Every sort breaks ties on atom ID
//! - Observable maps are BTreeMaps
//! - Synthesized atoms carry content-hash IDs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod policy;
pub mod engine;
pub mod store;
pub mod collector;
pub mod selector;
pub mod resolver;
pub mod budget;
pub mod assembler;
pub mod compiler;
pub mod interrupt;
pub mod canonical;
pub mod canonical_content;

// Re-exports
pub use types::{
    Atom, Category, CompilationContext, CompilationResult, CompilationStats, ContextSelectors,
    Dimension, DropReason, DroppedEntry, Manifest, ManifestEntry, OrderedAtom, RenderMode,
    RenderModeCounts, ScoredAtom, SelectionSource,
};
pub use policy::{
    BudgetConfig, BudgetStrategy, BudgetTier, CategoryBudget, CompileCacheConfig, CompilerConfig,
    ConflictPolicy, MangleOverride,
};
pub use engine::{
    CollaboratorError, KnowledgeFragment, KnowledgeStore, QueryRow, RuleEngine, SearchHit,
    Searcher, Term,
};
pub use engine::{ScriptedRuleEngine, StaticKnowledgeStore, StaticSearcher};
pub use store::{AtomRecord, AtomStore, InMemoryAtomStore, StoreError, TagRow, embedded_corpus};
#[cfg(feature = "postgres")]
pub use store::{PostgresAtomStore, PostgresConfig};
pub use resolver::{DependencyError, DependencyErrorKind, Resolution, Resolver};
pub use budget::{BudgetError, BudgetReport, Budgeter, CategoryUsage, Fitted};
pub use selector::{Selection, Selector, SelectorError};
pub use collector::{Collected, Collector, Sources};
pub use compiler::{CompileError, CompileErrorKind, JitCompiler};
pub use interrupt::Interrupted;
pub use canonical::{fingerprint, fingerprint_hex, Fingerprint, FingerprintKind};
pub use canonical_content::{
    normalize_text, canonical_content, compute_content_hash, validate_content_hash,
    HashValidation, CANONICAL_CONTENT_VERSION,
};
pub use tokio_util::sync::CancellationToken;

/// Schema version of the result, manifest and atom types.
/// Increment on breaking changes to any serialized type.
pub const COMPILER_SCHEMA_VERSION: &str = "1.0.0";

/// Default configuration version identifier.
pub const DEFAULT_CONFIG_VERSION: &str = "jit_compiler_v1";
