//! Compiler and budget configuration.

pub mod budget;
pub mod compiler;
pub mod scoring;

pub use budget::{BudgetConfig, BudgetStrategy, BudgetTier, CategoryBudget};
pub use compiler::{
    CompileCacheConfig, CompilerConfig, ConflictPolicy, MangleOverride, DEFAULT_VECTOR_TIMEOUT,
};
pub use scoring::{combined_score, fallback_score, priority_boost};
