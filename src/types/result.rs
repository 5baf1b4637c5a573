//! Compilation output.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::atom::RenderMode;
use super::category::Category;
use super::manifest::Manifest;
use super::scored::{OrderedAtom, SelectionSource};
use crate::budget::BudgetReport;

/// How many atoms were emitted in each render mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderModeCounts {
    /// Standard variants.
    pub standard: usize,
    /// Concise variants.
    pub concise: usize,
    /// Minimal variants.
    pub min: usize,
}

impl RenderModeCounts {
    /// Count render modes over the included atoms.
    pub fn from_atoms(atoms: &[OrderedAtom]) -> Self {
        let mut counts = Self::default();
        for atom in atoms {
            match atom.render_mode {
                RenderMode::Standard => counts.standard += 1,
                RenderMode::Concise => counts.concise += 1,
                RenderMode::Min => counts.min += 1,
            }
        }
        counts
    }
}

/// Timings and counters of one compilation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationStats {
    /// Collector time.
    pub collect_ms: u64,
    /// Selector time (includes vector search).
    pub select_ms: u64,
    /// Vector search time.
    pub vector_query_ms: u64,
    /// Resolver time.
    pub resolve_ms: u64,
    /// Budgeter time.
    pub budget_ms: u64,
    /// Assembler time.
    pub assemble_ms: u64,
    /// Whole compilation.
    pub total_ms: u64,
    /// Candidates gathered by the collector.
    pub candidates: usize,
    /// Atoms synthesized from rule engine injections.
    pub kernel_injected: usize,
    /// Atoms synthesized from knowledge search.
    pub knowledge_atoms: usize,
    /// Atoms selected by the skeleton phase.
    pub skeleton_count: usize,
    /// Atoms selected by the flesh phase.
    pub flesh_count: usize,
    /// Atoms forced mandatory by the Mangle override.
    pub mangle_override_count: usize,
    /// Render mode distribution of the output.
    pub render_modes: RenderModeCounts,
    /// The flesh phase degraded to context matching.
    pub fallback_used: bool,
    /// The skeleton phase ran without a rule engine.
    pub skeleton_fallback_used: bool,
    /// Vector search hit its sub-deadline.
    pub vector_timed_out: bool,
    /// The result was served from the compile cache.
    pub cache_hit: bool,
}

/// Result of a successful compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationResult {
    /// The assembled prompt.
    pub prompt: String,
    /// Included atoms, in prompt order.
    pub included: Vec<OrderedAtom>,
    /// Tokens used by the prompt.
    pub total_tokens: usize,
    /// Tokens available after headroom.
    pub budget_limit: usize,
    /// Fraction of the available budget used.
    pub budget_utilization: f32,
    /// Tokens over the limit when mandatory atoms alone exceed it.
    pub over_budget: usize,
    /// Tokens per category.
    pub category_tokens: BTreeMap<Category, usize>,
    /// Per-category allocation report.
    pub budget_report: BudgetReport,
    /// Flight record.
    pub manifest: Manifest,
    /// Timings and counters.
    pub stats: CompilationStats,
}

impl CompilationResult {
    /// An empty result for an empty candidate set.
    pub fn empty(manifest: Manifest, budget_limit: usize, stats: CompilationStats) -> Self {
        Self {
            prompt: String::new(),
            included: Vec::new(),
            total_tokens: 0,
            budget_limit,
            budget_utilization: 0.0,
            over_budget: 0,
            category_tokens: BTreeMap::new(),
            budget_report: BudgetReport::default(),
            manifest,
            stats,
        }
    }

    /// Number of included atoms.
    pub fn atoms_included(&self) -> usize {
        self.included.len()
    }

    /// Number of included mandatory atoms.
    pub fn mandatory_count(&self) -> usize {
        self.included.iter().filter(|a| a.atom().is_mandatory).count()
    }

    /// Number of included atoms from a selection phase.
    pub fn count_from(&self, source: SelectionSource) -> usize {
        self.included.iter().filter(|a| a.scored.source == source).count()
    }

    /// Whether an atom is in the prompt.
    pub fn contains(&self, atom_id: &str) -> bool {
        self.included.iter().any(|a| a.id() == atom_id)
    }

    /// Position of an atom in the prompt.
    pub fn order_of(&self, atom_id: &str) -> Option<usize> {
        self.included.iter().find(|a| a.id() == atom_id).map(|a| a.order)
    }
}
