//! Compilation manifest: the flight recorder of a compilation.
//!
//! Records what was included, what was dropped, and why. Everything except
//! `compiled_at` is deterministic for a fixed input, so the manifest carries a
//! fingerprint that excludes the timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::atom::RenderMode;
use super::category::Category;
use super::scored::{OrderedAtom, SelectionSource};
use crate::canonical::{fingerprint_hex, FingerprintKind};

/// Why an atom did not make it into the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Not selected by the rule engine or context/vector scoring.
    Selector,
    /// Reported by the rule engine's `blocked_by_context`.
    BlockedByContext,
    /// A declared dependency is absent.
    MissingDependency {
        /// The absent dependency.
        dependency: String,
    },
    /// Excluded by a conflicting atom.
    Conflict {
        /// The atom that won.
        winner: String,
    },
    /// Lost its exclusion group.
    ExclusionGroup {
        /// Group name.
        group: String,
        /// The atom that won.
        winner: String,
    },
    /// Did not fit the budget in any variant.
    Budget,
    /// A dependency was dropped by the budgeter.
    BudgetDependency {
        /// The dropped dependency.
        dependency: String,
    },
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Selector => write!(f, "Selector (Logic/Vector)"),
            Self::BlockedByContext => write!(f, "Selector (Blocked by context)"),
            Self::MissingDependency { dependency } => {
                write!(f, "Resolver (Missing dependency {dependency})")
            }
            Self::Conflict { winner } => write!(f, "Resolver (Conflict with {winner})"),
            Self::ExclusionGroup { group, winner } => {
                write!(f, "Resolver (Exclusion group {group}, kept {winner})")
            }
            Self::Budget => write!(f, "Budget"),
            Self::BudgetDependency { dependency } => {
                write!(f, "Budget/Dependency ({dependency})")
            }
        }
    }
}

/// A selected atom in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Atom ID.
    pub atom_id: String,
    /// Category.
    pub category: Category,
    /// Selection phase.
    pub source: SelectionSource,
    /// Atom priority.
    pub priority: i32,
    /// Logic score.
    pub logic_score: f32,
    /// Vector score.
    pub vector_score: f32,
    /// Chosen render mode.
    pub render_mode: RenderMode,
    /// Tokens spent.
    pub tokens: usize,
}

impl ManifestEntry {
    /// Build an entry from an ordered atom.
    pub fn from_ordered(atom: &OrderedAtom) -> Self {
        Self {
            atom_id: atom.id().to_string(),
            category: atom.atom().category,
            source: atom.scored.source,
            priority: atom.atom().priority,
            logic_score: atom.scored.logic_score,
            vector_score: atom.scored.vector_score,
            render_mode: atom.render_mode,
            tokens: atom.tokens(),
        }
    }
}

/// A dropped atom in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEntry {
    /// Atom ID.
    pub atom_id: String,
    /// Why it was dropped.
    pub reason: DropReason,
}

impl DroppedEntry {
    /// Create a dropped entry.
    pub fn new(atom_id: impl Into<String>, reason: DropReason) -> Self {
        Self {
            atom_id: atom_id.into(),
            reason,
        }
    }
}

/// Per-compilation flight record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    /// When the compilation finished.
    pub compiled_at: DateTime<Utc>,
    /// Hash of the compilation context.
    pub context_hash: String,
    /// Tokens used by the prompt.
    pub total_tokens: usize,
    /// Tokens available after headroom.
    pub budget_limit: usize,
    /// Tokens over the limit when mandatory atoms alone exceed it.
    pub over_budget: usize,
    /// Selected atoms, in prompt order.
    pub selected: Vec<ManifestEntry>,
    /// Dropped atoms, sorted by ID.
    pub dropped: Vec<DroppedEntry>,
}

/// Deterministic view of the manifest used for the fingerprint.
#[derive(Serialize)]
struct ManifestCanonical<'a> {
    context_hash: &'a str,
    total_tokens: usize,
    budget_limit: usize,
    over_budget: usize,
    selected: &'a [ManifestEntry],
    dropped: &'a [DroppedEntry],
}

impl Manifest {
    /// Build a manifest. Dropped entries are sorted and de-duplicated by ID,
    /// keeping the first reason recorded for each atom.
    pub fn new(
        context_hash: String,
        budget_limit: usize,
        included: &[OrderedAtom],
        dropped: Vec<DroppedEntry>,
    ) -> Self {
        let selected: Vec<ManifestEntry> = included.iter().map(ManifestEntry::from_ordered).collect();
        let total_tokens = selected.iter().map(|e| e.tokens).sum();

        let mut seen = std::collections::BTreeMap::new();
        for entry in dropped {
            seen.entry(entry.atom_id.clone()).or_insert(entry);
        }

        Self {
            compiled_at: Utc::now(),
            context_hash,
            total_tokens,
            budget_limit,
            over_budget: total_tokens.saturating_sub(budget_limit),
            selected,
            dropped: seen.into_values().collect(),
        }
    }

    /// Fingerprint of the manifest excluding the timestamp.
    pub fn fingerprint(&self) -> String {
        fingerprint_hex(FingerprintKind::Manifest, &ManifestCanonical {
            context_hash: &self.context_hash,
            total_tokens: self.total_tokens,
            budget_limit: self.budget_limit,
            over_budget: self.over_budget,
            selected: &self.selected,
            dropped: &self.dropped,
        })
    }

    /// Reason an atom was dropped, if it was.
    pub fn drop_reason(&self, atom_id: &str) -> Option<&DropReason> {
        self.dropped
            .binary_search_by(|e| e.atom_id.as_str().cmp(atom_id))
            .ok()
            .map(|idx| &self.dropped[idx].reason)
    }

    /// Whether an atom was selected.
    pub fn is_selected(&self, atom_id: &str) -> bool {
        self.selected.iter().any(|e| e.atom_id == atom_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Atom, ScoredAtom};

    fn ordered(id: &str, tokens: usize, order: usize) -> OrderedAtom {
        let atom = Atom::new(id, Category::Identity, id).with_tokens(tokens);
        OrderedAtom::new(ScoredAtom::skeleton(atom, "skeleton:test"), order)
    }

    #[test]
    fn test_manifest_totals_and_overage() {
        let included = vec![ordered("a", 60, 0), ordered("b", 50, 1)];
        let manifest = Manifest::new("ctx".to_string(), 100, &included, Vec::new());
        assert_eq!(manifest.total_tokens, 110);
        assert_eq!(manifest.over_budget, 10);
        assert!(manifest.is_selected("a"));
    }

    #[test]
    fn test_dropped_sorted_first_reason_wins() {
        let dropped = vec![
            DroppedEntry::new("z", DropReason::Budget),
            DroppedEntry::new("a", DropReason::Selector),
            DroppedEntry::new("z", DropReason::Selector),
        ];
        let manifest = Manifest::new("ctx".to_string(), 100, &[], dropped);
        assert_eq!(manifest.dropped.len(), 2);
        assert_eq!(manifest.dropped[0].atom_id, "a");
        assert_eq!(manifest.drop_reason("z"), Some(&DropReason::Budget));
    }

    #[test]
    fn test_fingerprint_ignores_timestamp() {
        let included = vec![ordered("a", 10, 0)];
        let m1 = Manifest::new("ctx".to_string(), 100, &included, Vec::new());
        let mut m2 = m1.clone();
        m2.compiled_at = m2.compiled_at + chrono::Duration::seconds(30);
        assert_eq!(m1.fingerprint(), m2.fingerprint());
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(DropReason::Selector.to_string(), "Selector (Logic/Vector)");
        assert_eq!(
            DropReason::BudgetDependency { dependency: "a".into() }.to_string(),
            "Budget/Dependency (a)"
        );
    }
}
