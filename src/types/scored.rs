//! Score and order wrappers around atoms.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::atom::{Atom, RenderMode};

/// Which selection phase produced an atom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    /// Deterministic skeleton phase.
    Skeleton,
    /// Probabilistic flesh phase.
    Flesh,
}

impl SelectionSource {
    /// Parse the source argument of a `selected_result` row.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().trim_start_matches('/').to_lowercase().as_str() {
            "skeleton" => Some(Self::Skeleton),
            "flesh" => Some(Self::Flesh),
            _ => None,
        }
    }
}

impl fmt::Display for SelectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skeleton => write!(f, "skeleton"),
            Self::Flesh => write!(f, "flesh"),
        }
    }
}

/// An atom with its selection scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredAtom {
    /// The atom.
    pub atom: Atom,
    /// Logic (rule or context match) score [0, 1].
    pub logic_score: f32,
    /// Vector similarity score [0, 1].
    pub vector_score: f32,
    /// Combined score [0, 1].
    pub combined: f32,
    /// Why the atom was selected.
    pub reason: String,
    /// Phase that selected the atom.
    pub source: SelectionSource,
}

impl ScoredAtom {
    /// Wrap an atom selected by the skeleton phase.
    pub fn skeleton(atom: Atom, reason: impl Into<String>) -> Self {
        Self {
            atom,
            logic_score: 1.0,
            vector_score: 0.0,
            combined: 1.0,
            reason: reason.into(),
            source: SelectionSource::Skeleton,
        }
    }

    /// Wrap an atom selected by the flesh phase.
    pub fn flesh(atom: Atom, logic_score: f32, vector_score: f32, combined: f32, reason: impl Into<String>) -> Self {
        Self {
            atom,
            logic_score,
            vector_score,
            combined: combined.clamp(0.0, 1.0),
            reason: reason.into(),
            source: SelectionSource::Flesh,
        }
    }

    /// Wrap an atom with an explicit combined score (tests and tools).
    pub fn with_score(atom: Atom, combined: f32) -> Self {
        let source = if atom.is_skeleton() {
            SelectionSource::Skeleton
        } else {
            SelectionSource::Flesh
        };
        Self {
            atom,
            logic_score: combined,
            vector_score: 0.0,
            combined,
            reason: "explicit".to_string(),
            source,
        }
    }

    /// Atom ID.
    pub fn id(&self) -> &str {
        &self.atom.id
    }

    /// Resolution order: mandatory first, then combined desc, priority desc,
    /// ID asc. `Ordering::Less` means "comes first".
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        other
            .atom
            .is_mandatory
            .cmp(&self.atom.is_mandatory)
            .then_with(|| other.combined.total_cmp(&self.combined))
            .then_with(|| other.atom.priority.cmp(&self.atom.priority))
            .then_with(|| self.atom.id.cmp(&other.atom.id))
    }
}

/// An atom placed in the final order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedAtom {
    /// The scored atom.
    pub scored: ScoredAtom,
    /// Position in the prompt, from 0.
    pub order: usize,
    /// Variant chosen by the budgeter.
    pub render_mode: RenderMode,
}

impl OrderedAtom {
    /// Create an ordered atom rendered in standard mode.
    pub fn new(scored: ScoredAtom, order: usize) -> Self {
        Self {
            scored,
            order,
            render_mode: RenderMode::Standard,
        }
    }

    /// The atom.
    pub fn atom(&self) -> &Atom {
        &self.scored.atom
    }

    /// Atom ID.
    pub fn id(&self) -> &str {
        &self.scored.atom.id
    }

    /// Combined score.
    pub fn score(&self) -> f32 {
        self.scored.combined
    }

    /// Content for the chosen render mode, falling back to standard.
    pub fn content(&self) -> &str {
        self.atom()
            .content_for(self.render_mode)
            .unwrap_or(self.atom().content.as_str())
    }

    /// Token cost for the chosen render mode.
    pub fn tokens(&self) -> usize {
        self.atom()
            .tokens_for(self.render_mode)
            .or_else(|| self.atom().tokens_for(RenderMode::Standard))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    #[test]
    fn test_rank_mandatory_first() {
        let optional = ScoredAtom::with_score(Atom::new("b", Category::Domain, "b"), 0.9);
        let mandatory = ScoredAtom::with_score(Atom::new("a", Category::Domain, "a").mandatory(), 0.1);
        assert_eq!(mandatory.rank_cmp(&optional), Ordering::Less);
    }

    #[test]
    fn test_rank_ties_break_on_id() {
        let a = ScoredAtom::with_score(Atom::new("a", Category::Domain, "a"), 0.5);
        let b = ScoredAtom::with_score(Atom::new("b", Category::Domain, "b"), 0.5);
        assert_eq!(a.rank_cmp(&b), Ordering::Less);
        assert_eq!(b.rank_cmp(&a), Ordering::Greater);
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!(SelectionSource::from_str("/skeleton"), Some(SelectionSource::Skeleton));
        assert_eq!(SelectionSource::from_str("flesh"), Some(SelectionSource::Flesh));
        assert_eq!(SelectionSource::from_str("bone"), None);
    }
}
