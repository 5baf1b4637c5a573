//! Atom categories.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Category of a prompt atom.
///
/// The tag set is closed. `Ord` follows declaration order and is only used
/// for map keys; presentation order comes from the configured category order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Who the agent is.
    Identity,
    /// Wire and interaction protocols.
    Protocol,
    /// Safety constraints.
    Safety,
    /// How the agent approaches work.
    Methodology,
    /// Worked examples.
    Exemplar,
    /// Domain knowledge.
    Domain,
    /// Situational context.
    Context,
    /// Programming language guidance.
    Language,
    /// Framework guidance.
    Framework,
    /// Hallucination guards.
    Hallucination,
    /// Campaign instructions.
    Campaign,
    /// Initialization instructions.
    Init,
    /// Long-term goals.
    Northstar,
    /// Self-improvement loop instructions.
    Ouroboros,
    /// Retrieved or injected knowledge.
    Knowledge,
    /// Intent-specific guidance.
    Intent,
    /// Build layer guidance.
    BuildLayer,
    /// World state guidance.
    WorldState,
    /// Reviewer guidance.
    Reviewer,
}

impl Category {
    /// Every category, in declaration order.
    pub const ALL: [Category; 19] = [
        Self::Identity,
        Self::Protocol,
        Self::Safety,
        Self::Methodology,
        Self::Exemplar,
        Self::Domain,
        Self::Context,
        Self::Language,
        Self::Framework,
        Self::Hallucination,
        Self::Campaign,
        Self::Init,
        Self::Northstar,
        Self::Ouroboros,
        Self::Knowledge,
        Self::Intent,
        Self::BuildLayer,
        Self::WorldState,
        Self::Reviewer,
    ];

    /// Skeleton categories must be present in every prompt.
    pub fn is_skeleton(&self) -> bool {
        matches!(
            self,
            Self::Identity | Self::Protocol | Self::Safety | Self::Methodology
        )
    }

    /// Canonical lowercase name, as used in facts and manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Protocol => "protocol",
            Self::Safety => "safety",
            Self::Methodology => "methodology",
            Self::Exemplar => "exemplar",
            Self::Domain => "domain",
            Self::Context => "context",
            Self::Language => "language",
            Self::Framework => "framework",
            Self::Hallucination => "hallucination",
            Self::Campaign => "campaign",
            Self::Init => "init",
            Self::Northstar => "northstar",
            Self::Ouroboros => "ouroboros",
            Self::Knowledge => "knowledge",
            Self::Intent => "intent",
            Self::BuildLayer => "build_layer",
            Self::WorldState => "world_state",
            Self::Reviewer => "reviewer",
        }
    }

    /// Parse a category name. Accepts a leading slash and `-` for `_`.
    pub fn from_str(s: &str) -> Option<Self> {
        let name = s.trim().trim_start_matches('/').to_lowercase().replace('-', "_");
        Self::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skeleton_partition() {
        let skeleton: Vec<_> = Category::ALL.iter().filter(|c| c.is_skeleton()).collect();
        assert_eq!(skeleton.len(), 4);
        assert!(!Category::Knowledge.is_skeleton());
    }

    #[test]
    fn test_category_parsing() {
        assert_eq!(Category::from_str("identity"), Some(Category::Identity));
        assert_eq!(Category::from_str("/build-layer"), Some(Category::BuildLayer));
        assert_eq!(Category::from_str("WORLD_STATE"), Some(Category::WorldState));
        assert_eq!(Category::from_str("persona"), None);
    }

    #[test]
    fn test_names_round_trip() {
        for category in Category::ALL {
            assert_eq!(Category::from_str(category.as_str()), Some(category));
        }
    }
}
