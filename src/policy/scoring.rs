//! Combined scoring for flesh selection.

use super::compiler::CompilerConfig;

/// Largest boost a priority can add to a combined score.
pub const MAX_PRIORITY_BOOST: f32 = 0.1;

/// Logic score given to fallback context matches.
pub const FALLBACK_LOGIC_SCORE: f32 = 0.5;

/// Score boost for a priority: `min(priority / 1000, 0.1)`, never negative.
pub fn priority_boost(priority: i32) -> f32 {
    (priority.max(0) as f32 / 1000.0).min(MAX_PRIORITY_BOOST)
}

/// Combined score of a rule-selected flesh atom.
///
/// Formula:
/// ```text
/// combined = min(1, (1 - w) * logic + w * vector + min(priority / 1000, 0.1))
/// ```
///
/// Mandatory atoms are pinned to 1.0.
pub fn combined_score(
    logic: f32,
    vector: f32,
    priority: i32,
    is_mandatory: bool,
    config: &CompilerConfig,
) -> f32 {
    if is_mandatory {
        return 1.0;
    }
    let w = config.vector_weight;
    ((1.0 - w) * logic + w * vector + priority_boost(priority)).clamp(0.0, 1.0)
}

/// Combined score of a fallback context match: `0.5 + 0.5 * vector`.
///
/// Mandatory atoms are pinned to 1.0.
pub fn fallback_score(vector: f32, is_mandatory: bool) -> f32 {
    if is_mandatory {
        1.0
    } else {
        (FALLBACK_LOGIC_SCORE + 0.5 * vector).clamp(0.0, 1.0)
    }
}
