//! Prompt assembly and manifest generation.

use std::collections::BTreeMap;

use crate::budget::Fitted;
use crate::types::{
    Category, CompilationResult, CompilationStats, DroppedEntry, Manifest, OrderedAtom,
    RenderModeCounts,
};

/// Separator between atoms.
pub const ATOM_SEPARATOR: &str = "\n\n";

/// Render atoms in order, one blank line between them.
///
/// Each atom contributes the content of its render mode, trimmed. Atoms with
/// blank content are skipped.
pub fn render(atoms: &[OrderedAtom]) -> String {
    let parts: Vec<&str> = atoms
        .iter()
        .map(|a| a.content().trim())
        .filter(|c| !c.is_empty())
        .collect();
    parts.join(ATOM_SEPARATOR)
}

/// Tokens per category over the included atoms.
pub fn category_tokens(atoms: &[OrderedAtom]) -> BTreeMap<Category, usize> {
    let mut totals = BTreeMap::new();
    for atom in atoms {
        *totals.entry(atom.atom().category).or_default() += atom.tokens();
    }
    totals
}

/// Build the final result from the budgeter output.
///
/// `earlier_drops` are the selector and resolver drops; the budgeter's own
/// drops are appended after them.
pub fn assemble(
    context_hash: String,
    fitted: Fitted,
    earlier_drops: Vec<DroppedEntry>,
    mut stats: CompilationStats,
) -> CompilationResult {
    let Fitted {
        atoms,
        dropped,
        report,
    } = fitted;

    let prompt = render(&atoms);
    let budget_limit = report.total_budget;

    let mut all_drops = earlier_drops;
    all_drops.extend(dropped);
    let manifest = Manifest::new(context_hash, budget_limit, &atoms, all_drops);

    stats.render_modes = RenderModeCounts::from_atoms(&atoms);
    tracing::debug!(
        atoms = atoms.len(),
        tokens = manifest.total_tokens,
        budget_limit,
        "Prompt assembled"
    );

    CompilationResult {
        prompt,
        total_tokens: manifest.total_tokens,
        budget_limit,
        budget_utilization: report.utilization(),
        over_budget: manifest.over_budget,
        category_tokens: category_tokens(&atoms),
        budget_report: report,
        included: atoms,
        manifest,
        stats,
    }
}
