//! Mangle authoring override.
//!
//! When a legislator or repair shard authors Mangle, the Mangle language atoms
//! are promoted to mandatory so the budgeter never trades them away. The
//! promotion is capped by token count, atom count and a share of the budget.

use std::collections::BTreeSet;

use crate::policy::MangleOverride;
use crate::types::{Atom, CompilationContext, RenderMode};

/// Language tag that triggers the override.
pub const MANGLE_LANGUAGE: &str = "mangle";

/// Promote Mangle atoms to mandatory. Returns the candidates (same order) and
/// the number of promoted atoms.
///
/// Atoms are chosen by priority desc, token cost asc, ID asc. An atom that
/// would exceed a cap is skipped and smaller atoms are still considered.
pub fn apply_mangle_override(
    candidates: Vec<Atom>,
    ctx: &CompilationContext,
    caps: &MangleOverride,
) -> (Vec<Atom>, usize) {
    if !caps.enabled || !ctx.is_mangle_authoring() {
        return (candidates, 0);
    }
    let available = ctx.available_tokens().unwrap_or(0);
    let token_cap = caps.token_cap(available);

    let mut eligible: Vec<(&Atom, usize)> = candidates
        .iter()
        .filter(|a| !a.is_mandatory && a.has_language(MANGLE_LANGUAGE))
        .map(|a| (a, a.tokens_for(RenderMode::Standard).unwrap_or(0)))
        .collect();
    eligible.sort_by(|(a, a_tokens), (b, b_tokens)| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a_tokens.cmp(b_tokens))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut promoted = BTreeSet::new();
    let mut used = 0usize;
    for (atom, tokens) in eligible {
        if promoted.len() >= caps.max_atoms {
            break;
        }
        if used + tokens > token_cap {
            continue;
        }
        used += tokens;
        promoted.insert(atom.id.clone());
    }

    if !promoted.is_empty() {
        tracing::info!(
            promoted = promoted.len(),
            tokens = used,
            token_cap,
            "Mangle override promoted atoms to mandatory"
        );
    }

    let count = promoted.len();
    let candidates = candidates
        .into_iter()
        .map(|atom| {
            if promoted.contains(&atom.id) {
                Atom {
                    is_mandatory: true,
                    ..atom
                }
            } else {
                atom
            }
        })
        .collect();
    (candidates, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Category, Dimension};

    fn mangle_atom(id: &str, priority: i32, tokens: usize) -> Atom {
        Atom::new(id, Category::Language, id)
            .with_priority(priority)
            .with_tokens(tokens)
            .with_selector(Dimension::Language, "mangle")
    }

    fn legislator(budget: usize) -> CompilationContext {
        CompilationContext::new(budget, 0)
            .with_shard_type("legislator")
            .with_language("/mangle")
    }

    #[test]
    fn test_only_in_mangle_authoring() {
        let atoms = vec![mangle_atom("m/a", 50, 10)];
        let ctx = CompilationContext::new(1_000, 0).with_shard_type("coder").with_language("mangle");
        let (atoms, count) = apply_mangle_override(atoms, &ctx, &MangleOverride::default());
        assert_eq!(count, 0);
        assert!(!atoms[0].is_mandatory);
    }

    #[test]
    fn test_budget_fraction_cap() {
        // 90% of 1 000 = 900 tokens.
        let atoms = vec![
            mangle_atom("m/a", 90, 500),
            mangle_atom("m/b", 80, 500),
            mangle_atom("m/c", 70, 300),
            Atom::new("lang/go", Category::Language, "go").with_tokens(10),
        ];
        let (atoms, count) = apply_mangle_override(atoms, &legislator(1_000), &MangleOverride::default());
        assert_eq!(count, 2);
        let mandatory: Vec<&str> = atoms.iter().filter(|a| a.is_mandatory).map(|a| a.id.as_str()).collect();
        assert_eq!(mandatory, vec!["m/a", "m/c"]);
    }

    #[test]
    fn test_atom_count_cap_and_order() {
        let caps = MangleOverride {
            max_atoms: 2,
            ..MangleOverride::default()
        };
        let atoms = vec![
            mangle_atom("m/z", 50, 10),
            mangle_atom("m/y", 50, 5),
            mangle_atom("m/x", 50, 5),
        ];
        let (atoms, count) = apply_mangle_override(atoms, &legislator(10_000), &caps);
        assert_eq!(count, 2);
        assert!(!atoms[0].is_mandatory);
        assert!(atoms[1].is_mandatory && atoms[2].is_mandatory);
    }
}
