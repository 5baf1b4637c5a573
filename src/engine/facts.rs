//! Wire-format fact builders.
//!
//! ```text
//! current_context(/shard_type, /coder)
//! atom('identity/core')
//! atom_category('identity/core', '/identity')
//! atom_priority('identity/core', 90)
//! is_mandatory('identity/core')
//! prompt_atom('identity/core', /identity, 90, '3f2a…', /true)
//! atom_tag('identity/core', /language, /rust)
//! atom_requires('a', 'b')
//! atom_conflicts('a', 'c')
//! vector_hit('a', 0.8125)
//! ```
//!
//! Fact order is deterministic: context dimensions in canonical order, atom
//! facts in the order above, selector tags sorted.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::types::{normalize_tag, Atom, CompilationContext, Dimension};

/// Dimensions asserted as `current_context` facts.
pub const CONTEXT_DIMENSIONS: [Dimension; 8] = [
    Dimension::OperationalMode,
    Dimension::CampaignPhase,
    Dimension::BuildLayer,
    Dimension::IntentVerb,
    Dimension::ShardType,
    Dimension::Language,
    Dimension::Framework,
    Dimension::WorldState,
];

fn name_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9_]+").ok()).as_ref()
}

/// Quote a string argument, escaping backslashes and single quotes.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Reverse of the escaping done by [`quote`].
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Name constant for a tag: `/` + normalized tag, other characters folded to `_`.
pub fn name(value: &str) -> String {
    let tag = normalize_tag(value);
    match name_regex() {
        Some(re) => format!("/{}", re.replace_all(&tag, "_")),
        None => format!("/{tag}"),
    }
}

/// `current_context` facts for every non-empty selectable dimension.
pub fn context_facts(ctx: &CompilationContext) -> Vec<String> {
    let mut facts = Vec::new();
    for dimension in CONTEXT_DIMENSIONS {
        for value in ctx.values(dimension) {
            if normalize_tag(value).is_empty() {
                continue;
            }
            facts.push(format!(
                "current_context({}, {})",
                name(dimension.as_str()),
                name(value)
            ));
        }
    }
    facts
}

/// Facts describing one atom.
pub fn atom_facts(atom: &Atom) -> Vec<String> {
    let id = quote(&atom.id);
    let category = name(atom.category.as_str());
    let mut facts = vec![
        format!("atom({id})"),
        format!("atom_category({id}, {})", quote(&category)),
        format!("atom_priority({id}, {})", atom.priority),
    ];
    if atom.is_mandatory {
        facts.push(format!("is_mandatory({id})"));
    }
    facts.push(format!(
        "prompt_atom({id}, {category}, {}, {}, {})",
        atom.priority,
        quote(&atom.content_hash),
        if atom.is_mandatory { "/true" } else { "/false" }
    ));
    for (dimension, tags) in atom.selectors.iter() {
        for tag in tags {
            facts.push(format!(
                "atom_tag({id}, {}, {})",
                name(dimension.as_str()),
                name(tag)
            ));
        }
    }
    for dep in &atom.depends_on {
        facts.push(format!("atom_requires({id}, {})", quote(dep)));
    }
    for other in &atom.conflicts_with {
        facts.push(format!("atom_conflicts({id}, {})", quote(other)));
    }
    facts
}

/// Facts for a set of atoms, in slice order.
pub fn atoms_facts<'a>(atoms: impl IntoIterator<Item = &'a Atom>) -> Vec<String> {
    atoms.into_iter().flat_map(atom_facts).collect()
}

/// `vector_hit` fact with a 4-decimal score.
pub fn vector_hit_fact(atom_id: &str, score: f32) -> String {
    format!("vector_hit({}, {:.4})", quote(atom_id), score)
}
