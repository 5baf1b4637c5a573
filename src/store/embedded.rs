//! Embedded corpus compiled into the binary.
//!
//! Parsed once on first use and immutable thereafter. A corpus that fails to
//! parse is logged and treated as empty.

use std::sync::OnceLock;

use crate::canonical_content::compute_content_hash;
use crate::types::Atom;

const EMBEDDED_CORPUS_JSON: &str = include_str!("../../corpus/embedded.json");

static EMBEDDED_CORPUS: OnceLock<Vec<Atom>> = OnceLock::new();

/// Atoms of the embedded corpus, sorted by ID.
pub fn embedded_corpus() -> &'static [Atom] {
    EMBEDDED_CORPUS.get_or_init(|| parse_corpus(EMBEDDED_CORPUS_JSON))
}

fn parse_corpus(json: &str) -> Vec<Atom> {
    match serde_json::from_str::<Vec<Atom>>(json) {
        Ok(mut atoms) => {
            for atom in &mut atoms {
                if atom.content_hash.is_empty() {
                    atom.content_hash = compute_content_hash(&atom.content);
                }
            }
            atoms.sort_by(|a, b| a.id.cmp(&b.id));
            atoms.dedup_by(|later, earlier| later.id == earlier.id);
            tracing::debug!(atoms = atoms.len(), "Loaded embedded corpus");
            atoms
        }
        Err(e) => {
            tracing::error!(error = %e, "Embedded corpus failed to parse");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;

    #[test]
    fn test_embedded_corpus_has_skeleton() {
        let corpus = embedded_corpus();
        assert!(!corpus.is_empty());
        for category in [Category::Identity, Category::Safety, Category::Protocol, Category::Methodology] {
            assert!(corpus.iter().any(|a| a.category == category), "missing {category}");
        }
        assert!(corpus.windows(2).all(|w| w[0].id < w[1].id));
        assert!(corpus.iter().all(|a| !a.content_hash.is_empty()));
    }

    #[test]
    fn test_embedded_corpus_loaded_once() {
        assert!(std::ptr::eq(embedded_corpus(), embedded_corpus()));
    }

    #[test]
    fn test_bad_corpus_is_empty() {
        assert!(parse_corpus("{not json").is_empty());
    }
}
