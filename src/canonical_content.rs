//! Canonical content transformation for atom content hashing.
//!
//! Atom content hashes are content-addressed: the same text always yields the
//! same hash regardless of line-ending or surrounding-whitespace artifacts.
//! Synthesized atoms (kernel injections, knowledge fragments) derive their IDs
//! from a prefix of this hash so identical injections collapse to one atom.
//!
//! ```text
//! canonical_content(text) = UTF-8(trim(normalize_newlines(text)))
//! ```

use sha2::{Digest, Sha256};

/// Version of the canonical content specification.
///
/// Changes to this version invalidate all existing content hashes.
pub const CANONICAL_CONTENT_VERSION: &str = "1.0.0";

/// Hex characters of the content hash used in synthesized atom IDs.
pub const SYNTHETIC_ID_HASH_LEN: usize = 12;

/// Normalize text to canonical form: CRLF/CR → LF, then trim.
///
/// # Example
///
/// ```rust
/// use jit_prompt_compiler::canonical_content::normalize_text;
///
/// assert_eq!(normalize_text("  Hello\r\nWorld  "), "Hello\nWorld");
/// ```
pub fn normalize_text(text: &str) -> String {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    normalized.trim().to_string()
}

/// Convert text to canonical bytes for hashing.
pub fn canonical_content(text: &str) -> Vec<u8> {
    normalize_text(text).into_bytes()
}

/// Compute SHA-256 content hash of canonical content, as lowercase hex.
///
/// ```rust
/// use jit_prompt_compiler::canonical_content::compute_content_hash;
///
/// assert_eq!(compute_content_hash("Hello World").len(), 64);
/// ```
pub fn compute_content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_content(text));
    hex::encode(hasher.finalize())
}

/// ID for a synthesized atom: `<prefix>/<first 12 hex chars of content hash>`.
pub fn synthetic_atom_id(prefix: &str, content: &str) -> String {
    let hash = compute_content_hash(content);
    format!("{}/{}", prefix, &hash[..SYNTHETIC_ID_HASH_LEN])
}

/// Content hash validation result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashValidation {
    /// Hash matches canonical content.
    Valid,
    /// Hash does not match canonical content.
    Mismatch {
        /// The stored hash.
        expected: String,
        /// The hash computed from the current content.
        computed: String,
    },
    /// No hash was stored.
    Missing,
}

/// Validate a stored content hash against the canonical content.
pub fn validate_content_hash(text: &str, stored_hash: Option<&str>) -> HashValidation {
    match stored_hash.filter(|h| !h.is_empty()) {
        None => HashValidation::Missing,
        Some(expected) => {
            let computed = compute_content_hash(text);
            if computed.eq_ignore_ascii_case(expected) {
                HashValidation::Valid
            } else {
                HashValidation::Mismatch {
                    expected: expected.to_string(),
                    computed,
                }
            }
        }
    }
}
