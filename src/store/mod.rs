//! Atom storage backends.
//!
//! A store exposes two reads: atom rows and `(atom_id, dimension, tag)`
//! association rows. [`hydrate`] joins them into [`Atom`]s. The compiler
//! never writes to a store.

pub mod embedded;
pub mod memory;
pub mod schema;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::canonical_content::{compute_content_hash, validate_content_hash, HashValidation};
use crate::types::{Atom, Category, ContextSelectors, Dimension};

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store was closed.
    #[error("Store is closed")]
    Closed,
    /// Backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),
    /// Database error.
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One atom row as stored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AtomRecord {
    /// Atom ID.
    pub id: String,
    /// Version.
    pub version: u32,
    /// Stored content hash, if any.
    pub content_hash: Option<String>,
    /// Primary content.
    pub content: String,
    /// Concise variant.
    pub content_concise: Option<String>,
    /// Minimal variant.
    pub content_min: Option<String>,
    /// Precomputed primary token count.
    pub token_count: Option<usize>,
    /// Precomputed concise token count.
    pub concise_token_count: Option<usize>,
    /// Precomputed minimal token count.
    pub min_token_count: Option<usize>,
    /// Category name.
    pub category: String,
    /// Subcategory.
    pub subcategory: Option<String>,
    /// Priority.
    pub priority: i32,
    /// Mandatory flag.
    pub is_mandatory: bool,
    /// Exclusion group.
    pub exclusion_group: Option<String>,
    /// Dependencies.
    pub depends_on: Vec<String>,
    /// Conflicts.
    pub conflicts_with: Vec<String>,
    /// Optional embedding blob. Not used by the compiler itself.
    pub embedding: Option<Vec<u8>>,
}

impl AtomRecord {
    /// Flatten an atom into a row. Selectors go to [`TagRow`]s.
    pub fn from_atom(atom: &Atom) -> Self {
        Self {
            id: atom.id.clone(),
            version: atom.version,
            content_hash: Some(atom.content_hash.clone()).filter(|h| !h.is_empty()),
            content: atom.content.clone(),
            content_concise: atom.content_concise.clone(),
            content_min: atom.content_min.clone(),
            token_count: Some(atom.token_count).filter(|t| *t > 0),
            concise_token_count: atom.concise_token_count,
            min_token_count: atom.min_token_count,
            category: atom.category.as_str().to_string(),
            subcategory: atom.subcategory.clone(),
            priority: atom.priority,
            is_mandatory: atom.is_mandatory,
            exclusion_group: atom.exclusion_group.clone(),
            depends_on: atom.depends_on.iter().cloned().collect(),
            conflicts_with: atom.conflicts_with.iter().cloned().collect(),
            embedding: None,
        }
    }
}

/// One `(atom_id, dimension, tag)` association row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TagRow {
    /// Atom ID.
    pub atom_id: String,
    /// Dimension name.
    pub dimension: String,
    /// Tag value.
    pub tag: String,
}

impl TagRow {
    /// Create a tag row.
    pub fn new(atom_id: impl Into<String>, dimension: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            atom_id: atom_id.into(),
            dimension: dimension.into(),
            tag: tag.into(),
        }
    }

    /// Tag rows for an atom's selectors.
    pub fn from_atom(atom: &Atom) -> Vec<Self> {
        atom.selectors
            .iter()
            .flat_map(|(dimension, tags)| {
                tags.iter()
                    .map(move |tag| Self::new(atom.id.clone(), dimension.as_str(), tag.clone()))
            })
            .collect()
    }
}

/// Trait for atom storage backends.
///
/// Implementations should return rows ordered by atom ID.
#[async_trait]
pub trait AtomStore: Send + Sync {
    /// Read all atom rows.
    async fn load_atoms(&self) -> Result<Vec<AtomRecord>, StoreError>;

    /// Read all tag association rows.
    async fn load_tags(&self) -> Result<Vec<TagRow>, StoreError>;

    /// Release resources. Reads after closing fail with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Load and hydrate every atom of a store.
pub async fn load_hydrated(store: &dyn AtomStore) -> Result<Vec<Atom>, StoreError> {
    let records = store.load_atoms().await?;
    let tags = store.load_tags().await?;
    Ok(hydrate(records, tags))
}

/// Join atom rows and tag rows into atoms.
///
/// Malformed rows (unknown category, empty content, duplicate ID) are skipped
/// with a warning. A missing content hash is computed; a stale one is
/// replaced. Unknown tag dimensions are ignored.
pub fn hydrate(records: Vec<AtomRecord>, tags: Vec<TagRow>) -> Vec<Atom> {
    let mut selectors: BTreeMap<String, ContextSelectors> = BTreeMap::new();
    for row in tags {
        match Dimension::from_str(&row.dimension) {
            Some(dimension) => selectors
                .entry(row.atom_id)
                .or_default()
                .insert(dimension, &row.tag),
            None => tracing::warn!(
                atom_id = %row.atom_id,
                dimension = %row.dimension,
                "Ignoring tag with unknown dimension"
            ),
        }
    }

    let mut seen = BTreeSet::new();
    let mut atoms = Vec::with_capacity(records.len());
    for record in records {
        let Some(category) = Category::from_str(&record.category) else {
            tracing::warn!(atom_id = %record.id, category = %record.category, "Skipping atom with unknown category");
            continue;
        };
        if record.id.trim().is_empty() || record.content.trim().is_empty() {
            tracing::warn!(atom_id = %record.id, "Skipping atom with empty ID or content");
            continue;
        }
        if !seen.insert(record.id.clone()) {
            tracing::warn!(atom_id = %record.id, "Skipping duplicate atom row");
            continue;
        }

        let content_hash = match validate_content_hash(&record.content, record.content_hash.as_deref()) {
            HashValidation::Valid => record.content_hash.clone().unwrap_or_default(),
            HashValidation::Missing => compute_content_hash(&record.content),
            HashValidation::Mismatch { expected, computed } => {
                tracing::warn!(
                    atom_id = %record.id,
                    expected = %expected,
                    computed = %computed,
                    "Stored content hash is stale, using computed hash"
                );
                computed
            }
        };

        atoms.push(Atom {
            selectors: selectors.remove(&record.id).unwrap_or_default(),
            id: record.id,
            version: record.version.max(1),
            content_hash,
            content: record.content,
            content_concise: record.content_concise.filter(|c| !c.trim().is_empty()),
            content_min: record.content_min.filter(|c| !c.trim().is_empty()),
            token_count: record.token_count.unwrap_or(0),
            concise_token_count: record.concise_token_count,
            min_token_count: record.min_token_count,
            category,
            subcategory: record.subcategory,
            priority: record.priority,
            is_mandatory: record.is_mandatory,
            exclusion_group: record.exclusion_group.filter(|g| !g.trim().is_empty()),
            depends_on: record.depends_on.into_iter().filter(|d| !d.is_empty()).collect(),
            conflicts_with: record.conflicts_with.into_iter().filter(|c| !c.is_empty()).collect(),
        });
    }
    atoms
}

pub use embedded::embedded_corpus;
pub use memory::InMemoryAtomStore;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresAtomStore, PostgresConfig};
