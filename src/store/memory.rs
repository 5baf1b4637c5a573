//! In-memory atom store for testing and embedding applications.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{AtomRecord, AtomStore, StoreError, TagRow};
use crate::types::Atom;

/// In-memory atom store.
///
/// Uses BTreeMap for deterministic iteration order.
#[derive(Debug, Default)]
pub struct InMemoryAtomStore {
    /// Rows by atom ID.
    records: BTreeMap<String, AtomRecord>,
    /// Tag rows, kept sorted.
    tags: Vec<TagRow>,
    /// Set by `close`.
    closed: AtomicBool,
    /// Number of `load_atoms` calls.
    loads: AtomicUsize,
    /// Fail reads with this message.
    failure: Option<String>,
}

impl InMemoryAtomStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding the given atoms.
    pub fn from_atoms(atoms: impl IntoIterator<Item = Atom>) -> Self {
        let mut store = Self::new();
        for atom in atoms {
            store.add_atom(atom);
        }
        store
    }

    /// Add an atom, replacing any atom with the same ID.
    pub fn add_atom(&mut self, atom: Atom) {
        self.tags.retain(|row| row.atom_id != atom.id);
        self.tags.extend(TagRow::from_atom(&atom));
        self.tags.sort();
        self.records.insert(atom.id.clone(), AtomRecord::from_atom(&atom));
    }

    /// Add a raw row, bypassing hydration checks.
    pub fn add_record(&mut self, record: AtomRecord) {
        self.records.insert(record.id.clone(), record);
    }

    /// Add a raw tag row.
    pub fn add_tag(&mut self, row: TagRow) {
        self.tags.push(row);
        self.tags.sort();
    }

    /// Make every read fail.
    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Number of atoms.
    pub fn num_atoms(&self) -> usize {
        self.records.len()
    }

    /// Whether `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of atom reads served.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    fn check_readable(&self) -> Result<(), StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if let Some(message) = &self.failure {
            return Err(StoreError::Backend(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl AtomStore for InMemoryAtomStore {
    async fn load_atoms(&self) -> Result<Vec<AtomRecord>, StoreError> {
        self.check_readable()?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(self.records.values().cloned().collect())
    }

    async fn load_tags(&self) -> Result<Vec<TagRow>, StoreError> {
        self.check_readable()?;
        Ok(self.tags.clone())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::load_hydrated;
    use crate::types::{Category, Dimension};

    #[tokio::test]
    async fn test_round_trip() {
        let store = InMemoryAtomStore::from_atoms(vec![
            Atom::new("b", Category::Safety, "b").with_selector(Dimension::ShardType, "coder"),
            Atom::new("a", Category::Identity, "a"),
        ]);
        let atoms = load_hydrated(&store).await.unwrap();
        assert_eq!(atoms.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(atoms[1].selectors.get(Dimension::ShardType).is_some());
    }

    #[tokio::test]
    async fn test_replacing_atom_replaces_tags() {
        let mut store = InMemoryAtomStore::new();
        store.add_atom(Atom::new("a", Category::Language, "a").with_selector(Dimension::Language, "go"));
        store.add_atom(Atom::new("a", Category::Language, "a").with_selector(Dimension::Language, "rust"));
        let tags = store.load_tags().await.unwrap();
        assert_eq!(tags, vec![TagRow::new("a", "language", "rust")]);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_reads() {
        let store = InMemoryAtomStore::new();
        store.close().await.unwrap();
        assert!(store.is_closed());
        assert!(matches!(store.load_atoms().await, Err(StoreError::Closed)));
    }
}
