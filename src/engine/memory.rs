//! In-memory collaborators for tests and embedding applications.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    CollaboratorError, KnowledgeFragment, KnowledgeStore, QueryRow, RuleEngine, SearchHit,
    Searcher, Term,
};
use crate::types::Category;

/// Rule engine answering from scripted rows.
///
/// Facts are recorded, never evaluated. With [`select_all`](Self::select_all)
/// every asserted `prompt_atom` is echoed back as a `selected_result` row, which
/// stands in for a rule base that accepts every candidate.
#[derive(Debug, Default)]
pub struct ScriptedRuleEngine {
    rows: BTreeMap<String, Vec<QueryRow>>,
    select_all: bool,
    assert_limit: Option<usize>,
    failing_queries: BTreeSet<String>,
    asserted: Mutex<BTreeSet<String>>,
    prompt_atoms: Mutex<BTreeMap<String, (Category, i64)>>,
    assert_calls: AtomicUsize,
}

impl ScriptedRuleEngine {
    /// Create an engine with no rows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a row returned when its predicate is queried.
    pub fn with_row(mut self, row: QueryRow) -> Self {
        self.rows.entry(row.predicate.clone()).or_default().push(row);
        self
    }

    /// Add a row in wire format.
    pub fn with_parsed(self, line: &str) -> Result<Self, CollaboratorError> {
        let row = QueryRow::parse(line)?;
        Ok(self.with_row(row))
    }

    /// Add a `selected_result(ID, priority, /source)` row.
    pub fn with_selected(self, atom_id: &str, priority: i64, source: &str) -> Self {
        self.with_row(QueryRow::new(
            "selected_result",
            vec![
                Term::Str(atom_id.to_string()),
                Term::Int(priority),
                Term::Name(source.trim_start_matches('/').to_string()),
            ],
        ))
    }

    /// Echo every asserted atom as selected.
    pub fn select_all(mut self) -> Self {
        self.select_all = true;
        self
    }

    /// Make every `assert_batch` fail.
    pub fn fail_asserts(self) -> Self {
        self.fail_asserts_after(0)
    }

    /// Accept the first `calls` batches, then fail every `assert_batch`.
    pub fn fail_asserts_after(mut self, calls: usize) -> Self {
        self.assert_limit = Some(calls);
        self
    }

    /// Make queries of a predicate fail.
    pub fn fail_query(mut self, predicate: &str) -> Self {
        self.failing_queries.insert(predicate.to_string());
        self
    }

    /// Every distinct fact asserted so far, sorted.
    pub fn asserted_facts(&self) -> Vec<String> {
        self.asserted.lock().iter().cloned().collect()
    }

    /// Number of `assert_batch` calls.
    pub fn assert_calls(&self) -> usize {
        self.assert_calls.load(Ordering::Relaxed)
    }

    fn record_prompt_atom(&self, fact: &str) {
        let Ok(row) = QueryRow::parse(fact) else {
            return;
        };
        if row.predicate != "prompt_atom" {
            return;
        }
        let (Some(id), Some(category), Some(priority)) = (
            row.text(0),
            row.text(1).and_then(|c| Category::from_str(&c)),
            row.arg(2).and_then(Term::as_i64),
        ) else {
            return;
        };
        self.prompt_atoms.lock().insert(id, (category, priority));
    }

    fn echoed_selection(&self) -> Vec<QueryRow> {
        self.prompt_atoms
            .lock()
            .iter()
            .map(|(id, (category, priority))| {
                let source = if category.is_skeleton() { "skeleton" } else { "flesh" };
                QueryRow::new(
                    "selected_result",
                    vec![
                        Term::Str(id.clone()),
                        Term::Int(*priority),
                        Term::Name(source.to_string()),
                    ],
                )
            })
            .collect()
    }
}

#[async_trait]
impl RuleEngine for ScriptedRuleEngine {
    async fn assert_batch(&self, facts: &[String]) -> Result<(), CollaboratorError> {
        let call = self.assert_calls.fetch_add(1, Ordering::Relaxed);
        if self.assert_limit.is_some_and(|limit| call >= limit) {
            return Err(CollaboratorError::Engine("assertion rejected".to_string()));
        }
        for fact in facts {
            if self.select_all {
                self.record_prompt_atom(fact);
            }
            self.asserted.lock().insert(fact.clone());
        }
        Ok(())
    }

    async fn query(&self, predicate: &str) -> Result<Vec<QueryRow>, CollaboratorError> {
        if self.failing_queries.contains(predicate) {
            return Err(CollaboratorError::Engine(format!("query {predicate} failed")));
        }
        let mut rows = self.rows.get(predicate).cloned().unwrap_or_default();
        if self.select_all && predicate == "selected_result" {
            rows.extend(self.echoed_selection());
        }
        Ok(rows)
    }
}

/// Searcher returning a fixed hit list.
#[derive(Debug, Default)]
pub struct StaticSearcher {
    hits: Vec<SearchHit>,
    delay: Option<Duration>,
    error: Option<String>,
    calls: AtomicUsize,
}

impl StaticSearcher {
    /// Create a searcher with no hits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a hit.
    pub fn with_hit(mut self, atom_id: &str, score: f32) -> Self {
        self.hits.push(SearchHit::new(atom_id, score));
        self
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail every search.
    pub fn failing(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    /// Number of searches performed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Searcher for StaticSearcher {
    async fn search(&self, _query: &str, limit: usize) -> Result<Vec<SearchHit>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.error {
            return Err(CollaboratorError::Search(message.clone()));
        }
        let mut hits = self.hits.clone();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.atom_id.cmp(&b.atom_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

/// Knowledge store returning fixed fragments and recording queries.
#[derive(Debug, Default)]
pub struct StaticKnowledgeStore {
    fragments: Vec<KnowledgeFragment>,
    error: Option<String>,
    queries: Mutex<Vec<String>>,
}

impl StaticKnowledgeStore {
    /// Create a store with no fragments.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment.
    pub fn with_fragment(mut self, topic: &str, content: &str, score: f32) -> Self {
        self.fragments.push(KnowledgeFragment::new(topic, content, score));
        self
    }

    /// Fail every search.
    pub fn failing(mut self, message: &str) -> Self {
        self.error = Some(message.to_string());
        self
    }

    /// Queries received so far.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl KnowledgeStore for StaticKnowledgeStore {
    async fn search_knowledge(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeFragment>, CollaboratorError> {
        self.queries.lock().push(query.to_string());
        if let Some(message) = &self.error {
            return Err(CollaboratorError::Knowledge(message.clone()));
        }
        Ok(self.fragments.iter().take(limit).cloned().collect())
    }
}
