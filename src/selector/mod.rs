//! Skeleton/flesh selection.
//!
//! The skeleton phase is deterministic and must produce at least one atom;
//! it fails CRITICAL otherwise. The flesh phase is best effort: rule engine
//! and vector search failures degrade to context matching and never fail the
//! compilation.
//!
//! ## Determinism Guarantees
//!
//! - Facts are asserted in canonical order
//! - Duplicate result rows keep the first row per atom
//! - The merged selection is sorted by (skeleton category, mandatory,
//!   combined desc, ID asc)

pub mod mangle;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::time::Instant;

use crate::engine::{facts, QueryRow, RuleEngine, Searcher};
use crate::interrupt::{CallGuard, Interrupted};
use crate::policy::{combined_score, fallback_score, CompilerConfig};
use crate::policy::scoring::FALLBACK_LOGIC_SCORE;
use crate::types::{Atom, Category, CompilationContext, DropReason, DroppedEntry, ScoredAtom};

pub use mangle::apply_mangle_override;

/// Reason recorded for flesh atoms selected by context matching.
pub const FALLBACK_REASON: &str = "flesh:fallback_context_match";

/// Error type for selection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    /// The skeleton could not be built.
    #[error("CRITICAL: {0}")]
    Critical(String),
    /// Cancelled or past the deadline.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

/// Outcome of selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Selected atoms, merged and sorted.
    pub selected: Vec<ScoredAtom>,
    /// Candidates that were not selected.
    pub dropped: Vec<DroppedEntry>,
    /// Atoms selected by the skeleton phase.
    pub skeleton_count: usize,
    /// Atoms selected by the flesh phase.
    pub flesh_count: usize,
    /// Atoms promoted by the Mangle override.
    pub mangle_override_count: usize,
    /// The flesh phase degraded.
    pub fallback_used: bool,
    /// The skeleton phase ran on context matching.
    pub skeleton_fallback_used: bool,
    /// Vector search hit its sub-deadline.
    pub vector_timed_out: bool,
    /// Time spent in vector search.
    pub vector_query_ms: u64,
}

/// Vector search outcome.
#[derive(Debug, Default)]
struct VectorScores {
    scores: BTreeMap<String, f32>,
    degraded: bool,
    timed_out: bool,
    elapsed_ms: u64,
}

/// Skeleton/flesh selector.
pub struct Selector<'a> {
    config: &'a CompilerConfig,
    engine: Option<Arc<dyn RuleEngine>>,
    searcher: Option<Arc<dyn Searcher>>,
}

impl<'a> Selector<'a> {
    /// Create a selector.
    pub fn new(
        config: &'a CompilerConfig,
        engine: Option<Arc<dyn RuleEngine>>,
        searcher: Option<Arc<dyn Searcher>>,
    ) -> Self {
        Self {
            config,
            engine,
            searcher,
        }
    }

    /// Select atoms for a context.
    pub async fn select(
        &self,
        ctx: &CompilationContext,
        candidates: Vec<Atom>,
        guard: &CallGuard,
    ) -> Result<Selection, SelectorError> {
        let mut selection = Selection::default();

        let (candidates, promoted) = apply_mangle_override(candidates, ctx, &self.config.mangle);
        selection.mangle_override_count = promoted;

        let (skeleton, flesh): (Vec<Atom>, Vec<Atom>) =
            candidates.into_iter().partition(Atom::is_skeleton);

        let skeleton_selected = self.skeleton_phase(ctx, &skeleton, &mut selection, guard).await?;
        let flesh_selected = self.flesh_phase(ctx, &flesh, &mut selection, guard).await?;

        selection.skeleton_count = skeleton_selected.len();
        selection.flesh_count = flesh_selected.len();

        let chosen: BTreeSet<&str> = skeleton_selected
            .iter()
            .chain(flesh_selected.iter())
            .map(ScoredAtom::id)
            .collect();
        for atom in skeleton.iter().chain(flesh.iter()) {
            if !chosen.contains(atom.id.as_str()) {
                selection.dropped.push(DroppedEntry::new(atom.id.clone(), DropReason::Selector));
            }
        }

        selection.selected = merge(skeleton_selected, flesh_selected);
        tracing::debug!(
            skeleton = selection.skeleton_count,
            flesh = selection.flesh_count,
            dropped = selection.dropped.len(),
            fallback_used = selection.fallback_used,
            "Selection complete"
        );
        Ok(selection)
    }

    async fn skeleton_phase(
        &self,
        ctx: &CompilationContext,
        skeleton: &[Atom],
        selection: &mut Selection,
        guard: &CallGuard,
    ) -> Result<Vec<ScoredAtom>, SelectorError> {
        if skeleton.is_empty() {
            tracing::error!("No skeleton candidates");
            return Err(SelectorError::Critical(
                "no skeleton atoms among candidates (identity, protocol, safety, methodology)".to_string(),
            ));
        }

        let by_id: BTreeMap<&str, &Atom> = skeleton.iter().map(|a| (a.id.as_str(), a)).collect();
        let mut selected: BTreeMap<String, ScoredAtom> = BTreeMap::new();

        match &self.engine {
            Some(engine) => {
                let mut batch = facts::context_facts(ctx);
                batch.extend(facts::atoms_facts(skeleton));
                guard
                    .run(engine.assert_batch(&batch))
                    .await?
                    .map_err(|e| critical(format!("no skeleton atoms: assertion failed: {e}")))?;

                let rows = guard
                    .run(engine.query("selected_result"))
                    .await?
                    .map_err(|e| critical(format!("no skeleton atoms: query failed: {e}")))?;
                for id in selected_ids(&rows) {
                    if let Some(atom) = by_id.get(id.as_str()) {
                        selected
                            .entry(id)
                            .or_insert_with(|| ScoredAtom::skeleton((*atom).clone(), "skeleton:rule"));
                    }
                }

                match guard.run(engine.query("mandatory_selection")).await? {
                    Ok(rows) => {
                        for row in rows {
                            let Some(id) = row.text(0) else { continue };
                            if let Some(atom) = by_id.get(id.as_str()) {
                                let mut atom = (*atom).clone();
                                atom.is_mandatory = true;
                                selected.insert(id, ScoredAtom::skeleton(atom, "skeleton:mandatory_selection"));
                            }
                        }
                    }
                    Err(e) => tracing::debug!(error = %e, "mandatory_selection unavailable"),
                }

                if selected.is_empty() {
                    return Err(critical(format!(
                        "no skeleton atoms: rule engine selected none of {} candidates",
                        skeleton.len()
                    )));
                }
            }
            None if self.config.require_rule_engine => {
                return Err(critical(
                    "no skeleton atoms: no rule engine configured for skeleton selection".to_string(),
                ));
            }
            None => {
                selection.skeleton_fallback_used = true;
                tracing::warn!("No rule engine, skeleton falls back to context matching");
                for atom in skeleton.iter().filter(|a| a.matches_context(ctx)) {
                    selected.insert(
                        atom.id.clone(),
                        ScoredAtom::skeleton(atom.clone(), "skeleton:fallback_context_match"),
                    );
                }
            }
        }

        // Mandatory skeleton atoms that apply to the context are always kept.
        for atom in skeleton.iter().filter(|a| a.is_mandatory && a.matches_context(ctx)) {
            selected
                .entry(atom.id.clone())
                .or_insert_with(|| ScoredAtom::skeleton(atom.clone(), "skeleton:mandatory"));
        }

        // Every skeleton category with an applicable candidate gets one atom.
        for category in Category::ALL.iter().filter(|c| c.is_skeleton()) {
            let covered = selected.values().any(|s| s.atom.category == *category);
            if covered {
                continue;
            }
            let best = skeleton
                .iter()
                .filter(|a| a.category == *category && a.matches_context(ctx))
                .min_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
            if let Some(atom) = best {
                tracing::debug!(atom_id = %atom.id, category = %category, "Skeleton backfill");
                selected.insert(atom.id.clone(), ScoredAtom::skeleton(atom.clone(), "skeleton:backfill"));
            }
        }

        if selected.is_empty() {
            tracing::error!(candidates = skeleton.len(), "Skeleton selection produced nothing");
            return Err(critical(format!(
                "no skeleton atoms selected from {} candidates",
                skeleton.len()
            )));
        }
        Ok(selected.into_values().collect())
    }

    async fn flesh_phase(
        &self,
        ctx: &CompilationContext,
        flesh: &[Atom],
        selection: &mut Selection,
        guard: &CallGuard,
    ) -> Result<Vec<ScoredAtom>, Interrupted> {
        if flesh.is_empty() {
            return Ok(Vec::new());
        }

        let vectors = self.vector_scores(ctx, guard).await?;
        selection.vector_query_ms = vectors.elapsed_ms;
        selection.vector_timed_out = vectors.timed_out;
        if vectors.degraded {
            selection.fallback_used = true;
        }

        let by_id: BTreeMap<&str, &Atom> = flesh.iter().map(|a| (a.id.as_str(), a)).collect();

        let ruled = match &self.engine {
            Some(engine) => self.rule_flesh(ctx, flesh, &by_id, &vectors.scores, engine.as_ref(), guard).await?,
            None => None,
        };

        let selected = match ruled {
            Some(selected) => selected,
            None => {
                selection.fallback_used = true;
                flesh
                    .iter()
                    .filter(|a| a.matches_context(ctx))
                    .map(|atom| {
                        let vector = vectors.scores.get(&atom.id).copied().unwrap_or(0.0);
                        ScoredAtom::flesh(
                            atom.clone(),
                            FALLBACK_LOGIC_SCORE,
                            vector,
                            fallback_score(vector, atom.is_mandatory),
                            FALLBACK_REASON,
                        )
                    })
                    .collect()
            }
        };

        if let Some(engine) = &self.engine {
            let chosen: BTreeSet<&str> = selected.iter().map(ScoredAtom::id).collect();
            match guard.run(engine.query("blocked_by_context")).await? {
                Ok(rows) => {
                    for row in rows {
                        let Some(id) = row.text(0) else { continue };
                        if by_id.contains_key(id.as_str()) && !chosen.contains(id.as_str()) {
                            selection
                                .dropped
                                .push(DroppedEntry::new(id, DropReason::BlockedByContext));
                        }
                    }
                }
                Err(e) => tracing::debug!(error = %e, "blocked_by_context unavailable"),
            }
        }

        Ok(selected)
    }

    /// Flesh selection through the rule engine. `None` means the engine
    /// failed and the caller falls back to context matching.
    async fn rule_flesh(
        &self,
        ctx: &CompilationContext,
        flesh: &[Atom],
        by_id: &BTreeMap<&str, &Atom>,
        vectors: &BTreeMap<String, f32>,
        engine: &dyn RuleEngine,
        guard: &CallGuard,
    ) -> Result<Option<Vec<ScoredAtom>>, Interrupted> {
        let mut batch = facts::context_facts(ctx);
        batch.extend(facts::atoms_facts(flesh));
        batch.extend(
            vectors
                .iter()
                .filter(|(id, _)| by_id.contains_key(id.as_str()))
                .map(|(id, score)| facts::vector_hit_fact(id, *score)),
        );

        if let Err(e) = guard.run(engine.assert_batch(&batch)).await? {
            tracing::warn!(error = %e, "Flesh assertion failed, falling back to context matching");
            return Ok(None);
        }
        let rows = match guard.run(engine.query("selected_result")).await? {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Flesh query failed, falling back to context matching");
                return Ok(None);
            }
        };

        let mut selected: BTreeMap<String, ScoredAtom> = BTreeMap::new();
        for id in selected_ids(&rows) {
            let Some(atom) = by_id.get(id.as_str()) else { continue };
            if selected.contains_key(&id) {
                continue;
            }
            let vector = vectors.get(&id).copied().unwrap_or(0.0);
            let combined = combined_score(1.0, vector, atom.priority, atom.is_mandatory, self.config);
            selected.insert(
                id,
                ScoredAtom::flesh((*atom).clone(), 1.0, vector, combined, "flesh:rule"),
            );
        }

        // Mandatory flesh atoms survive scoring as long as they apply.
        for atom in flesh.iter().filter(|a| a.is_mandatory && a.matches_context(ctx)) {
            selected.entry(atom.id.clone()).or_insert_with(|| {
                let vector = vectors.get(&atom.id).copied().unwrap_or(0.0);
                ScoredAtom::flesh(atom.clone(), atom.selectors.match_score(ctx), vector, 1.0, "flesh:mandatory")
            });
        }

        Ok(Some(selected.into_values().collect()))
    }

    async fn vector_scores(&self, ctx: &CompilationContext, guard: &CallGuard) -> Result<VectorScores, Interrupted> {
        let Some(searcher) = &self.searcher else {
            return Ok(VectorScores::default());
        };
        let Some(query) = ctx.semantic_query.as_deref().filter(|q| !q.trim().is_empty()) else {
            return Ok(VectorScores::default());
        };

        let limit = ctx.semantic_top_k.max(1);
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            self.config.vector_timeout(),
            guard.run(searcher.search(query, limit)),
        )
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut vectors = VectorScores {
            elapsed_ms,
            ..VectorScores::default()
        };
        match outcome {
            Err(_) => {
                tracing::warn!(elapsed_ms, "Vector search timed out, continuing without vector scores");
                vectors.timed_out = true;
                vectors.degraded = true;
            }
            Ok(interrupted) => match interrupted? {
                Ok(hits) => {
                    for hit in hits {
                        vectors.scores.entry(hit.atom_id).or_insert(hit.score);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, elapsed_ms, "Vector search failed, continuing without vector scores");
                    vectors.degraded = true;
                }
            },
        }
        Ok(vectors)
    }
}

fn critical(message: String) -> SelectorError {
    tracing::error!(%message, "Skeleton selection failed");
    SelectorError::Critical(message)
}

/// Atom IDs of `selected_result(Atom, Priority, Source)` rows, in row order.
fn selected_ids(rows: &[QueryRow]) -> Vec<String> {
    rows.iter()
        .filter(|row| row.predicate == "selected_result")
        .filter_map(|row| row.text(0))
        .collect()
}

/// Merge skeleton and flesh selections.
///
/// Duplicate IDs keep the skeleton entry. Sorted by skeleton category first,
/// then mandatory, then combined score desc, then ID asc.
pub fn merge(skeleton: Vec<ScoredAtom>, flesh: Vec<ScoredAtom>) -> Vec<ScoredAtom> {
    let mut seen = BTreeSet::new();
    let mut merged: Vec<ScoredAtom> = skeleton
        .into_iter()
        .chain(flesh)
        .filter(|s| seen.insert(s.atom.id.clone()))
        .collect();
    merged.sort_by(|a, b| {
        b.atom
            .is_skeleton()
            .cmp(&a.atom.is_skeleton())
            .then_with(|| b.atom.is_mandatory.cmp(&a.atom.is_mandatory))
            .then_with(|| b.combined.total_cmp(&a.combined))
            .then_with(|| a.atom.id.cmp(&b.atom.id))
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptedRuleEngine, StaticSearcher};
    use crate::types::{Dimension, SelectionSource};
    use std::time::Duration;

    fn ctx() -> CompilationContext {
        CompilationContext::new(10_000, 1_000)
            .with_shard_type("coder")
            .with_language("rust")
            .with_semantic_query("borrow checker errors", 10)
    }

    fn corpus() -> Vec<Atom> {
        vec![
            Atom::new("identity/core", Category::Identity, "identity").mandatory().with_priority(100),
            Atom::new("safety/rule", Category::Safety, "safety").with_priority(90),
            Atom::new("lang/rust", Category::Language, "rust").with_selector(Dimension::Language, "rust"),
            Atom::new("lang/go", Category::Language, "go").with_selector(Dimension::Language, "go"),
            Atom::new("domain/db", Category::Domain, "db").with_priority(40),
        ]
    }

    async fn run(selector: &Selector<'_>, ctx: &CompilationContext, atoms: Vec<Atom>) -> Selection {
        selector.select(ctx, atoms, &CallGuard::unbounded()).await.unwrap()
    }

    #[tokio::test]
    async fn test_fallback_without_engine() {
        let config = CompilerConfig::default();
        let selector = Selector::new(&config, None, None);
        let selection = run(&selector, &ctx(), corpus()).await;

        assert!(selection.skeleton_fallback_used);
        assert!(selection.fallback_used);
        let ids: Vec<&str> = selection.selected.iter().map(ScoredAtom::id).collect();
        assert_eq!(ids, vec!["identity/core", "safety/rule", "domain/db", "lang/rust"]);
        assert_eq!(selection.selected[3].reason, FALLBACK_REASON);
        assert_eq!(selection.selected[3].combined, 0.5);
        assert!(selection.dropped.iter().any(|d| d.atom_id == "lang/go"));
    }

    #[tokio::test]
    async fn test_engine_scores_flesh() {
        let config = CompilerConfig::default();
        let engine: Arc<dyn RuleEngine> = Arc::new(
            ScriptedRuleEngine::new()
                .with_selected("identity/core", 100, "/skeleton")
                .with_selected("lang/rust", 0, "/flesh")
                .with_selected("not/a/candidate", 0, "/flesh"),
        );
        let searcher: Arc<dyn Searcher> = Arc::new(StaticSearcher::new().with_hit("lang/rust", 1.0));
        let selector = Selector::new(&config, Some(engine), Some(searcher));
        let selection = run(&selector, &ctx(), corpus()).await;

        assert!(!selection.fallback_used);
        assert!(!selection.skeleton_fallback_used);
        let rust = selection.selected.iter().find(|s| s.id() == "lang/rust").unwrap();
        assert_eq!(rust.logic_score, 1.0);
        assert_eq!(rust.vector_score, 1.0);
        assert_eq!(rust.combined, 1.0);
        // safety/rule was not selected by rules but is the only safety candidate.
        let safety = selection.selected.iter().find(|s| s.id() == "safety/rule").unwrap();
        assert_eq!(safety.reason, "skeleton:backfill");
        assert!(selection.selected.iter().all(|s| s.id() != "domain/db"));
    }

    #[tokio::test]
    async fn test_engine_error_in_flesh_falls_back() {
        let config = CompilerConfig::default();
        let engine: Arc<dyn RuleEngine> = Arc::new(
            ScriptedRuleEngine::new()
                .with_selected("identity/core", 100, "/skeleton")
                .fail_asserts_after(1),
        );
        let selector = Selector::new(&config, Some(engine), None);
        let selection = run(&selector, &ctx(), corpus()).await;

        assert!(selection.fallback_used);
        assert!(!selection.skeleton_fallback_used);
        let rust = selection.selected.iter().find(|s| s.id() == "lang/rust").unwrap();
        assert_eq!(rust.reason, FALLBACK_REASON);
    }

    #[tokio::test]
    async fn test_engine_error_in_skeleton_is_critical() {
        let config = CompilerConfig::default();
        let failing: Arc<dyn RuleEngine> = Arc::new(ScriptedRuleEngine::new().fail_asserts());
        let selector = Selector::new(&config, Some(failing), None);
        let err = selector
            .select(&ctx(), corpus(), &CallGuard::unbounded())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("CRITICAL"));
    }

    #[tokio::test]
    async fn test_skeleton_critical_without_skeleton_candidates() {
        let config = CompilerConfig::default();
        let selector = Selector::new(&config, None, None);
        let flesh_only = vec![Atom::new("domain/db", Category::Domain, "db")];
        let err = selector
            .select(&ctx(), flesh_only, &CallGuard::unbounded())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("CRITICAL"));
        assert!(message.contains("no skeleton atoms"));
    }

    #[tokio::test]
    async fn test_engine_selecting_no_skeleton_is_critical() {
        let config = CompilerConfig::default();
        let engine: Arc<dyn RuleEngine> = Arc::new(ScriptedRuleEngine::new());
        let selector = Selector::new(&config, Some(engine), None);
        let err = selector
            .select(&ctx(), corpus(), &CallGuard::unbounded())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("CRITICAL"));
        assert!(message.contains("no skeleton atoms"));
    }

    #[tokio::test]
    async fn test_vector_search_needs_semantic_query() {
        let config = CompilerConfig::default();
        let searcher = Arc::new(StaticSearcher::new().with_hit("lang/rust", 0.9));
        let selector = Selector::new(&config, None, Some(searcher.clone() as Arc<dyn Searcher>));
        let ctx = CompilationContext::new(10_000, 1_000).with_language("rust");
        let selection = run(&selector, &ctx, corpus()).await;

        assert_eq!(searcher.calls(), 0);
        assert!(!selection.vector_timed_out);
        assert!(selection.selected.iter().all(|s| s.vector_score == 0.0));
    }

    #[tokio::test]
    async fn test_require_rule_engine() {
        let config = CompilerConfig {
            require_rule_engine: true,
            ..CompilerConfig::default()
        };
        let selector = Selector::new(&config, None, None);
        let err = selector
            .select(&ctx(), corpus(), &CallGuard::unbounded())
            .await
            .unwrap_err();
        assert!(matches!(err, SelectorError::Critical(_)));
    }

    #[tokio::test]
    async fn test_blocked_by_context_recorded() {
        let config = CompilerConfig::default();
        let engine: Arc<dyn RuleEngine> = Arc::new(
            ScriptedRuleEngine::new()
                .with_selected("identity/core", 100, "/skeleton")
                .with_parsed("blocked_by_context('lang/go')")
                .unwrap(),
        );
        let selector = Selector::new(&config, Some(engine), None);
        let selection = run(&selector, &ctx(), corpus()).await;
        let first = selection.dropped.iter().find(|d| d.atom_id == "lang/go").unwrap();
        assert_eq!(first.reason, DropReason::BlockedByContext);
    }

    #[tokio::test]
    async fn test_mandatory_selection_promotes() {
        let config = CompilerConfig::default();
        let engine: Arc<dyn RuleEngine> = Arc::new(
            ScriptedRuleEngine::new()
                .with_parsed("mandatory_selection('safety/rule')")
                .unwrap(),
        );
        let selector = Selector::new(&config, Some(engine), None);
        let selection = run(&selector, &ctx(), corpus()).await;
        let safety = selection.selected.iter().find(|s| s.id() == "safety/rule").unwrap();
        assert!(safety.atom.is_mandatory);
        assert_eq!(safety.reason, "skeleton:mandatory_selection");
    }

    #[tokio::test(start_paused = true)]
    async fn test_vector_timeout() {
        let config = CompilerConfig::default();
        let searcher: Arc<dyn Searcher> = Arc::new(
            StaticSearcher::new()
                .with_hit("lang/rust", 0.9)
                .with_delay(Duration::from_secs(30)),
        );
        let selector = Selector::new(&config, None, Some(searcher));
        let selection = run(&selector, &ctx(), corpus()).await;

        assert!(selection.vector_timed_out);
        assert!(selection.vector_query_ms >= 10_000);
        assert!(selection.selected.iter().all(|s| s.vector_score == 0.0));
    }

    #[test]
    fn test_merge_prefers_skeleton_and_sorts() {
        let skeleton = vec![ScoredAtom::skeleton(Atom::new("s", Category::Safety, "s"), "r")];
        let flesh = vec![
            ScoredAtom::flesh(Atom::new("b", Category::Domain, "b"), 1.0, 0.0, 0.4, "r"),
            ScoredAtom::flesh(Atom::new("a", Category::Domain, "a"), 1.0, 0.0, 0.4, "r"),
            ScoredAtom::flesh(Atom::new("c", Category::Domain, "c").mandatory(), 1.0, 0.0, 1.0, "r"),
            ScoredAtom::flesh(Atom::new("s", Category::Safety, "dup"), 1.0, 0.0, 0.9, "r"),
        ];
        let merged = merge(skeleton, flesh);
        let ids: Vec<&str> = merged.iter().map(ScoredAtom::id).collect();
        assert_eq!(ids, vec!["s", "c", "a", "b"]);
        assert_eq!(merged[0].source, SelectionSource::Skeleton);
    }
}
