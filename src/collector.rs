//! Candidate collection.
//!
//! Sources are read in a fixed order and the first occurrence of each atom ID
//! wins:
//!
//! 1. Embedded corpus (when enabled)
//! 2. Project store
//! 3. Shard store (only when the context carries a shard ID)
//! 4. Kernel-injected atoms (rule engine `injectable_context` / `specialist_knowledge`)
//! 5. Semantic knowledge atoms (knowledge store)
//!
//! Source failures are logged and skipped. Only cancellation and the context
//! deadline abort collection.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::canonical_content::synthetic_atom_id;
use crate::engine::{KnowledgeStore, QueryRow, RuleEngine};
use crate::interrupt::{CallGuard, Interrupted};
use crate::store::{embedded_corpus, load_hydrated, AtomStore};
use crate::types::{normalize_tag, Atom, Category, CompilationContext, Dimension};

/// Priority of the synthesized kernel context atom.
pub const KERNEL_CONTEXT_PRIORITY: i32 = 95;
/// Priority of the synthesized kernel knowledge atom.
pub const KERNEL_KNOWLEDGE_PRIORITY: i32 = 90;
/// Priority of semantic knowledge atoms.
pub const SEMANTIC_KNOWLEDGE_PRIORITY: i32 = 85;

/// Candidate sources for one compilation.
#[derive(Clone, Default)]
pub struct Sources {
    /// Read the embedded corpus.
    pub embedded: bool,
    /// Project-wide store.
    pub project: Option<Arc<dyn AtomStore>>,
    /// Store of the context's shard instance.
    pub shard: Option<Arc<dyn AtomStore>>,
    /// Rule engine for kernel injections.
    pub engine: Option<Arc<dyn RuleEngine>>,
    /// Knowledge store for semantic knowledge atoms.
    pub knowledge: Option<Arc<dyn KnowledgeStore>>,
}

/// Collected candidates.
#[derive(Debug, Clone, Default)]
pub struct Collected {
    /// Candidates in collection order.
    pub candidates: Vec<Atom>,
    /// Atoms synthesized from kernel injections.
    pub kernel_injected: usize,
    /// Atoms synthesized from knowledge fragments.
    pub knowledge_atoms: usize,
}

impl Collected {
    fn push(&mut self, seen: &mut BTreeSet<String>, atom: Atom, source: &str) -> bool {
        if seen.insert(atom.id.clone()) {
            self.candidates.push(atom);
            true
        } else {
            tracing::debug!(atom_id = %atom.id, source, "Shadowed by earlier source");
            false
        }
    }
}

/// Gathers candidate atoms from every configured source.
pub struct Collector {
    knowledge_top_k: usize,
}

impl Collector {
    /// Create a collector requesting `knowledge_top_k` knowledge fragments.
    pub fn new(knowledge_top_k: usize) -> Self {
        Self { knowledge_top_k }
    }

    /// Collect candidates for a context.
    pub async fn collect(
        &self,
        ctx: &CompilationContext,
        sources: &Sources,
        guard: &CallGuard,
    ) -> Result<Collected, Interrupted> {
        let mut collected = Collected::default();
        let mut seen = BTreeSet::new();

        if sources.embedded {
            for atom in embedded_corpus() {
                collected.push(&mut seen, atom.clone(), "embedded");
            }
        }

        if let Some(store) = &sources.project {
            for atom in self.read_store(store.as_ref(), "project", guard).await? {
                collected.push(&mut seen, atom, "project");
            }
        }

        if let (Some(store), Some(shard_id)) = (&sources.shard, ctx.shard_id.as_deref()) {
            for atom in self.read_store(store.as_ref(), shard_id, guard).await? {
                collected.push(&mut seen, atom, "shard");
            }
        }

        if let Some(engine) = &sources.engine {
            for atom in kernel_atoms(engine.as_ref(), ctx, guard).await? {
                if collected.push(&mut seen, atom, "kernel") {
                    collected.kernel_injected += 1;
                }
            }
        }

        if let Some(knowledge) = &sources.knowledge {
            for atom in self.knowledge_atoms(knowledge.as_ref(), ctx, guard).await? {
                if collected.push(&mut seen, atom, "knowledge") {
                    collected.knowledge_atoms += 1;
                }
            }
        }

        tracing::debug!(
            candidates = collected.candidates.len(),
            kernel_injected = collected.kernel_injected,
            knowledge_atoms = collected.knowledge_atoms,
            "Collected candidates"
        );
        Ok(collected)
    }

    async fn read_store(
        &self,
        store: &dyn AtomStore,
        label: &str,
        guard: &CallGuard,
    ) -> Result<Vec<Atom>, Interrupted> {
        match guard.run(load_hydrated(store)).await? {
            Ok(atoms) => Ok(atoms),
            Err(e) => {
                tracing::warn!(store = label, error = %e, "Atom store read failed, skipping source");
                Ok(Vec::new())
            }
        }
    }

    async fn knowledge_atoms(
        &self,
        store: &dyn KnowledgeStore,
        ctx: &CompilationContext,
        guard: &CallGuard,
    ) -> Result<Vec<Atom>, Interrupted> {
        let query = weighted_query(ctx);
        if query.is_empty() || self.knowledge_top_k == 0 {
            return Ok(Vec::new());
        }

        let fragments = match guard.run(store.search_knowledge(&query, self.knowledge_top_k)).await? {
            Ok(fragments) => fragments,
            Err(e) => {
                tracing::warn!(error = %e, "Knowledge search failed, skipping source");
                return Ok(Vec::new());
            }
        };

        Ok(fragments
            .into_iter()
            .take(self.knowledge_top_k)
            .filter(|f| !f.content.trim().is_empty())
            .map(|fragment| {
                let content = if fragment.topic.trim().is_empty() {
                    fragment.content.trim().to_string()
                } else {
                    format!("## {}\n{}", fragment.topic.trim(), fragment.content.trim())
                };
                let id = synthetic_atom_id("knowledge/semantic", &content);
                Atom::new(id, Category::Knowledge, content).with_priority(SEMANTIC_KNOWLEDGE_PRIORITY)
            })
            .collect())
    }
}

/// Knowledge query with weighted terms: intent verb and target ×3, shard ID
/// and language ×2, each framework ×1.
pub fn weighted_query(ctx: &CompilationContext) -> String {
    let mut terms: Vec<&str> = Vec::new();
    let weighted = [
        (ctx.intent_verb.as_deref(), 3),
        (ctx.intent_target.as_deref(), 3),
        (ctx.shard_id.as_deref(), 2),
        (ctx.language.as_deref(), 2),
    ];
    for (value, weight) in weighted {
        if let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) {
            terms.extend(std::iter::repeat(value).take(weight));
        }
    }
    terms.extend(ctx.frameworks.iter().map(|f| f.trim()).filter(|f| !f.is_empty()));
    terms.join(" ")
}

/// Whether a shard selector of an injection row applies to the context.
pub fn shard_matches(selector: &str, ctx: &CompilationContext) -> bool {
    let selector = normalize_tag(selector);
    if selector == "*" || selector == "_all" {
        return true;
    }
    let matches = |value: Option<&str>| value.map(normalize_tag).is_some_and(|v| !v.is_empty() && v == selector);
    matches(ctx.shard_type.as_deref()) || matches(ctx.shard_id.as_deref())
}

async fn query_rows(
    engine: &dyn RuleEngine,
    predicate: &str,
    guard: &CallGuard,
) -> Result<Vec<QueryRow>, Interrupted> {
    match guard.run(engine.query(predicate)).await? {
        Ok(rows) => Ok(rows),
        Err(e) => {
            tracing::warn!(predicate, error = %e, "Kernel injection query failed");
            Ok(Vec::new())
        }
    }
}

/// Synthesize the kernel context and knowledge atoms.
async fn kernel_atoms(
    engine: &dyn RuleEngine,
    ctx: &CompilationContext,
    guard: &CallGuard,
) -> Result<Vec<Atom>, Interrupted> {
    let mut texts = BTreeSet::new();
    for row in query_rows(engine, "injectable_context", guard).await? {
        if let (Some(shard), Some(text)) = (row.text(0), row.text(1)) {
            if shard_matches(&shard, ctx) && !text.trim().is_empty() {
                texts.insert(text.trim().to_string());
            }
        }
    }

    let mut blocks = BTreeSet::new();
    for row in query_rows(engine, "specialist_knowledge", guard).await? {
        if let (Some(shard), Some(topic), Some(body)) = (row.text(0), row.text(1), row.text(2)) {
            if shard_matches(&shard, ctx) && !body.trim().is_empty() {
                blocks.insert(format!("## {}\n{}", topic.trim(), body.trim()));
            }
        }
    }

    let scope = |atom: Atom| match ctx.shard_type.as_deref() {
        Some(shard_type) => atom.with_selector(Dimension::ShardType, shard_type),
        None => atom,
    };

    let mut atoms = Vec::new();
    if !texts.is_empty() {
        let content = texts.into_iter().collect::<Vec<_>>().join("\n");
        let id = synthetic_atom_id("kernel/context", &content);
        atoms.push(scope(
            Atom::new(id, Category::Context, content)
                .with_priority(KERNEL_CONTEXT_PRIORITY)
                .mandatory(),
        ));
    }
    if !blocks.is_empty() {
        let content = blocks.into_iter().collect::<Vec<_>>().join("\n\n");
        let id = synthetic_atom_id("kernel/knowledge", &content);
        atoms.push(scope(
            Atom::new(id, Category::Knowledge, content)
                .with_priority(KERNEL_KNOWLEDGE_PRIORITY)
                .mandatory(),
        ));
    }
    Ok(atoms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ScriptedRuleEngine, StaticKnowledgeStore};
    use crate::store::InMemoryAtomStore;

    fn ctx() -> CompilationContext {
        CompilationContext::new(10_000, 1_000)
            .with_shard_type("coder")
            .with_shard_id("coder-7")
    }

    #[tokio::test]
    async fn test_first_source_wins() {
        let project = InMemoryAtomStore::from_atoms(vec![Atom::new("a", Category::Identity, "project")]);
        let shard = InMemoryAtomStore::from_atoms(vec![
            Atom::new("a", Category::Identity, "shard"),
            Atom::new("b", Category::Safety, "shard"),
        ]);
        let sources = Sources {
            project: Some(Arc::new(project)),
            shard: Some(Arc::new(shard)),
            ..Sources::default()
        };
        let collected = Collector::new(5)
            .collect(&ctx(), &sources, &CallGuard::unbounded())
            .await
            .unwrap();
        assert_eq!(collected.candidates.len(), 2);
        assert_eq!(collected.candidates[0].content, "project");
    }

    #[tokio::test]
    async fn test_shard_store_needs_shard_id() {
        let shard = InMemoryAtomStore::from_atoms(vec![Atom::new("b", Category::Safety, "shard")]);
        let sources = Sources {
            shard: Some(Arc::new(shard)),
            ..Sources::default()
        };
        let no_shard = CompilationContext::new(10_000, 1_000);
        let collected = Collector::new(5)
            .collect(&no_shard, &sources, &CallGuard::unbounded())
            .await
            .unwrap();
        assert!(collected.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_failing_store_is_skipped() {
        let sources = Sources {
            project: Some(Arc::new(InMemoryAtomStore::new().failing("disk on fire"))),
            ..Sources::default()
        };
        let collected = Collector::new(5)
            .collect(&ctx(), &sources, &CallGuard::unbounded())
            .await
            .unwrap();
        assert!(collected.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_kernel_injection() {
        let engine = ScriptedRuleEngine::new()
            .with_parsed("injectable_context(/coder, 'Tests live in tests/.')")
            .unwrap()
            .with_parsed("injectable_context(/_all, 'Repository uses Rust 2021.')")
            .unwrap()
            .with_parsed("injectable_context(/reviewer, 'Not for coders.')")
            .unwrap()
            .with_parsed("specialist_knowledge('coder-7', 'ci', 'CI runs clippy.')")
            .unwrap();
        let sources = Sources {
            engine: Some(Arc::new(engine)),
            ..Sources::default()
        };
        let collected = Collector::new(5)
            .collect(&ctx(), &sources, &CallGuard::unbounded())
            .await
            .unwrap();

        assert_eq!(collected.kernel_injected, 2);
        let context = &collected.candidates[0];
        assert!(context.id.starts_with("kernel/context/"));
        assert_eq!(context.content, "Repository uses Rust 2021.\nTests live in tests/.");
        assert_eq!(context.priority, KERNEL_CONTEXT_PRIORITY);
        assert!(context.is_mandatory);
        assert!(context.selectors.get(Dimension::ShardType).is_some());

        let knowledge = &collected.candidates[1];
        assert_eq!(knowledge.category, Category::Knowledge);
        assert_eq!(knowledge.content, "## ci\nCI runs clippy.");
    }

    #[tokio::test]
    async fn test_semantic_knowledge() {
        let store = Arc::new(
            StaticKnowledgeStore::new()
                .with_fragment("borrowck", "Split borrows across struct fields.", 0.9)
                .with_fragment("", "Prefer iterators.", 0.8),
        );
        let sources = Sources {
            knowledge: Some(store.clone()),
            ..Sources::default()
        };
        let ctx = ctx().with_intent("fix", Some("lexer".into())).with_language("rust");
        let collected = Collector::new(5)
            .collect(&ctx, &sources, &CallGuard::unbounded())
            .await
            .unwrap();

        assert_eq!(collected.knowledge_atoms, 2);
        assert!(collected.candidates.iter().all(|a| !a.is_mandatory));
        assert!(collected.candidates.iter().all(|a| a.priority == SEMANTIC_KNOWLEDGE_PRIORITY));
        assert_eq!(
            store.queries(),
            vec!["fix fix fix lexer lexer lexer coder-7 coder-7 rust rust".to_string()]
        );
    }

    #[test]
    fn test_shard_matching() {
        let ctx = ctx();
        assert!(shard_matches("*", &ctx));
        assert!(shard_matches("/_all", &ctx));
        assert!(shard_matches("/coder", &ctx));
        assert!(shard_matches("coder-7", &ctx));
        assert!(!shard_matches("/planner", &ctx));
    }

    #[test]
    fn test_weighted_query_frameworks() {
        let ctx = CompilationContext::new(1, 0).with_framework("tokio").with_framework("axum");
        assert_eq!(weighted_query(&ctx), "axum tokio");
    }
}
