//! The JIT compiler: collector → selector → resolver → budgeter → assembler.
//!
//! ## Concurrency
//!
//! `compile` takes `&self` and may run concurrently. Store registry, last
//! result and compile cache sit behind `parking_lot` locks that are never
//! held across an `.await`: sources are snapshotted before collection and
//! stores are closed after their lock is released.
//!
//! ## Determinism Guarantees
//!
//! - Same context + same candidates + same config → byte-identical prompt
//! - Cache keys are canonical hashes of all three

use lru::LruCache;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::assembler;
use crate::budget::{available_tokens, BudgetError, Budgeter};
use crate::canonical::{fingerprint_hex, FingerprintKind};
use crate::collector::{Collector, Sources};
use crate::engine::{KnowledgeStore, RuleEngine, Searcher};
use crate::interrupt::{CallGuard, Interrupted};
use crate::policy::CompilerConfig;
use crate::resolver::{DependencyError, DependencyErrorKind, Resolver};
use crate::selector::{Selector, SelectorError};
use crate::store::{AtomStore, StoreError};
use crate::types::{Atom, CompilationContext, CompilationResult, CompilationStats, Manifest};

/// Error type for compilation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    /// The context cannot be compiled.
    #[error("invalid compilation context: {0}")]
    InvalidContext(String),
    /// Budget minus headroom is not positive.
    #[error(transparent)]
    Budget(#[from] BudgetError),
    /// Dependency cycle or mandatory conflict.
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    /// The skeleton could not be built.
    #[error("CRITICAL: {0}")]
    Skeleton(String),
    /// The caller cancelled.
    #[error("compilation cancelled")]
    Cancelled,
    /// The context deadline passed.
    #[error("compilation deadline exceeded")]
    DeadlineExceeded,
}

/// Class of a [`CompileError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileErrorKind {
    /// Invalid context.
    InvalidContext,
    /// Budget exhausted by headroom.
    Budget,
    /// Dependency cycle.
    Cycle,
    /// Mandatory atoms exclude each other.
    Conflict,
    /// Skeleton failure.
    Skeleton,
    /// Caller cancellation.
    Cancelled,
    /// Deadline exceeded.
    DeadlineExceeded,
}

impl CompileError {
    /// Programmatic class of the error.
    pub fn kind(&self) -> CompileErrorKind {
        match self {
            Self::InvalidContext(_) => CompileErrorKind::InvalidContext,
            Self::Budget(_) => CompileErrorKind::Budget,
            Self::Dependency(err) if err.kind == DependencyErrorKind::Cycle => CompileErrorKind::Cycle,
            Self::Dependency(_) => CompileErrorKind::Conflict,
            Self::Skeleton(_) => CompileErrorKind::Skeleton,
            Self::Cancelled => CompileErrorKind::Cancelled,
            Self::DeadlineExceeded => CompileErrorKind::DeadlineExceeded,
        }
    }

    /// Whether the error is a skeleton failure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Skeleton(_))
    }
}

impl From<Interrupted> for CompileError {
    fn from(err: Interrupted) -> Self {
        match err {
            Interrupted::Cancelled => Self::Cancelled,
            Interrupted::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl From<SelectorError> for CompileError {
    fn from(err: SelectorError) -> Self {
        match err {
            SelectorError::Critical(message) => Self::Skeleton(message),
            SelectorError::Interrupted(interrupted) => interrupted.into(),
        }
    }
}

/// Compile cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    context_hash: String,
    candidates_hash: String,
    config_hash: String,
}

/// Registered stores and the last result.
#[derive(Default)]
struct Registry {
    project: Option<Arc<dyn AtomStore>>,
    shards: BTreeMap<String, Arc<dyn AtomStore>>,
    last_result: Option<Arc<CompilationResult>>,
}

/// Prompt compiler.
pub struct JitCompiler {
    config: CompilerConfig,
    config_hash: String,
    engine: Option<Arc<dyn RuleEngine>>,
    searcher: Option<Arc<dyn Searcher>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    embedded: bool,
    registry: RwLock<Registry>,
    cache: Option<RwLock<LruCache<CacheKey, Arc<CompilationResult>>>>,
}

impl JitCompiler {
    /// Create a compiler with no sources and no collaborators.
    pub fn new(config: CompilerConfig) -> Self {
        let cache = config.cache.enabled.then(|| {
            let size = NonZeroUsize::new(config.cache.max_entries).unwrap_or(NonZeroUsize::MIN);
            RwLock::new(LruCache::new(size))
        });
        Self {
            config_hash: config.params_hash(),
            config,
            engine: None,
            searcher: None,
            knowledge: None,
            embedded: false,
            registry: RwLock::new(Registry::default()),
            cache,
        }
    }

    /// Attach a rule engine.
    pub fn with_rule_engine(mut self, engine: Arc<dyn RuleEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attach a vector searcher. Disables the compile cache.
    pub fn with_searcher(mut self, searcher: Arc<dyn Searcher>) -> Self {
        self.searcher = Some(searcher);
        self
    }

    /// Attach a knowledge store.
    pub fn with_knowledge_store(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    /// Include the embedded corpus as the first source.
    pub fn with_embedded_corpus(mut self) -> Self {
        self.embedded = true;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }

    /// Register the project store, replacing any previous one.
    pub fn register_project_store(&self, store: Arc<dyn AtomStore>) {
        self.registry.write().project = Some(store);
        tracing::info!("Registered project atom store");
    }

    /// Register a store scoped to one shard instance.
    pub fn register_shard_store(&self, shard_id: impl Into<String>, store: Arc<dyn AtomStore>) {
        let shard_id = shard_id.into();
        tracing::info!(shard_id = %shard_id, "Registered shard atom store");
        self.registry.write().shards.insert(shard_id, store);
    }

    /// Unregister a shard store and close it. Returns whether one was registered.
    pub async fn unregister_shard_store(&self, shard_id: &str) -> Result<bool, StoreError> {
        let removed = self.registry.write().shards.remove(shard_id);
        match removed {
            Some(store) => {
                store.close().await?;
                tracing::info!(shard_id = %shard_id, "Unregistered and closed shard atom store");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Number of registered shard stores.
    pub fn shard_store_count(&self) -> usize {
        self.registry.read().shards.len()
    }

    /// Most recent successful compilation.
    pub fn last_result(&self) -> Option<Arc<CompilationResult>> {
        self.registry.read().last_result.clone()
    }

    /// Drop every cached result, e.g. after the rule base changed.
    pub fn invalidate_cache(&self) {
        if let Some(cache) = &self.cache {
            cache.write().clear();
            tracing::debug!("Compile cache invalidated");
        }
    }

    /// Compile a prompt for a context.
    pub async fn compile(&self, ctx: &CompilationContext) -> Result<CompilationResult, CompileError> {
        self.compile_with_cancel(ctx, &CancellationToken::new()).await
    }

    /// Compile a prompt, honoring a caller cancellation token at every
    /// suspension point.
    pub async fn compile_with_cancel(
        &self,
        ctx: &CompilationContext,
        token: &CancellationToken,
    ) -> Result<CompilationResult, CompileError> {
        let started = Instant::now();
        if ctx.token_budget == 0 {
            return Err(CompileError::InvalidContext("token budget must be positive".to_string()));
        }
        let available = available_tokens(ctx.token_budget, ctx.reserved_tokens)?;
        let guard = CallGuard::new(token.clone(), ctx.timeout);
        let context_hash = ctx.context_hash();
        let mut stats = CompilationStats::default();

        let sources = self.sources(ctx);
        let phase = Instant::now();
        let collected = Collector::new(self.config.knowledge_top_k)
            .collect(ctx, &sources, &guard)
            .await?;
        stats.collect_ms = elapsed_ms(phase);
        stats.candidates = collected.candidates.len();
        stats.kernel_injected = collected.kernel_injected;
        stats.knowledge_atoms = collected.knowledge_atoms;

        if collected.candidates.is_empty() {
            tracing::info!(context_hash = %context_hash, "No candidate atoms, empty prompt");
            stats.total_ms = elapsed_ms(started);
            let manifest = Manifest::new(context_hash, available, &[], Vec::new());
            return Ok(self.finish(CompilationResult::empty(manifest, available, stats)));
        }

        let cache_key = self.cache_key(&context_hash, &collected.candidates);
        if let Some(hit) = self.cache_lookup(cache_key.as_ref()) {
            let mut result = (*hit).clone();
            result.stats.cache_hit = true;
            result.stats.total_ms = elapsed_ms(started);
            tracing::debug!(context_hash = %context_hash, "Compile cache hit");
            return Ok(self.finish(result));
        }

        let phase = Instant::now();
        let selection = Selector::new(&self.config, self.engine.clone(), self.searcher.clone())
            .select(ctx, collected.candidates, &guard)
            .await?;
        stats.select_ms = elapsed_ms(phase);
        stats.vector_query_ms = selection.vector_query_ms;
        stats.skeleton_count = selection.skeleton_count;
        stats.flesh_count = selection.flesh_count;
        stats.mangle_override_count = selection.mangle_override_count;
        stats.fallback_used = selection.fallback_used;
        stats.skeleton_fallback_used = selection.skeleton_fallback_used;
        stats.vector_timed_out = selection.vector_timed_out;
        guard.check()?;

        let phase = Instant::now();
        let resolution = Resolver::new(&self.config).resolve(selection.selected)?;
        stats.resolve_ms = elapsed_ms(phase);
        for diagnostic in &resolution.diagnostics {
            tracing::warn!(kind = %diagnostic.kind, atom_id = %diagnostic.atom_id, "{}", diagnostic);
        }
        guard.check()?;

        let phase = Instant::now();
        let fitted = Budgeter::new(&self.config.budget).fit(resolution.ordered, available);
        stats.budget_ms = elapsed_ms(phase);

        let phase = Instant::now();
        let mut earlier_drops = selection.dropped;
        earlier_drops.extend(resolution.dropped);
        let mut result = assembler::assemble(context_hash, fitted, earlier_drops, stats);
        result.stats.assemble_ms = elapsed_ms(phase);
        result.stats.total_ms = elapsed_ms(started);

        tracing::info!(
            context_hash = %result.manifest.context_hash,
            atoms = result.atoms_included(),
            tokens = result.total_tokens,
            budget = available,
            over_budget = result.over_budget,
            fallback_used = result.stats.fallback_used,
            total_ms = result.stats.total_ms,
            "Prompt compiled"
        );

        if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
            cache.write().put(key, Arc::new(result.clone()));
        }
        Ok(self.finish(result))
    }

    /// Snapshot the sources for one compilation.
    fn sources(&self, ctx: &CompilationContext) -> Sources {
        let registry = self.registry.read();
        Sources {
            embedded: self.embedded,
            project: registry.project.clone(),
            shard: ctx
                .shard_id
                .as_deref()
                .and_then(|id| registry.shards.get(id).cloned()),
            engine: self.engine.clone(),
            knowledge: self.knowledge.clone(),
        }
    }

    /// Results depend on engine rules and vector hits, neither of which is
    /// part of the key, so compilations with collaborators bypass the cache.
    fn cache_key(&self, context_hash: &str, candidates: &[Atom]) -> Option<CacheKey> {
        if self.cache.is_none() || self.engine.is_some() || self.searcher.is_some() {
            return None;
        }
        Some(CacheKey {
            context_hash: context_hash.to_string(),
            candidates_hash: fingerprint_hex(FingerprintKind::Candidates, candidates),
            config_hash: self.config_hash.clone(),
        })
    }

    fn cache_lookup(&self, key: Option<&CacheKey>) -> Option<Arc<CompilationResult>> {
        let (cache, key) = (self.cache.as_ref()?, key?);
        cache.write().get(key).cloned()
    }

    fn finish(&self, result: CompilationResult) -> CompilationResult {
        self.registry.write().last_result = Some(Arc::new(result.clone()));
        result
    }
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}
