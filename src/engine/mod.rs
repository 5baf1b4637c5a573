//! Collaborator interfaces: rule engine, vector searcher, knowledge store.
//!
//! The compiler only speaks to collaborators through these narrow traits.
//! Rule engine facts travel as wire-format strings built in [`facts`]; the
//! engine answers with [`QueryRow`]s.

pub mod facts;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

use regex_lite::Regex;

pub use memory::{ScriptedRuleEngine, StaticKnowledgeStore, StaticSearcher};

/// Error raised by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    /// The rule engine rejected an assertion or query.
    #[error("Rule engine error: {0}")]
    Engine(String),
    /// The vector searcher failed.
    #[error("Search error: {0}")]
    Search(String),
    /// The knowledge store failed.
    #[error("Knowledge store error: {0}")]
    Knowledge(String),
    /// A row returned by the engine could not be parsed.
    #[error("Malformed row: {0}")]
    MalformedRow(String),
}

/// One argument of a query row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    /// Name constant, written `/name`. Stored without the slash.
    Name(String),
    /// Quoted string.
    Str(String),
    /// Integer.
    Int(i64),
    /// Float.
    Float(f64),
}

impl Term {
    /// Textual value: names without the slash, strings unquoted.
    pub fn as_text(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Str(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }

    /// Integer value, truncating floats and parsing numeric strings.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Float(f) => Some(*f as i64),
            Self::Str(s) | Self::Name(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "/{name}"),
            Self::Str(s) => write!(f, "{}", facts::quote(s)),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

/// A row returned by a rule engine query: `predicate(args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRow {
    /// Predicate name.
    pub predicate: String,
    /// Arguments in order.
    pub args: Vec<Term>,
}

fn row_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([a-z_][a-z0-9_]*)\s*\((.*)\)\s*\.?\s*$").ok())
        .as_ref()
}

impl QueryRow {
    /// Create a row.
    pub fn new(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.into(),
            args,
        }
    }

    /// Argument at a position.
    pub fn arg(&self, index: usize) -> Option<&Term> {
        self.args.get(index)
    }

    /// Textual argument at a position.
    pub fn text(&self, index: usize) -> Option<String> {
        self.arg(index).map(Term::as_text)
    }

    /// Parse a wire-format row such as `selected_result('identity/core', 90, /skeleton)`.
    pub fn parse(line: &str) -> Result<Self, CollaboratorError> {
        let captures = row_regex()
            .and_then(|re| re.captures(line))
            .ok_or_else(|| CollaboratorError::MalformedRow(line.to_string()))?;
        let predicate = captures[1].to_string();
        let args = split_args(&captures[2])
            .ok_or_else(|| CollaboratorError::MalformedRow(line.to_string()))?
            .into_iter()
            .map(|raw| parse_term(&raw))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| CollaboratorError::MalformedRow(line.to_string()))?;
        Ok(Self { predicate, args })
    }
}

impl fmt::Display for QueryRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(Term::to_string).collect();
        write!(f, "{}({})", self.predicate, args.join(", "))
    }
}

/// Split an argument list on top-level commas, honoring quotes and escapes.
fn split_args(body: &str) -> Option<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for ch in body.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match (quote, ch) {
            (Some(_), '\\') => {
                current.push(ch);
                escaped = true;
            }
            (Some(q), c) if c == q => {
                current.push(ch);
                quote = None;
            }
            (None, '\'' | '"') => {
                current.push(ch);
                quote = Some(ch);
            }
            (None, ',') => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }
    Some(args)
}

fn parse_term(raw: &str) -> Option<Term> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(name) = raw.strip_prefix('/') {
        return Some(Term::Name(name.to_string()));
    }
    for q in ['\'', '"'] {
        if raw.len() >= 2 && raw.starts_with(q) && raw.ends_with(q) {
            return Some(Term::Str(facts::unescape(&raw[1..raw.len() - 1])));
        }
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Some(Term::Int(i));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return Some(Term::Float(f));
    }
    // Bare identifiers are treated as names.
    Some(Term::Name(raw.to_string()))
}

/// Logic-programming rule engine.
///
/// Implementations must make `assert_batch` idempotent: the flesh phase may
/// re-assert facts already asserted by the skeleton phase.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Assert a batch of wire-format facts.
    async fn assert_batch(&self, facts: &[String]) -> Result<(), CollaboratorError>;

    /// Query all rows of a predicate.
    async fn query(&self, predicate: &str) -> Result<Vec<QueryRow>, CollaboratorError>;
}

/// A vector search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Atom ID.
    pub atom_id: String,
    /// Similarity [0, 1].
    pub score: f32,
}

impl SearchHit {
    /// Create a hit; the score is clamped to [0, 1].
    pub fn new(atom_id: impl Into<String>, score: f32) -> Self {
        Self {
            atom_id: atom_id.into(),
            score: if score.is_nan() { 0.0 } else { score.clamp(0.0, 1.0) },
        }
    }
}

/// Vector similarity search over atoms.
#[async_trait]
pub trait Searcher: Send + Sync {
    /// Up to `limit` atoms most similar to `query`.
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, CollaboratorError>;
}

/// A retrieved knowledge fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeFragment {
    /// Topic or title.
    pub topic: String,
    /// Body text.
    pub content: String,
    /// Similarity [0, 1].
    pub score: f32,
}

impl KnowledgeFragment {
    /// Create a fragment.
    pub fn new(topic: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            topic: topic.into(),
            content: content.into(),
            score,
        }
    }
}

/// Semantic knowledge retrieval.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Up to `limit` fragments relevant to `query`.
    async fn search_knowledge(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<KnowledgeFragment>, CollaboratorError>;
}
