//! Core types for the prompt compiler.

pub mod atom;
pub mod category;
pub mod context;
pub mod scored;
pub mod manifest;
pub mod result;

pub use atom::{Atom, ContextSelectors, RenderMode, estimate_tokens};
pub use category::Category;
pub use context::{CompilationContext, Dimension, normalize_tag};
pub use scored::{ScoredAtom, OrderedAtom, SelectionSource};
pub use manifest::{Manifest, ManifestEntry, DroppedEntry, DropReason};
pub use result::{CompilationResult, CompilationStats, RenderModeCounts};
