//! Compiled-program interface
//!
//! The compiler is an external collaborator; this module consumes its
//! output: an immutable handler table keyed by (state name, event kind),
//! a declared global slot layout, and a content-derived cache key.

pub mod cache;

pub use cache::{cache_stats, CacheStats, ProgramCache};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::EventKind;
use crate::exec::Handler;
use crate::value::{SlotLayout, SlotRef, ValueKind};

/// Cache key for a compiled program: a content hash of the source, or the
/// asset identity when source text is unavailable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramKey {
    /// blake3 hex of the source text.
    Source(String),
    /// Asset identity, for binary-only scripts.
    Asset(String),
}

impl ProgramKey {
    /// Key derived from source text.
    pub fn from_source(source: &str) -> Self {
        ProgramKey::Source(blake3::hash(source.as_bytes()).to_hex().to_string())
    }

    /// Key for an asset-identified script.
    pub fn from_asset(asset: impl Into<String>) -> Self {
        ProgramKey::Asset(asset.into())
    }
}

impl std::fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramKey::Source(hash) => write!(f, "src:{hash}"),
            ProgramKey::Asset(id) => write!(f, "asset:{id}"),
        }
    }
}

/// Immutable, shareable output of compiling one script.
///
/// Read-only after construction; instances running identical source share
/// one program through the [`ProgramCache`].
pub struct CompiledProgram {
    key: ProgramKey,
    layout: SlotLayout,
    heap_limit: usize,
    handlers: HashMap<(String, EventKind), Arc<dyn Handler>>,
    handled_anywhere: HashSet<EventKind>,
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("key", &self.key)
            .field("handlers", &self.handlers.len())
            .field("heap_limit", &self.heap_limit)
            .finish()
    }
}

impl CompiledProgram {
    /// Cache key.
    #[inline]
    pub fn key(&self) -> &ProgramKey {
        &self.key
    }

    /// Declared global slot layout.
    #[inline]
    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Declared heap limit in bytes.
    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    /// Handler for (state, kind), if the script declares one.
    pub fn handler(&self, state: &str, kind: EventKind) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&(state.to_owned(), kind)).cloned()
    }

    /// Whether any state of the program handles this kind. Events with no
    /// possible handler are rejected at admission.
    #[inline]
    pub fn handles_anywhere(&self, kind: EventKind) -> bool {
        self.handled_anywhere.contains(&kind)
    }

    /// Event kinds handled in one named state, for world-side queries.
    pub fn kinds_in_state(&self, state: &str) -> Vec<EventKind> {
        let mut kinds: Vec<EventKind> = self
            .handlers
            .keys()
            .filter(|(s, _)| s == state)
            .map(|&(_, kind)| kind)
            .collect();
        kinds.sort_by_key(|k| k.name());
        kinds
    }
}

/// Builder used by the compiler collaborator (and tests) to assemble a
/// program.
pub struct ProgramBuilder {
    key: ProgramKey,
    layout: SlotLayout,
    heap_limit: usize,
    handlers: HashMap<(String, EventKind), Arc<dyn Handler>>,
}

impl ProgramBuilder {
    /// Start a program with the given cache key.
    pub fn new(key: ProgramKey) -> Self {
        Self {
            key,
            layout: SlotLayout::default(),
            heap_limit: 256 * 1024,
            handlers: HashMap::new(),
        }
    }

    /// Set the declared heap limit.
    pub fn heap_limit(mut self, bytes: usize) -> Self {
        self.heap_limit = bytes;
        self
    }

    /// Declare a named global variable.
    pub fn declare(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.layout.declare(name, kind);
        self
    }

    /// Declare a named global variable, handing back its slot.
    pub fn declare_slot(&mut self, name: impl Into<String>, kind: ValueKind) -> SlotRef {
        self.layout.declare(name, kind)
    }

    /// Register a handler for (state, kind).
    pub fn handler(
        mut self,
        state: impl Into<String>,
        kind: EventKind,
        handler: Arc<dyn Handler>,
    ) -> Self {
        self.handlers.insert((state.into(), kind), handler);
        self
    }

    /// Finish the program.
    pub fn build(self) -> Arc<CompiledProgram> {
        let handled_anywhere = self.handlers.keys().map(|&(_, kind)| kind).collect();
        Arc::new(CompiledProgram {
            key: self.key,
            layout: self.layout,
            heap_limit: self.heap_limit,
            handlers: self.handlers,
            handled_anywhere,
        })
    }
}
