//! Shared compiled-program cache
//!
//! Process-scoped, lock-protected, reference-counted. Instances running
//! identical source share one program; the last release evicts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::{CompiledProgram, ProgramKey};

static CACHE: Lazy<Mutex<HashMap<ProgramKey, CacheEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

static STATS: Lazy<CacheStats> = Lazy::new(CacheStats::default);

struct CacheEntry {
    program: Arc<CompiledProgram>,
    refs: usize,
}

/// Cache counters for diagnostics.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Acquires satisfied by a resident program.
    pub hits: AtomicUsize,
    /// Acquires that compiled.
    pub misses: AtomicUsize,
    /// Entries dropped at refcount zero.
    pub evictions: AtomicUsize,
}

/// Global cache statistics.
pub fn cache_stats() -> &'static CacheStats {
    &STATS
}

/// The process-scoped program cache.
pub struct ProgramCache;

impl ProgramCache {
    /// Fetch the program for `key`, compiling via `build` on first use.
    /// Each successful acquire must be paired with a [`release`].
    ///
    /// [`release`]: ProgramCache::release
    pub fn acquire<F>(key: &ProgramKey, build: F) -> anyhow::Result<Arc<CompiledProgram>>
    where
        F: FnOnce() -> anyhow::Result<Arc<CompiledProgram>>,
    {
        let mut cache = CACHE.lock();
        if let Some(entry) = cache.get_mut(key) {
            entry.refs += 1;
            STATS.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.program.clone());
        }

        // Compile under the lock: two instances racing on the same key must
        // not produce two programs.
        let program = build()?;
        STATS.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "compiled program cached");
        cache.insert(
            key.clone(),
            CacheEntry {
                program: program.clone(),
                refs: 1,
            },
        );
        Ok(program)
    }

    /// Drop one reference; the entry is evicted when the count hits zero.
    pub fn release(key: &ProgramKey) {
        let mut cache = CACHE.lock();
        if let Some(entry) = cache.get_mut(key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                cache.remove(key);
                STATS.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "compiled program evicted");
            }
        }
    }

    /// Number of resident programs.
    pub fn resident() -> usize {
        CACHE.lock().len()
    }

    /// Whether a key is currently resident.
    pub fn contains(key: &ProgramKey) -> bool {
        CACHE.lock().contains_key(key)
    }
}
