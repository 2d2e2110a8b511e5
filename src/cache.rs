//! The Cache Hierarchy (`spec.md` §4.3): three bounded layers — compiled
//! grammars, per-state masks, and accepted artifacts — each keyed by content
//! hash so identical requests across sessions share work.
//!
//! Grounded directly on the teacher's own cache, which already wraps an
//! `lru::LruCache` behind a lock for exactly this purpose; this module
//! generalizes that single grammar cache into the three layers `spec.md`
//! calls for and adds single-flight compilation so concurrent callers
//! compiling the same grammar text coalesce onto one compile.
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::grammar::{self, CompiledGrammar, GrammarError};
use crate::ipm::AllowMask;

type CompileSlot = Arc<OnceLock<Result<Arc<CompiledGrammar>, GrammarError>>>;

/// Caches compiled grammars by a content hash of their source text plus the
/// config that would affect compilation (`spec.md` §4.3, §4.1). Concurrent
/// callers requesting the same uncached grammar share one compile via the
/// `OnceLock` slot rather than racing each other.
pub struct GrammarCache {
    slots: Mutex<LruCache<u64, CompileSlot>>,
}

impl GrammarCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            slots: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(config.compiled_grammar_capacity.max(1)).unwrap(),
            )),
        }
    }

    fn key(source: &str, config: &crate::config::Config) -> u64 {
        let mut bytes = source.as_bytes().to_vec();
        bytes.extend_from_slice(config.start_nonterminal.as_bytes());
        crate::utils::content_hash(&bytes)
    }

    /// Returns the compiled grammar for `source`, compiling it at most once
    /// even under concurrent callers.
    pub fn get_or_compile(
        &self,
        source: &str,
        config: &crate::config::Config,
    ) -> Result<Arc<CompiledGrammar>, GrammarError> {
        let key = Self::key(source, config);
        let slot = {
            let mut slots = self.slots.lock();
            slots.get_or_insert(key, CompileSlot::default).clone()
        };
        slot.get_or_init(|| grammar::compile(source, config).map(Arc::new))
            .clone()
    }
}

/// Caches the allow-mask computed for a `(grammar, parser-state-key)` pair.
/// `spec.md` §4.3 notes this layer is only profitable for "simple" or
/// heavily-reused grammars; callers decide via
/// [`crate::config::Config::cache_enabled`] whether to consult it at all.
pub struct MaskCache {
    entries: Mutex<LruCache<(u64, u64), Arc<AllowMask>>>,
}

impl MaskCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(config.mask_capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn get(&self, grammar_key: u64, state_key: u64) -> Option<Arc<AllowMask>> {
        self.entries.lock().get(&(grammar_key, state_key)).cloned()
    }

    pub fn insert(&self, grammar_key: u64, state_key: u64, mask: Arc<AllowMask>) {
        self.entries.lock().put((grammar_key, state_key), mask);
    }
}

/// Caches complete accepted artifacts keyed by a content hash of the request
/// that produced them (`spec.md` §4.3) — a decode-orchestrator-level cache,
/// separate from the grammar and mask layers below it.
pub struct ArtifactCache {
    entries: Mutex<LruCache<u64, Arc<str>>>,
}

impl ArtifactCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(config.artifact_capacity.max(1)).unwrap(),
            )),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<str>> {
        self.entries.lock().get(&key).cloned()
    }

    pub fn insert(&self, key: u64, artifact: Arc<str>) {
        self.entries.lock().put(key, artifact);
    }

    /// Convenience content-hash over whatever a caller considers the
    /// request's cache identity (e.g. prefix + grammar source + options).
    pub fn key_for(parts: &[&str]) -> u64 {
        let mut bytes = Vec::new();
        for part in parts {
            bytes.extend_from_slice(part.as_bytes());
            bytes.push(0);
        }
        crate::utils::content_hash(&bytes)
    }
}

/// The three cache layers bundled together, mirroring how `Config` bundles
/// their sizing (`spec.md` §4.3). One `Caches` is shared across every
/// session a caller drives against the same engine instance.
pub struct Caches {
    pub grammars: GrammarCache,
    pub masks: MaskCache,
    pub artifacts: ArtifactCache,
}

impl Caches {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            grammars: GrammarCache::new(config),
            masks: MaskCache::new(config),
            artifacts: ArtifactCache::new(config),
        }
    }
}
