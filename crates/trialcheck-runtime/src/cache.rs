//! Compiled-rule cache
//!
//! Holds real-time validators keyed by rule id and content hash. Readers
//! clone an `Arc` snapshot of the whole map and never block on compilation;
//! writers build a new map beside the old one and swap it in. Concurrent
//! misses on the same rule id wait on one compilation instead of racing.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use trialcheck_core::ir::RealTimeValidator;

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached validators; 0 means unbounded
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl CacheConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }
}

/// Cache hit/miss statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub compilations: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry {
    content_hash: String,
    validator: Arc<RealTimeValidator>,
    /// Insertion order, for eviction
    seq: u64,
}

type Snapshot = Arc<HashMap<String, Arc<CacheEntry>>>;

/// Copy-on-write cache of compiled validators
pub struct RuleCache {
    config: CacheConfig,
    entries: RwLock<Snapshot>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    compilations: AtomicU64,
    evictions: AtomicU64,
}

impl RuleCache {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(Arc::new(HashMap::new())),
            flights: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            compilations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Snapshot {
        self.entries.read().clone()
    }

    /// Cached validator for this exact rule version, if any
    pub fn get(&self, rule_id: &str, content_hash: &str) -> Option<Arc<RealTimeValidator>> {
        self.snapshot()
            .get(rule_id)
            .filter(|entry| entry.content_hash == content_hash)
            .map(|entry| entry.validator.clone())
    }

    /// Return the cached validator, compiling it on a miss.
    ///
    /// A stale entry (same id, different hash) counts as a miss and is
    /// replaced. Compile errors are returned and nothing is cached.
    pub fn get_or_compile<F, E>(
        &self,
        rule_id: &str,
        content_hash: &str,
        compile: F,
    ) -> std::result::Result<Arc<RealTimeValidator>, E>
    where
        F: FnOnce() -> std::result::Result<RealTimeValidator, E>,
    {
        if let Some(validator) = self.get(rule_id, content_hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(validator);
        }

        let flight = self
            .flights
            .lock()
            .entry(rule_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = flight.lock();

        // Another caller may have compiled it while we waited
        if let Some(validator) = self.get(rule_id, content_hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(validator);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let validator = Arc::new(compile()?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!("Compiled and cached validator for rule '{}'", rule_id);

        self.install(rule_id, content_hash, validator.clone());
        Ok(validator)
    }

    /// Insert a freshly compiled validator, replacing any older version
    pub fn insert(&self, rule_id: &str, content_hash: &str, validator: RealTimeValidator) -> Arc<RealTimeValidator> {
        let validator = Arc::new(validator);
        self.install(rule_id, content_hash, validator.clone());
        validator
    }

    fn install(&self, rule_id: &str, content_hash: &str, validator: Arc<RealTimeValidator>) {
        let mut entries = self.entries.write();
        let mut next: HashMap<_, _> = (**entries).clone();

        next.insert(
            rule_id.to_string(),
            Arc::new(CacheEntry {
                content_hash: content_hash.to_string(),
                validator,
                seq: self.seq.fetch_add(1, Ordering::Relaxed),
            }),
        );

        while self.config.max_entries > 0 && next.len() > self.config.max_entries {
            let oldest = next
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    next.remove(&id);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        *entries = Arc::new(next);
    }

    /// Evict a rule. Returns true if it was cached.
    pub fn invalidate(&self, rule_id: &str) -> bool {
        let mut entries = self.entries.write();
        if !entries.contains_key(rule_id) {
            return false;
        }
        let mut next: HashMap<_, _> = (**entries).clone();
        next.remove(rule_id);
        *entries = Arc::new(next);
        drop(entries);

        self.flights.lock().remove(rule_id);
        debug!("Invalidated cached validator for rule '{}'", rule_id);
        true
    }

    /// Evict everything
    pub fn clear(&self) {
        *self.entries.write() = Arc::new(HashMap::new());
        self.flights.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, rule_id: &str) -> bool {
        self.snapshot().contains_key(rule_id)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            compilations: self.compilations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::time::Duration;
    use trialcheck_core::ast::{FieldRef, Severity};
    use trialcheck_core::ir::primitive::Primitive;
    use trialcheck_core::types::FieldType;
    use trialcheck_core::Value;

    fn validator(id: &str) -> RealTimeValidator {
        RealTimeValidator::new(
            id,
            "hash",
            FieldRef {
                name: "age".to_string(),
                field_type: FieldType::Numeric,
                missing_tokens: vec![],
            },
            Severity::Error,
            "true",
            None,
            Box::new(|_, _| Ok(Value::Bool(true))),
            vec![Primitive::Const],
        )
    }

    #[test]
    fn test_lazy_compile_then_hit() {
        let cache = RuleCache::new();
        let calls = AtomicUsize::new(0);
        let compile = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(validator("r1"))
        };

        let a = cache.get_or_compile("r1", "h1", compile).unwrap();
        let b = cache
            .get_or_compile("r1", "h1", || Err::<RealTimeValidator, _>("unused".to_string()))
            .unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.compilations), (1, 1, 1));
    }

    #[test]
    fn test_hash_change_recompiles() {
        let cache = RuleCache::new();
        let a = cache
            .get_or_compile("r1", "h1", || Ok::<_, String>(validator("r1")))
            .unwrap();
        let b = cache
            .get_or_compile("r1", "h2", || Ok::<_, String>(validator("r1")))
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(cache.get("r1", "h1").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_compile_error_not_cached() {
        let cache = RuleCache::new();
        let err = cache
            .get_or_compile("r1", "h1", || Err::<RealTimeValidator, _>("bad".to_string()))
            .unwrap_err();
        assert_eq!(err, "bad");
        assert!(!cache.contains("r1"));
    }

    #[test]
    fn test_invalidate() {
        let cache = RuleCache::new();
        cache.insert("r1", "h1", validator("r1"));
        assert!(cache.invalidate("r1"));
        assert!(!cache.invalidate("r1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_readers_keep_old_snapshot() {
        let cache = RuleCache::new();
        let old = cache.insert("r1", "h1", validator("r1"));
        cache.invalidate("r1");
        // The evicted validator stays usable by whoever holds it
        assert_eq!(old.rule_id(), "r1");
    }

    #[test]
    fn test_eviction_drops_oldest() {
        let cache = RuleCache::with_config(CacheConfig::default().with_max_entries(2));
        cache.insert("a", "h", validator("a"));
        cache.insert("b", "h", validator("b"));
        cache.insert("c", "h", validator("c"));
        assert!(!cache.contains("a"));
        assert!(cache.contains("b") && cache.contains("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_concurrent_misses_compile_once() {
        let cache = Arc::new(RuleCache::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_compile("r1", "h1", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok::<_, String>(validator("r1"))
                        })
                        .unwrap()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|v| Arc::ptr_eq(v, &results[0])));
    }
}
