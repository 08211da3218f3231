use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lazy_static::lazy_static;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cost::Fingerprint;
use crate::orchestrator::TilingResult;
use crate::search::SearchConfig;
use crate::shape::ConvShapeSpec;
use crate::target::PlatformBudget;

pub const TILING_CACHE_CAPACITY: usize = 4096;

lazy_static! {
    static ref GLOBAL_CACHE: Arc<TilingCache> = Arc::new(TilingCache::new(TILING_CACHE_CAPACITY));
}

/// Everything that can change a plan.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub spec: ConvShapeSpec,
    pub platform: PlatformBudget,
    pub search: SearchConfig,
    pub use_repository: bool,
    pub cost_fingerprint: Fingerprint,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub rejections: u64,
}

/// A bounded plan cache. Inserting a new key at capacity is rejected; there is no eviction.
pub struct TilingCache {
    map: DashMap<CacheKey, Arc<TilingResult>>,
    capacity: usize,
    len: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    rejections: AtomicU64,
    warned_full: AtomicBool,
}

impl TilingCache {
    pub fn new(capacity: usize) -> Self {
        TilingCache {
            map: DashMap::new(),
            capacity,
            len: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            warned_full: AtomicBool::new(false),
        }
    }

    /// The process-wide cache.
    pub fn global() -> Arc<TilingCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<TilingResult>> {
        let found = self.map.get(key).map(|r| Arc::clone(r.value()));
        let counter = if found.is_some() {
            &self.hits
        } else {
            &self.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Stores `result`. Returns false, leaving the cache unchanged, when `key` is new
    /// and the cache is full. An existing key is overwritten.
    pub fn put(&self, key: CacheKey, result: Arc<TilingResult>) -> bool {
        match self.map.entry(key) {
            Entry::Occupied(mut e) => {
                e.insert(result);
                true
            }
            Entry::Vacant(e) => {
                let reserved = self
                    .len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    })
                    .is_ok();
                if reserved {
                    e.insert(result);
                } else {
                    self.rejections.fetch_add(1, Ordering::Relaxed);
                    if !self.warned_full.swap(true, Ordering::Relaxed) {
                        info!("Tiling cache is full at {} entries", self.capacity);
                    } else {
                        debug!("Tiling cache rejected an insert");
                    }
                }
                reserved
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
        }
    }
}

impl Default for TilingCache {
    fn default() -> Self {
        TilingCache::new(TILING_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::TilingOrchestrator;
    use crate::shape::ConvBuilder;
    use crate::target::TargetId;
    use crate::validate::validate;
    use rayon::prelude::*;

    fn key(ci: i64) -> CacheKey {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let spec = validate(
            &ConvBuilder::forward(1, ci, 16, [1, 8, 8], [1, 1, 1]).build(),
            &budget.limits,
        )
        .unwrap();
        CacheKey {
            spec,
            platform: budget.clone(),
            search: SearchConfig::default(),
            use_repository: false,
            cost_fingerprint: Fingerprint::new(),
        }
    }

    fn result() -> Arc<TilingResult> {
        let request = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 1, 1]).build();
        TilingOrchestrator::new(PlatformBudget::for_target(TargetId::Cube32))
            .with_cache(Arc::new(TilingCache::new(1)))
            .plan(&request)
            .unwrap()
            .result
    }

    #[test]
    fn test_rejects_new_keys_when_full() {
        let cache = TilingCache::new(2);
        let r = result();
        assert!(cache.put(key(16), Arc::clone(&r)));
        assert!(cache.put(key(32), Arc::clone(&r)));
        assert!(!cache.put(key(48), Arc::clone(&r)));
        assert!(cache.get(&key(48)).is_none());
        assert_eq!(cache.len(), 2);
        // Overwriting an existing key never needs a free slot.
        assert!(cache.put(key(16), Arc::clone(&r)));
        assert_eq!(cache.stats().rejections, 1);
    }

    #[test]
    fn test_distinct_hf32_flags_are_distinct_keys() {
        let cache = TilingCache::new(4);
        let a = key(16);
        let mut b = a.clone();
        b.spec.hf32 = true;
        assert!(cache.put(a.clone(), result()));
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
    }

    #[test]
    fn test_concurrent_puts_never_exceed_capacity() {
        let cache = TilingCache::new(8);
        let r = result();
        let accepted = (1..=64)
            .into_par_iter()
            .filter(|&i| cache.put(key(16 * i), Arc::clone(&r)))
            .count();
        assert_eq!(accepted, 8);
        assert_eq!(cache.len(), 8);
        assert_eq!(cache.stats().rejections, 56);
    }
}
