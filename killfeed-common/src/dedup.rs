use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Bounded memory of recently seen killmail ids.
///
/// This only saves duplicate enrichment work inside one process: it forgets
/// on restart and evicts the least recently inserted ids once full.
pub struct DedupFilter {
    seen: Mutex<LruCache<i64, ()>>,
}

impl DedupFilter {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record `id` and report whether it was already present.
    /// A hit does not refresh the entry.
    pub fn seen(&self, id: i64) -> bool {
        let mut seen = match self.seen.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if seen.contains(&id) {
            return true;
        }

        seen.put(id, ());
        false
    }

    pub fn len(&self) -> usize {
        match self.seen.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
