//! LRU cache of page payloads
//!
//! A programmed page never changes content until its block is erased, so a
//! verified payload stays valid for as long as the page keeps its contents.
//! Entries are dropped when the page goes bad or its block is erased.

use crate::allocator::PageNo;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

/// Page cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Pages currently cached
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

pub struct PageCache {
    /// `None` when caching is disabled
    cache: Option<LruCache<PageNo, Arc<[u8]>>>,
    hits: u64,
    misses: u64,
}

impl PageCache {
    /// Create a cache holding up to `capacity` payloads (0 disables it)
    pub fn new(capacity: usize) -> Self {
        PageCache {
            cache: NonZeroUsize::new(capacity).map(LruCache::new),
            hits: 0,
            misses: 0,
        }
    }

    pub fn get(&mut self, page: PageNo) -> Option<Arc<[u8]>> {
        let found = self.cache.as_mut().and_then(|c| c.get(&page).cloned());
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn put(&mut self, page: PageNo, payload: Arc<[u8]>) {
        if let Some(cache) = self.cache.as_mut() {
            cache.put(page, payload);
        }
    }

    pub fn invalidate(&mut self, page: PageNo) {
        if let Some(cache) = self.cache.as_mut() {
            cache.pop(&page);
        }
    }

    /// Drop every cached page in `pages` (an erased block)
    pub fn invalidate_range(&mut self, pages: Range<PageNo>) {
        if let Some(cache) = self.cache.as_mut() {
            for page in pages {
                cache.pop(&page);
            }
        }
    }

    pub fn clear(&mut self) {
        if let Some(cache) = self.cache.as_mut() {
            cache.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            len: self.len(),
            capacity: self.cache.as_ref().map_or(0, |c| c.cap().get()),
        }
    }
}
