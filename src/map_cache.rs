//! LRU cache of virtual map pages
//!
//! Whole map pages are cached by the logical address of the sector holding
//! them. A unit transfer moves a page physically but keeps its logical
//! address, so entries survive collection; they are evicted only when the
//! page sector itself turns into garbage.

use lru::LruCache;
use std::num::NonZeroUsize;

pub struct MapPageCache {
    cache: LruCache<u32, Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl MapPageCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        MapPageCache {
            cache: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Entry `index` of the page at `address`, if the page is cached
    pub fn entry(&mut self, address: u32, index: usize) -> Option<u32> {
        match self.cache.get(&address) {
            Some(page) => {
                self.hits += 1;
                Some(read_entry(page, index))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, address: u32, page: Vec<u8>) {
        self.cache.put(address, page);
    }

    /// Write-through update of a single entry; uncached pages are left alone
    pub fn update_entry(&mut self, address: u32, index: usize, value: u32) {
        if let Some(page) = self.cache.peek_mut(&address) {
            let off = index * 4;
            page[off..off + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    pub fn evict(&mut self, address: u32) {
        self.cache.pop(&address);
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// Little-endian entry `index` of a raw map page
pub fn read_entry(page: &[u8], index: usize) -> u32 {
    let off = index * 4;
    u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
}
