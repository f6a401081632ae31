//! # Page Cache
//!
//! In-memory map from page id to loaded page. A miss materializes the page
//! through the pager and inserts it clean; hits hand back the cached page.
//! The cache is unbounded for the life of an open tree — eviction happens
//! only when the allocator truncates a trailing page.
//!
//! ## Locking
//!
//! The map lives behind a `Mutex` and every page behind its own `RwLock`, so
//! pages can be admitted while the tree holds its *shared* lock: readers that
//! miss serialize on the map lock for the duration of the pager read, which
//! is the documented behavior (I/O-bound misses gate concurrent readers).
//! Writers are already exclusive at the tree level, so page locks are
//! uncontended for them; they exist to make shared-path admission sound.

use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::entry::Item;
use crate::storage::Pager;
use crate::tree::page::Page;

pub type PageHandle<K, V> = Arc<RwLock<Page<K, V>>>;

#[derive(Debug)]
pub struct PageCache<K, V> {
    pages: Mutex<HashMap<u32, PageHandle<K, V>>>,
    degree: u16,
}

impl<K: Item, V: Item> PageCache<K, V> {
    pub fn new(degree: u16) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            degree,
        }
    }

    /// Returns the cached page or unmarshals it through the pager.
    pub fn fetch(&self, id: u32, pager: &Pager) -> Result<PageHandle<K, V>> {
        let mut map = self.pages.lock();
        if let Some(page) = map.get(&id) {
            return Ok(Arc::clone(page));
        }

        let mut page = Page::new(id, self.degree);
        let mut buf = vec![0u8; pager.page_size() as usize];
        pager.read_page(id, &mut buf)?;
        page.read_from(&buf)?;

        let handle = Arc::new(RwLock::new(page));
        map.insert(id, Arc::clone(&handle));
        Ok(handle)
    }

    /// Drops a page from the cache (allocator truncation path).
    pub fn evict(&self, id: u32) {
        self.pages.lock().remove(&id);
    }

    /// All cached pages in ascending page order, for a deterministic flush walk.
    pub fn snapshot(&self) -> Vec<PageHandle<K, V>> {
        let map = self.pages.lock();
        let mut pages: Vec<_> = map.values().map(Arc::clone).collect();
        pages.sort_by_key(|p| p.read().id);
        pages
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.pages.lock().len()
    }
}
