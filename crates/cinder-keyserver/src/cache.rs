//! Read-through cache in front of a [`BundleStore`].
//!
//! Bundles are read on every session initiate and change only when their
//! owner republishes, so the cache is write-through on publish and never
//! expires entries on its own.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ServerError;
use crate::store::{BundleStore, PublishedBundle};

pub struct BundleCache {
    store: Arc<dyn BundleStore>,
    entries: RwLock<HashMap<String, Arc<PublishedBundle>>>,
}

impl BundleCache {
    pub fn new(store: Arc<dyn BundleStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, user_id: &str) -> Result<Option<Arc<PublishedBundle>>, ServerError> {
        if let Some(hit) = self.entries.read().get(user_id) {
            return Ok(Some(Arc::clone(hit)));
        }

        let Some(record) = self.store.get_bundle(user_id)? else {
            return Ok(None);
        };
        // Fill only an empty slot: a publish that landed while we were
        // reading the store is newer than `record`.
        let mut entries = self.entries.write();
        let entry = entries
            .entry(user_id.to_owned())
            .or_insert_with(|| Arc::new(record));
        Ok(Some(Arc::clone(entry)))
    }

    /// Persist first, then replace the cached entry.
    pub fn put(&self, user_id: &str, record: PublishedBundle) -> Result<(), ServerError> {
        self.store.put_bundle(user_id, &record)?;
        self.entries
            .write()
            .insert(user_id.to_owned(), Arc::new(record));
        Ok(())
    }

    pub fn invalidate(&self, user_id: &str) {
        self.entries.write().remove(user_id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;

    use cinder_crypto::{BundleTrust, KeyMaterial};

    use super::*;
    use crate::store::memory::MemoryStore;

    /// Counts reads that reach the backing store.
    struct CountingStore {
        inner: MemoryStore,
        reads: AtomicUsize,
    }

    impl BundleStore for CountingStore {
        fn put_bundle(&self, user_id: &str, record: &PublishedBundle) -> Result<(), ServerError> {
            self.inner.put_bundle(user_id, record)
        }

        fn get_bundle(&self, user_id: &str) -> Result<Option<PublishedBundle>, ServerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_bundle(user_id)
        }
    }

    /// Holds the first store read until the test lets it go.
    struct GatedStore {
        inner: MemoryStore,
        armed: AtomicBool,
        read_done: Barrier,
        resume: Barrier,
    }

    impl BundleStore for GatedStore {
        fn put_bundle(&self, user_id: &str, record: &PublishedBundle) -> Result<(), ServerError> {
            self.inner.put_bundle(user_id, record)
        }

        fn get_bundle(&self, user_id: &str) -> Result<Option<PublishedBundle>, ServerError> {
            let record = self.inner.get_bundle(user_id)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                self.read_done.wait();
                self.resume.wait();
            }
            Ok(record)
        }
    }

    fn record() -> PublishedBundle {
        record_at(1)
    }

    fn record_at(published_at: i64) -> PublishedBundle {
        PublishedBundle {
            bundle: KeyMaterial::generate(0).export_bundle(),
            trust: BundleTrust::Verified,
            published_at,
        }
    }

    #[test]
    fn second_read_is_served_from_cache() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            reads: AtomicUsize::new(0),
        });
        store.inner.put_bundle("bob", &record()).unwrap();

        let cache = BundleCache::new(store.clone());
        assert!(cache.is_empty());
        let first = cache.get("bob").unwrap().unwrap();
        let second = cache.get("bob").unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);

        cache.invalidate("bob");
        cache.get("bob").unwrap().unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn misses_are_not_cached() {
        let store = Arc::new(CountingStore {
            inner: MemoryStore::new(),
            reads: AtomicUsize::new(0),
        });
        let cache = BundleCache::new(store.clone());
        assert!(cache.get("ghost").unwrap().is_none());
        assert!(cache.get("ghost").unwrap().is_none());
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn publish_replaces_cached_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = BundleCache::new(store.clone());
        cache.put("bob", record()).unwrap();
        let old = cache.get("bob").unwrap().unwrap();

        let newer = record();
        cache.put("bob", newer.clone()).unwrap();
        let current = cache.get("bob").unwrap().unwrap();
        assert_ne!(*old, *current);
        assert_eq!(*current, newer);
        assert_eq!(store.get_bundle("bob").unwrap(), Some(newer));
    }

    #[test]
    fn republish_during_a_fill_is_not_overwritten() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            armed: AtomicBool::new(true),
            read_done: Barrier::new(2),
            resume: Barrier::new(2),
        });
        store.inner.put_bundle("bob", &record_at(1)).unwrap();
        let cache = BundleCache::new(store.clone());

        let seen = std::thread::scope(|s| {
            let reader = s.spawn(|| cache.get("bob").unwrap().unwrap());
            // The reader now holds the old record but has not cached it.
            store.read_done.wait();
            cache.put("bob", record_at(2)).unwrap();
            store.resume.wait();
            reader.join().unwrap()
        });

        assert_eq!(seen.published_at, 2);
        assert_eq!(cache.get("bob").unwrap().unwrap().published_at, 2);
        assert_eq!(store.get_bundle("bob").unwrap().unwrap().published_at, 2);
    }
}
