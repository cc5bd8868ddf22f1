//! Shared access to cache stores.

use super::fingerprint::FingerprintMethod;
use super::paths::normalize;
use super::store::CacheStore;
use crate::errors::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hands out one [`CacheStore`] per normalized directory and method.
///
/// Two callers asking for `out/cache` and `./out/tmp/../cache` with the same
/// method get the same store, so they never hold diverging copies of the
/// index.
#[derive(Debug, Default)]
pub struct CacheRegistry {
    stores: DashMap<(PathBuf, FingerprintMethod), Arc<CacheStore>>,
}

impl CacheRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the store for `dir` and `method`, opening it on first use.
    pub fn store(&self, dir: impl AsRef<Path>, method: FingerprintMethod) -> Result<Arc<CacheStore>> {
        let dir = normalize(dir.as_ref())?;
        match self.stores.entry((dir, method)) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let store = Arc::new(CacheStore::open(&entry.key().0, method)?);
                entry.insert(Arc::clone(&store));
                Ok(store)
            }
        }
    }

    /// Number of open stores.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Returns true when no store has been opened.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CacheFixture;

    #[test]
    fn test_equal_directories_share_a_store() {
        let fixture = CacheFixture::new();
        let registry = CacheRegistry::new();
        let plain = fixture.cache_dir();
        let winding = fixture.root().join("cache/./tmp/../");

        let a = registry.store(&plain, FingerprintMethod::Md5).unwrap();
        let b = registry.store(&winding, FingerprintMethod::Md5).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_methods_get_distinct_stores() {
        let fixture = CacheFixture::new();
        let registry = CacheRegistry::new();

        let md5 = registry.store(fixture.cache_dir(), FingerprintMethod::Md5).unwrap();
        let stat = registry.store(fixture.cache_dir(), FingerprintMethod::Stat).unwrap();

        assert!(!Arc::ptr_eq(&md5, &stat));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_shared_store_sees_writes() {
        let fixture = CacheFixture::new();
        let input = fixture.write_input("a.txt", "alpha");
        let registry = CacheRegistry::new();

        let first = registry.store(fixture.cache_dir(), FingerprintMethod::Md5).unwrap();
        first
            .record(&input)
            .unwrap()
            .set_data(&["seen"], serde_json::json!(true))
            .unwrap();

        let second = registry.store(fixture.cache_dir(), FingerprintMethod::Md5).unwrap();
        assert_eq!(
            second.record(&input).unwrap().data(&["seen"]).unwrap(),
            Some(serde_json::json!(true))
        );
    }

    #[test]
    fn test_corrupt_index_is_not_registered() {
        let fixture = CacheFixture::new();
        std::fs::create_dir_all(fixture.cache_dir()).unwrap();
        std::fs::write(fixture.cache_dir().join("meta-stat.json"), "nope").unwrap();
        let registry = CacheRegistry::new();

        assert!(registry.store(fixture.cache_dir(), FingerprintMethod::Stat).is_err());
        assert!(registry.is_empty());
    }
}
