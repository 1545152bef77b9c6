//! Keyed response cache with a process-wide registry.
//!
//! Each query family owns a [`Cache`]. Every cache is registered in a
//! [`CacheRegistry`] on creation, so [`clear_cache`] can empty all of them at
//! once (for example on logout).
//!
//! Entries have no TTL and no capacity bound: they live until they are
//! overwritten, deleted, or cleared.

use std::fmt;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use tracing::debug;

/// Anything the registry can empty.
trait Clear: Send + Sync {
    fn clear(&self);
}

impl<V: Send + Sync> Clear for DashMap<String, V> {
    fn clear(&self) {
        DashMap::clear(self);
    }
}

/// A keyed store of last-known-good values.
///
/// Cloning a `Cache` yields another handle to the same entries.
pub struct Cache<V> {
    entries: Arc<DashMap<String, V>>,
}

impl<V> Clone for Cache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> fmt::Debug for Cache<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<V: Clone + Send + Sync + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Creates an empty cache registered in the global registry.
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(CacheRegistry::global())
    }

    /// Creates an empty cache registered in `registry`.
    #[must_use]
    pub fn new_in(registry: &CacheRegistry) -> Self {
        let entries = Arc::new(DashMap::new());
        registry.register(&entries);
        Self { entries }
    }

    /// Returns the value stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Inserts or overwrites the value stored under `key`.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), value);
    }

    /// Removes the value stored under `key`. Missing keys are ignored.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Returns `true` if a value is stored under `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes every entry from this cache only.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// A set of caches that can be cleared together.
///
/// The registry only holds weak references: a cache whose handles have all
/// been dropped is deregistered and pruned on the next [`clear_all`].
///
/// [`clear_all`]: CacheRegistry::clear_all
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<Vec<Weak<dyn Clear>>>,
}

impl fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

static GLOBAL: LazyLock<CacheRegistry> = LazyLock::new(CacheRegistry::new);

impl CacheRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used by [`Cache::new`].
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    fn register<V: Send + Sync + 'static>(&self, entries: &Arc<DashMap<String, V>>) {
        let weak: Weak<dyn Clear> = Arc::downgrade(entries) as Weak<dyn Clear>;
        self.caches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(weak);
    }

    /// Number of registered caches that are still alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.caches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|cache| cache.strong_count() > 0)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empties every live registered cache and forgets dropped ones.
    pub fn clear_all(&self) {
        let mut caches = self.caches.lock().unwrap_or_else(PoisonError::into_inner);
        caches.retain(|cache| match cache.upgrade() {
            Some(cache) => {
                cache.clear();
                true
            }
            None => false,
        });
        debug!(caches = caches.len(), "cleared all registered caches");
    }
}

/// Empties every cache registered in the global registry.
pub fn clear_cache() {
    CacheRegistry::global().clear_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_missing_key() {
        let registry = CacheRegistry::new();
        let cache: Cache<i32> = Cache::new_in(&registry);
        assert_eq!(cache.get("missing"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_set_overwrites() {
        let registry = CacheRegistry::new();
        let cache = Cache::new_in(&registry);

        cache.set("/users/1", 1);
        cache.set("/users/1", 2);

        assert_eq!(cache.get("/users/1"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_delete() {
        let registry = CacheRegistry::new();
        let cache = Cache::new_in(&registry);

        cache.set("a", "x".to_string());
        cache.delete("a");
        cache.delete("a");

        assert!(!cache.contains("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = CacheRegistry::new();
        let cache = Cache::new_in(&registry);
        let other = cache.clone();

        other.set("k", 7);
        assert_eq!(cache.get("k"), Some(7));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clear_all_empties_every_cache() {
        let registry = CacheRegistry::new();
        let numbers: Cache<i32> = Cache::new_in(&registry);
        let names: Cache<String> = Cache::new_in(&registry);

        numbers.set("a", 1);
        names.set("b", "bob".to_string());
        registry.clear_all();

        assert!(numbers.is_empty());
        assert!(names.is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_clear_only_affects_own_registry() {
        let first = CacheRegistry::new();
        let second = CacheRegistry::new();
        let a: Cache<i32> = Cache::new_in(&first);
        let b: Cache<i32> = Cache::new_in(&second);

        a.set("k", 1);
        b.set("k", 2);
        first.clear_all();

        assert_eq!(a.get("k"), None);
        assert_eq!(b.get("k"), Some(2));
    }

    #[test]
    fn test_dropped_cache_is_deregistered() {
        let registry = CacheRegistry::new();
        assert!(registry.is_empty());
        {
            let _only: Cache<i32> = Cache::new_in(&registry);
            assert!(!registry.is_empty());
        }
        assert!(registry.is_empty());

        let kept: Cache<i32> = Cache::new_in(&registry);
        {
            let dropped: Cache<i32> = Cache::new_in(&registry);
            dropped.set("x", 1);
            assert_eq!(registry.len(), 2);
        }

        assert_eq!(registry.len(), 1);
        registry.clear_all();
        assert_eq!(registry.caches.lock().map(|c| c.len()).unwrap_or(0), 1);
        assert!(kept.is_empty());
    }
}
