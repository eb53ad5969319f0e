//! Caching layer: the process-wide cache that deferred actions bypass.
//!
//! Deferred actions run after commit and usually write through to data the
//! cache may hold, so the coordinator disables the cache while they run and
//! resets it afterwards. Several units of work may flush at once, so disabling
//! is scope-counted: the cache stays disabled until every scope that disabled it
//! has reset it.

use std::{
    any::Any,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;

/// The capability set the transaction coordinator needs from a cache.
pub trait CacheLayer: Send + Sync {
    /// Stops the cache from serving or accepting values.
    fn disable(&self);

    /// Discards cached values and ends one [`disable`](Self::disable) scope.
    fn reset(&self);
}

/// Disables a cache for as long as the guard lives, then resets it exactly once.
///
/// The reset also happens when the guarded code fails, panics, or is cancelled.
#[must_use = "the cache is reset as soon as the bracket is dropped"]
pub struct CacheBracket<'a> {
    cache: &'a dyn CacheLayer,
}

impl<'a> CacheBracket<'a> {
    pub fn enter(cache: &'a dyn CacheLayer) -> Self {
        cache.disable();
        Self { cache }
    }
}

impl Drop for CacheBracket<'_> {
    fn drop(&mut self) {
        self.cache.reset();
    }
}

/// In-memory cache of type-erased values keyed by string.
///
/// A lookup only succeeds if the stored value has the requested type. Entries
/// live in a sharded [`DashMap`], so concurrent requests do not serialize on
/// one lock.
///
/// # Examples
///
/// ```
/// use autotx::cache::{CacheLayer, MemoryCache};
///
/// let cache = MemoryCache::new();
/// cache.insert("user:42", String::from("Ada"));
/// assert_eq!(cache.get::<String>("user:42").as_deref(), Some("Ada"));
///
/// cache.disable();
/// assert_eq!(cache.get::<String>("user:42"), None);
/// cache.reset();
/// assert!(cache.is_enabled());
/// assert!(cache.is_empty());
/// ```
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Box<dyn Any + Send + Sync>>,
    disabled_scopes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled_scopes.load(Ordering::SeqCst) == 0
    }

    /// Number of scopes currently holding the cache disabled.
    pub fn disabled_scopes(&self) -> usize {
        self.disabled_scopes.load(Ordering::SeqCst)
    }

    /// Returns a clone of the value stored under `key`, if the cache is enabled
    /// and the value is a `T`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.is_enabled() {
            return None;
        }
        self.entries
            .get(key)
            .and_then(|entry| entry.value().downcast_ref::<T>().cloned())
    }

    /// Stores `value` under `key`. Returns `false`, storing nothing, while the
    /// cache is disabled.
    pub fn insert<T>(&self, key: impl Into<String>, value: T) -> bool
    where
        T: Send + Sync + 'static,
    {
        if !self.is_enabled() {
            return false;
        }
        self.entries.insert(key.into(), Box::new(value));
        true
    }

    /// Returns the cached `T` under `key`, computing and storing it on a miss.
    /// While disabled, `init` runs every time and nothing is stored.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        if let Some(value) = self.get::<T>(key) {
            return value;
        }
        let value = init();
        self.insert(key, value.clone());
        value
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discards every value without changing whether the cache is enabled.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl CacheLayer for MemoryCache {
    fn disable(&self) {
        self.disabled_scopes.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.clear();
        // Saturating: a reset without a matching disable only clears.
        let _ = self
            .disabled_scopes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |scopes| scopes.checked_sub(1));
    }
}
