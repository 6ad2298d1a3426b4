//! Server-scoped object store.
//!
//! Holds long-lived objects handlers need across requests, such as state
//! machines and persistent worker handles. Values are keyed by string and
//! retrieved by type.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store key '{key}' does not hold a value of type {expected}")]
    TypeMismatch { key: String, expected: &'static str },
}

type Entry = Arc<dyn Any + Send + Sync>;

pub struct Store {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the value under `key`, creating it with `init` if absent.
    ///
    /// The lock is held while `init` runs, so a key is initialized once even
    /// when several tasks race for it. `init` must not touch the store.
    pub fn get_or_insert_with<T, F>(&self, key: &str, init: F) -> Result<Arc<T>, StoreError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.get_or_try_insert_with(key, || Ok::<_, StoreError>(Arc::new(init())))
    }

    /// Fallible variant of [`Store::get_or_insert_with`]. Nothing is stored
    /// when `init` fails.
    pub fn get_or_try_insert_with<T, E, F>(&self, key: &str, init: F) -> Result<Arc<T>, E>
    where
        T: Any + Send + Sync,
        E: From<StoreError>,
        F: FnOnce() -> Result<Arc<T>, E>,
    {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get(key) {
            return Ok(downcast(key, Arc::clone(entry))?);
        }

        let value = init()?;
        debug!(key, kind = type_name::<T>(), "Store entry created");
        entries.insert(key.to_string(), Arc::clone(&value) as Entry);
        Ok(value)
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Result<Option<Arc<T>>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|entry| downcast(key, Arc::clone(entry)))
            .transpose()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Drop the store's reference to `key`. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn downcast<T: Any + Send + Sync>(key: &str, entry: Entry) -> Result<Arc<T>, StoreError> {
    entry.downcast::<T>().map_err(|_| StoreError::TypeMismatch {
        key: key.to_string(),
        expected: type_name::<T>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Counter(AtomicUsize);

    #[test]
    fn test_insert_once() {
        let store = Store::new();
        let calls = AtomicUsize::new(0);

        let first = store
            .get_or_insert_with("counter", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Counter(AtomicUsize::new(0))
            })
            .unwrap();
        first.0.fetch_add(5, Ordering::SeqCst);

        let second = store
            .get_or_insert_with("counter", || {
                calls.fetch_add(1, Ordering::SeqCst);
                Counter(AtomicUsize::new(0))
            })
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.0.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_type_mismatch() {
        let store = Store::new();
        store.get_or_insert_with("key", || 1u32).unwrap();

        let err = store.get::<String>("key").unwrap_err();
        assert!(matches!(err, StoreError::TypeMismatch { ref key, .. } if key == "key"));
        assert!(store.get_or_insert_with("key", String::new).is_err());
        assert_eq!(*store.get::<u32>("key").unwrap().unwrap(), 1);
    }

    #[test]
    fn test_failed_init_stores_nothing() {
        #[derive(Debug)]
        enum InitError {
            Store,
            Boom,
        }
        impl From<StoreError> for InitError {
            fn from(_: StoreError) -> Self {
                InitError::Store
            }
        }

        let store = Store::new();
        let result: Result<Arc<u32>, InitError> =
            store.get_or_try_insert_with("key", || Err(InitError::Boom));

        assert!(matches!(result, Err(InitError::Boom)));
        assert!(!store.contains("key"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_contains_remove() {
        let store = Store::new();
        assert!(store.get::<u32>("missing").unwrap().is_none());

        store.get_or_insert_with("a", || "value".to_string()).unwrap();
        assert!(store.contains("a"));
        assert_eq!(store.len(), 1);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(!store.contains("a"));
    }

    #[test]
    fn test_concurrent_init_runs_once() {
        let store = Arc::new(Store::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    store
                        .get_or_insert_with("shared", || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(10));
                            7u64
                        })
                        .unwrap()
                })
            })
            .collect();

        for thread in threads {
            assert_eq!(*thread.join().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
