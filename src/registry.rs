//! Generic concurrent keyed registry.
//!
//! Every piece of process-wide state goes through one of these: model
//! descriptors, task handlers, scheduled tasks, metric descriptors, client
//! sets, cached seed kubeconfigs. Population happens during assembly;
//! after that handlers only read, except client refresh which uses
//! [`Registry::overwrite`].
use std::borrow::Borrow;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::RwLock;

use snafu::Snafu;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("item already registered: {}", key))]
    AlreadyRegistered { key: String },
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Tells [`Registry::range`] how to proceed after a callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Move on to the next item. Callbacks also return this after a
    /// recoverable per-item failure they have already logged.
    Continue,
    /// End the iteration early; `range` returns `Ok(())`.
    Stop,
}

pub struct Registry<K, V> {
    items: RwLock<HashMap<K, V>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Adds an item under a key that must not already be present.
    pub fn register(&self, key: K, value: V) -> Result<()> {
        let mut items = self.items.write().expect("registry lock poisoned");
        match items.entry(key) {
            Entry::Occupied(entry) => AlreadyRegistered {
                key: entry.key().to_string(),
            }
            .fail(),
            Entry::Vacant(entry) => {
                entry.insert(value);
                Ok(())
            }
        }
    }

    /// Like [`Registry::register`] but panics on conflict. Process init only.
    pub fn must_register(&self, key: K, value: V) {
        if let Err(err) = self.register(key, value) {
            panic!("{err}");
        }
    }

    /// Replaces the item unconditionally. Used for client refresh.
    pub fn overwrite(&self, key: K, value: V) {
        let mut items = self.items.write().expect("registry lock poisoned");
        items.insert(key, value);
    }

    /// Removes the item if present; a no-op otherwise.
    pub fn unregister<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut items = self.items.write().expect("registry lock poisoned");
        items.remove(key);
    }

    #[must_use]
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let items = self.items.read().expect("registry lock poisoned");
        items.get(key).cloned()
    }

    #[must_use]
    pub fn exists<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let items = self.items.read().expect("registry lock poisoned");
        items.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let items = self.items.read().expect("registry lock poisoned");
        items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates items in unspecified order under the read lock.
    ///
    /// `Ok(Flow::Stop)` ends the iteration and `range` returns `Ok(())`;
    /// any error ends the iteration and is returned unchanged. Callbacks
    /// must not block on I/O; async callers snapshot with
    /// [`Registry::entries`] instead.
    pub fn range<F, E>(&self, mut f: F) -> std::result::Result<(), E>
    where
        F: FnMut(&K, &V) -> std::result::Result<Flow, E>,
    {
        let items = self.items.read().expect("registry lock poisoned");
        for (key, value) in items.iter() {
            match f(key, value)? {
                Flow::Continue => {}
                Flow::Stop => break,
            }
        }
        Ok(())
    }

    /// Clones out the current items, releasing the lock before the caller
    /// does anything slow with them.
    #[must_use]
    pub fn entries(&self) -> Vec<(K, V)> {
        let items = self.items.read().expect("registry lock poisoned");
        items.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_rejects_duplicates() {
        let registry: Registry<String, i32> = Registry::new();
        registry.register("a".to_owned(), 1).unwrap();
        let err = registry.register("a".to_owned(), 2).unwrap_err();
        assert_eq!(
            err,
            Error::AlreadyRegistered {
                key: "a".to_owned()
            }
        );
        // The original value survives the failed registration.
        assert_eq!(registry.get("a"), Some(1));
    }

    #[test]
    fn overwrite_replaces() {
        let registry: Registry<String, i32> = Registry::new();
        registry.register("a".to_owned(), 1).unwrap();
        registry.overwrite("a".to_owned(), 2);
        assert_eq!(registry.get("a"), Some(2));
        registry.overwrite("b".to_owned(), 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_is_noop_when_absent() {
        let registry: Registry<String, i32> = Registry::new();
        registry.register("a".to_owned(), 1).unwrap();
        registry.unregister("missing");
        assert_eq!(registry.len(), 1);
        registry.unregister("a");
        assert!(!registry.exists("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn range_visits_everything() {
        let registry: Registry<String, i32> = Registry::new();
        for i in 0..5 {
            registry.register(format!("k{i}"), i).unwrap();
        }
        let mut seen = 0;
        registry
            .range(|_, _| {
                seen += 1;
                Ok::<_, Error>(Flow::Continue)
            })
            .unwrap();
        assert_eq!(seen, 5);
    }

    #[test]
    fn range_stops_early() {
        let registry: Registry<String, i32> = Registry::new();
        for i in 0..5 {
            registry.register(format!("k{i}"), i).unwrap();
        }
        let mut seen = 0;
        let result: Result<(), Error> = registry.range(|_, _| {
            seen += 1;
            Ok(Flow::Stop)
        });
        assert!(result.is_ok());
        assert_eq!(seen, 1);
    }

    #[test]
    fn range_propagates_errors_unchanged() {
        let registry: Registry<String, i32> = Registry::new();
        registry.register("a".to_owned(), 1).unwrap();
        let err = registry
            .range(|_, _| {
                Err::<Flow, _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn concurrent_registration() {
        use std::sync::Arc;

        let registry: Arc<Registry<String, usize>> = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        registry.overwrite(format!("k{t}-{i}"), i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }
}
