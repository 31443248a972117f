//! Concurrency helpers for running independent simulations.
//!
//! With the `parallel` feature, independent simulations run on the rayon
//! thread pool through [`join`]; without it they run one after another on
//! the caller's thread. [`ComputedCache`] memoizes derived results so that
//! metrics sharing a dependency compute it once.
//!
//! # Feature Flag
//!
//! Parallel execution requires the `parallel` feature:
//! ```toml
//! [dependencies]
//! lantern = { version = "0.1", features = ["parallel"] }
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};

/// Runs two closures, in parallel when the `parallel` feature is enabled.
#[cfg(feature = "parallel")]
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    rayon::join(a, b)
}

/// Runs two closures, in parallel when the `parallel` feature is enabled.
#[cfg(not(feature = "parallel"))]
pub fn join<A, B, RA, RB>(a: A, b: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send,
    B: FnOnce() -> RB + Send,
    RA: Send,
    RB: Send,
{
    (a(), b())
}

/// A computation asked for the key it was computing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value was requested again while it was being computed")]
pub struct ReentrantComputation;

struct Entry<V> {
    value: OnceLock<V>,
    /// Thread running the computation, if any
    computing: Mutex<Option<ThreadId>>,
}

impl<V> Default for Entry<V> {
    fn default() -> Self {
        Self {
            value: OnceLock::new(),
            computing: Mutex::new(None),
        }
    }
}

/// Clears the computing thread even if the computation unwinds.
struct ComputingGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for ComputingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = None;
    }
}

/// Thread-safe memo of computed values.
///
/// Concurrent requests for the same key wait for a single computation
/// instead of starting their own. Failed computations are cached like any
/// other value. A computation may request other keys but not its own.
pub struct ComputedCache<K, V> {
    entries: Mutex<HashMap<K, Arc<Entry<V>>>>,
}

impl<K, V> Default for ComputedCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> std::fmt::Debug for ComputedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedCache")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

impl<K, V> ComputedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key`, computing it with `compute` first
    /// if nobody has.
    ///
    /// Fails with [`ReentrantComputation`] when called for `key` from inside
    /// its own computation, which would otherwise never finish.
    pub fn get_or_compute<F>(&self, key: &K, compute: F) -> Result<V, ReentrantComputation>
    where
        F: FnOnce() -> V,
    {
        // the map lock is released before computing so other keys proceed
        let entry = {
            let mut entries = self.entries.lock();
            Arc::clone(entries.entry(key.clone()).or_default())
        };
        if let Some(value) = entry.value.get() {
            return Ok(value.clone());
        }

        let current = thread::current().id();
        if *entry.computing.lock() == Some(current) {
            return Err(ReentrantComputation);
        }
        let value = entry.value.get_or_init(|| {
            *entry.computing.lock() = Some(current);
            let _guard = ComputingGuard(&entry.computing);
            compute()
        });
        Ok(value.clone())
    }

    /// Returns the value for `key` if it has been computed.
    pub fn get(&self, key: &K) -> Option<V> {
        let entry = self.entries.lock().get(key).cloned()?;
        entry.value.get().cloned()
    }

    /// Returns the number of keys requested so far.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing has been requested.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drops every cached value.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
