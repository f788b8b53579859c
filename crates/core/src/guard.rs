//! Per-key single-flight guard
//!
//! Guarantees at most one in-flight mutating operation (infer, save, load,
//! remove) per session id at any instant. Acquisition is scoped: the permit
//! releases its key on drop, so every exit path — success, error, or
//! cancellation — releases exactly once.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

/// A set of independent per-key locks. Holding a permit for one key never
/// blocks acquisition for another.
#[derive(Debug)]
pub struct SingleFlight<K> {
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        SingleFlight {
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Try to acquire the key. Returns `None` if it is already held.
    pub fn try_acquire(&self, key: &K) -> Option<Permit<K>> {
        let mut held = self.held.lock();
        if held.insert(key.clone()) {
            Some(Permit {
                key: key.clone(),
                held: Arc::clone(&self.held),
            })
        } else {
            None
        }
    }

    /// Whether the key is currently held
    pub fn is_held(&self, key: &K) -> bool {
        self.held.lock().contains(key)
    }
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped acquisition of one key; releases on drop.
#[derive(Debug)]
pub struct Permit<K: Eq + Hash> {
    key: K,
    held: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash> Drop for Permit<K> {
    fn drop(&mut self) {
        self.held.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails() {
        let guard = SingleFlight::new();
        let permit = guard.try_acquire(&"session-1").unwrap();
        assert!(guard.try_acquire(&"session-1").is_none());
        drop(permit);
        assert!(guard.try_acquire(&"session-1").is_some());
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let guard = SingleFlight::new();
        let _a = guard.try_acquire(&"a").unwrap();
        let _b = guard.try_acquire(&"b").unwrap();
        assert!(guard.is_held(&"a"));
        assert!(guard.is_held(&"b"));
    }

    #[test]
    fn test_release_on_error_path() {
        let guard = SingleFlight::new();

        let result: Result<(), ()> = (|| {
            let _permit = guard.try_acquire(&42u64).ok_or(())?;
            Err(())
        })();

        assert!(result.is_err());
        // The permit was dropped when the closure unwound
        assert!(!guard.is_held(&42u64));
    }
}
