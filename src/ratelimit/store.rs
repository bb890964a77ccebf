//! Window counter storage.
//!
//! [`CounterStore`] is the seam between the limiter and wherever counters
//! live. [`MemoryCounterStore`] is the in-process implementation; other
//! implementations are plugged in through the
//! [`BackendRegistry`](super::backend::BackendRegistry).

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::policy::Policy;
use crate::error::Result;

/// Per-key state for one fixed window.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    /// Requests observed in the current window
    pub count: u64,
    /// Start of the current window
    pub first_request_at: u64,
    /// End of the current window; the entry is stale once `now` passes it
    pub window_reset_at: u64,
}

impl CounterEntry {
    /// An empty entry whose window opens at `now`.
    pub fn fresh(policy: &Policy, now: u64) -> Self {
        Self {
            count: 0,
            first_request_at: now,
            window_reset_at: now.saturating_add(policy.window_ms()),
        }
    }

    /// Whether the window has elapsed and the entry must be replaced.
    pub fn is_expired(&self, now: u64) -> bool {
        now > self.window_reset_at
    }
}

/// Storage backend for window counters.
///
/// Implementations must make `hit` atomic per key: the expiry check, the
/// replacement of a stale entry and the increment happen as one step, so no
/// two concurrent hits for a key observe the same pre-increment count.
pub trait CounterStore: Send + Sync {
    /// Short backend name, used in logs and health output.
    fn kind(&self) -> &'static str;

    /// Fetch the entry for `key` (creating or resetting it as needed) and
    /// count one request against it. Returns the entry after the increment.
    fn hit(&self, key: &str, policy: &Policy, now: u64) -> Result<CounterEntry>;

    /// Give back one previously counted request, if the entry for `key` is
    /// still the window identified by `window_reset_at`.
    fn release(&self, key: &str, window_reset_at: u64) -> Result<()>;

    /// Remove every entry whose window ended before `now`.
    /// Returns the number of entries removed.
    fn sweep(&self, now: u64) -> Result<usize>;

    /// Number of tracked keys.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process counter store.
///
/// Backed by a sharded map; each key's read-check-write runs while holding
/// that key's shard lock, so unrelated keys on other shards never wait.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, CounterEntry>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live entry for `key`, creating it lazily or replacing it
    /// if its window has elapsed. Does not count a request.
    pub fn get_or_create(&self, key: &str, policy: &Policy, now: u64) -> CounterEntry {
        *self.live_entry(key, policy, now)
    }

    /// Count one request against the live entry for `key`.
    ///
    /// A missing or elapsed entry is replaced by a fresh window before the
    /// increment, all under the key's shard lock.
    pub fn increment(&self, key: &str, policy: &Policy, now: u64) -> CounterEntry {
        let mut entry = self.live_entry(key, policy, now);
        entry.count += 1;
        *entry
    }

    /// Look up an entry without modifying it.
    pub fn get(&self, key: &str) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Clear all counters.
    pub fn clear(&self) {
        self.entries.clear();
    }

    fn live_entry(
        &self,
        key: &str,
        policy: &Policy,
        now: u64,
    ) -> dashmap::mapref::one::RefMut<'_, String, CounterEntry> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) => {
                let mut entry = occupied.into_ref();
                if entry.is_expired(now) {
                    *entry = CounterEntry::fresh(policy, now);
                }
                entry
            }
            Entry::Vacant(vacant) => vacant.insert(CounterEntry::fresh(policy, now)),
        }
    }
}

impl CounterStore for MemoryCounterStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn hit(&self, key: &str, policy: &Policy, now: u64) -> Result<CounterEntry> {
        Ok(self.increment(key, policy, now))
    }

    fn release(&self, key: &str, window_reset_at: u64) -> Result<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.window_reset_at == window_reset_at && entry.count > 0 {
                entry.count -= 1;
            }
        }
        Ok(())
    }

    fn sweep(&self, now: u64) -> Result<usize> {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.window_reset_at >= now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn minute_policy() -> Policy {
        Policy::new("test", 3, Duration::from_secs(60))
    }

    #[test]
    fn test_get_or_create_is_lazy_and_idempotent() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        let entry = store.get_or_create("a", &policy, 1_000);
        assert_eq!(entry.count, 0);
        assert_eq!(entry.first_request_at, 1_000);
        assert_eq!(entry.window_reset_at, 61_000);

        let again = store.get_or_create("a", &policy, 2_000);
        assert_eq!(again, entry);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_increment_existing_entry() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        store.get_or_create("a", &policy, 0);
        assert_eq!(store.increment("a", &policy, 10).count, 1);
        assert_eq!(store.increment("a", &policy, 20).count, 2);
        assert_eq!(store.increment("b", &policy, 30).count, 1);
    }

    #[test]
    fn test_increment_replaces_elapsed_window() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        for _ in 0..3 {
            store.hit("a", &policy, 0).unwrap();
        }
        let entry = store.increment("a", &policy, 60_001);
        assert_eq!(entry.count, 1);
        assert_eq!(entry.first_request_at, 60_001);
        assert_eq!(entry.window_reset_at, 120_001);
    }

    #[test]
    fn test_get_or_create_then_increment_after_expiry() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        store.get_or_create("a", &policy, 0);
        store.increment("a", &policy, 0);
        let stale = store.get_or_create("a", &policy, 90_000);
        assert_eq!(stale.count, 0);
        assert_eq!(store.increment("a", &policy, 90_000).count, 1);
    }

    #[test]
    fn test_hit_resets_stale_window() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        for _ in 0..3 {
            store.hit("a", &policy, 0).unwrap();
        }
        // Still inside the window at exactly window_reset_at
        assert_eq!(store.hit("a", &policy, 60_000).unwrap().count, 4);

        let entry = store.hit("a", &policy, 60_001).unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.first_request_at, 60_001);
        assert_eq!(entry.window_reset_at, 120_001);
    }

    #[test]
    fn test_release_only_applies_to_same_window() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        let first = store.hit("a", &policy, 0).unwrap();
        store.hit("a", &policy, 10).unwrap();
        store.release("a", first.window_reset_at).unwrap();
        assert_eq!(store.get("a").unwrap().count, 1);

        store.hit("a", &policy, 70_000).unwrap();
        store.release("a", first.window_reset_at).unwrap();
        assert_eq!(store.get("a").unwrap().count, 1);

        store.release("missing", 0).unwrap();
    }

    #[test]
    fn test_release_never_goes_negative() {
        let store = MemoryCounterStore::new();
        let policy = minute_policy();

        let entry = store.get_or_create("a", &policy, 0);
        store.release("a", entry.window_reset_at).unwrap();
        assert_eq!(store.get("a").unwrap().count, 0);
    }

    #[test]
    fn test_sweep_removes_only_elapsed_windows() {
        let store = MemoryCounterStore::new();
        let short = Policy::new("short", 1, Duration::from_secs(1));
        let long = minute_policy();

        store.hit("short", &short, 0).unwrap();
        store.hit("long", &long, 0).unwrap();

        assert_eq!(store.sweep(1_000).unwrap(), 0);
        assert_eq!(store.sweep(1_001).unwrap(), 1);
        assert!(store.get("short").is_none());
        assert!(store.get("long").is_some());
    }

    #[test]
    fn test_sweep_twice_is_noop() {
        let store = MemoryCounterStore::new();
        let policy = Policy::new("p", 1, Duration::from_millis(10));

        for key in ["a", "b", "c"] {
            store.hit(key, &policy, 0).unwrap();
        }

        assert_eq!(store.sweep(100).unwrap(), 3);
        assert_eq!(store.sweep(100).unwrap(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_hits_are_not_lost() {
        let store = Arc::new(MemoryCounterStore::new());
        let policy = Policy::new("p", 1_000_000, Duration::from_secs(3600));
        let threads = 8;
        let hits_per_thread = 500;

        std::thread::scope(|scope| {
            for _ in 0..threads {
                let store = Arc::clone(&store);
                let policy = policy.clone();
                scope.spawn(move || {
                    for _ in 0..hits_per_thread {
                        store.hit("shared", &policy, 5).unwrap();
                    }
                });
            }
        });

        assert_eq!(
            store.get("shared").unwrap().count,
            (threads * hits_per_thread) as u64
        );
    }

    #[test]
    fn test_clear() {
        let store = MemoryCounterStore::new();
        store.hit("a", &minute_policy(), 0).unwrap();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.kind(), "memory");
    }
}
