//! Time based eviction map
//!
//! Every access refreshes an entry's last-access time. `sweep` walks access
//! timestamps in ascending order and evicts the keys whose *current* last-access
//! time is still the one recorded under that timestamp, so keys touched again after
//! being scheduled are spared. Sweeping costs O(evicted), not O(entries).

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    time::Instant,
};

/// Source of the current time in milliseconds
pub trait Clock {
    /// Milliseconds elapsed since an arbitrary, fixed origin
    fn now_millis(&self) -> u64;
}

/// `Clock` backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> MonotonicClock {
        MonotonicClock { origin: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

pub struct TimeCache<K, V, C = MonotonicClock> {
    timeout: u64,
    values: HashMap<K, V>,
    last_access: HashMap<K, u64>,
    access_log: BTreeMap<u64, Vec<K>>,
    clock: C,
}

impl<K, V> TimeCache<K, V, MonotonicClock>
where
    K: Hash + Eq + Clone,
{
    /// Creates a cache evicting entries idle for `timeout` milliseconds
    pub fn new(timeout: u64) -> TimeCache<K, V, MonotonicClock> {
        TimeCache::with_clock(timeout, MonotonicClock::default())
    }
}

impl<K, V, C> TimeCache<K, V, C>
where
    K: Hash + Eq + Clone,
    C: Clock,
{
    pub fn with_clock(timeout: u64, clock: C) -> TimeCache<K, V, C> {
        TimeCache {
            timeout,
            values: HashMap::new(),
            last_access: HashMap::new(),
            access_log: BTreeMap::new(),
            clock,
        }
    }

    fn touch(&mut self, key: &K) {
        let now = self.clock.now_millis();
        if let Some(&last) = self.last_access.get(key) {
            if last == now {
                return;
            }
        }
        self.last_access.insert(key.clone(), now);
        self.access_log.entry(now).or_default().push(key.clone());
    }

    /// Get a value and refresh its access time
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.values.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.values.get(key)
    }

    /// Get a value without refreshing its access time
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Insert or replace a value, refreshing its access time
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.touch(&key);
        self.values.insert(key, value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        // Stale `access_log` slots are skipped by `sweep`
        self.last_access.remove(key);
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.last_access.clear();
        self.access_log.clear();
    }

    /// Evict every entry idle for at least the timeout, returning them
    pub fn sweep(&mut self) -> Vec<(K, V)> {
        let now = self.clock.now_millis();
        let mut evicted = Vec::new();

        while let Some(entry) = self.access_log.first_entry() {
            if now.saturating_sub(*entry.key()) < self.timeout {
                break;
            }

            let (timestamp, keys) = entry.remove_entry();
            for key in keys {
                if self.last_access.get(&key) != Some(&timestamp) {
                    continue;
                }
                self.last_access.remove(&key);
                if let Some(value) = self.values.remove(&key) {
                    evicted.push((key, value));
                }
            }
        }

        evicted
    }
}

#[cfg(test)]
mod test {
    use std::{cell::Cell, rc::Rc};

    use super::*;

    #[derive(Clone, Default)]
    struct ManualClock(Rc<Cell<u64>>);

    impl ManualClock {
        fn advance(&self, millis: u64) {
            self.0.set(self.0.get() + millis);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.get()
        }
    }

    #[test]
    fn entries_survive_within_timeout() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(1000, clock.clone());

        cache.insert("a", 1);
        clock.advance(999);
        assert!(cache.sweep().is_empty());
        assert_eq!(cache.get(&"a"), Some(&1));
    }

    #[test]
    fn sweep_evicts_idle_entries() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(1000, clock.clone());

        cache.insert("a", 1);
        clock.advance(500);
        cache.insert("b", 2);
        clock.advance(500);

        let evicted = cache.sweep();
        assert_eq!(evicted, vec![("a", 1)]);
        assert!(!cache.contains_key(&"a"));
        assert!(cache.contains_key(&"b"));

        clock.advance(500);
        assert_eq!(cache.sweep(), vec![("b", 2)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn access_spares_scheduled_entry() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(1000, clock.clone());

        cache.insert("a", 1);
        clock.advance(800);
        assert_eq!(cache.get(&"a"), Some(&1));
        clock.advance(300);

        assert!(cache.sweep().is_empty());
        assert!(cache.contains_key(&"a"));

        clock.advance(700);
        assert_eq!(cache.sweep().len(), 1);
    }

    #[test]
    fn peek_does_not_refresh() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(100, clock.clone());

        cache.insert(1u32, "x");
        clock.advance(60);
        assert_eq!(cache.peek(&1), Some(&"x"));
        clock.advance(60);
        assert_eq!(cache.sweep().len(), 1);
    }

    #[test]
    fn sweep_is_idempotent() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(10, clock.clone());

        cache.insert(1u32, 1u32);
        cache.insert(2, 2);
        clock.advance(10);
        assert_eq!(cache.sweep().len(), 2);
        assert!(cache.sweep().is_empty());
        assert!(cache.sweep().is_empty());
    }

    #[test]
    fn removed_entries_are_not_evicted_twice() {
        let clock = ManualClock::default();
        let mut cache = TimeCache::with_clock(10, clock.clone());

        cache.insert("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        clock.advance(1);
        cache.insert("a", 2);
        clock.advance(10);

        assert_eq!(cache.sweep(), vec![("a", 2)]);
    }
}
