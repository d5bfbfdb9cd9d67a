#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::time::Duration;

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

/// Contains the number of entries a cache holds unless configured otherwise.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Provides a size constrained cache whose entries expire after a given time to live.
///
/// A cache behaves just like a **Map** as long as there is no shortage in storage. However, once
/// more than **capacity** entries are stored, the oldest entries (in the order in which they
/// were inserted, not in which they were read) are evicted.
///
/// Each entry carries its own expiry timestamp. Expired entries are never returned. They are
/// removed once they are hit by a lookup, once the cache runs out of space or once
/// [purge_expired](ExpiringCache::purge_expired) runs. Therefore only live entries are ever
/// evicted.
///
/// All methods take **&self**, so that a cache can be shared by many concurrent requests.
///
/// # Examples
/// ```
/// # use dogpile::cache::ExpiringCache;
/// # use std::time::Duration;
/// // A cache which keeps up to 2 outfit suggestions for one minute...
/// let cache = ExpiringCache::new(2, Duration::from_secs(60));
///
/// cache.put("look-1".to_owned(), "denim jacket".to_owned());
/// cache.put("look-2".to_owned(), "linen shirt".to_owned());
/// assert_eq!(cache.get("look-1").as_deref(), Some("denim jacket"));
///
/// // Reading "look-1" doesn't protect it, as entries are evicted in insertion order...
/// cache.put("look-3".to_owned(), "wool coat".to_owned());
/// assert_eq!(cache.get("look-1"), None);
/// assert_eq!(cache.get("look-2").as_deref(), Some("linen shirt"));
///
/// let stats = cache.stats();
/// assert_eq!((stats.hits, stats.misses, stats.evictions, stats.size), (2, 1, 1, 2));
/// ```
pub struct ExpiringCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    capacity: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    map: LinkedHashMap<K, CacheEntry<V>>,
}

/// Entries are never mutated once stored. Replacing a key stores a new entry.
///
/// A TTL too large to be represented as a point in time yields an entry which never expires.
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Contains a snapshot of the counters of a cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// The number of lookups which found a live entry.
    pub hits: u64,
    /// The number of lookups which found nothing or an expired entry.
    pub misses: u64,
    /// The number of live entries which were dropped to enforce the capacity.
    pub evictions: u64,
    /// The number of expired entries which have been removed.
    pub expirations: u64,
    /// The number of entries currently stored.
    ///
    /// Note that this might include expired entries which haven't been purged yet.
    pub size: usize,
}

impl CacheStats {
    /// Returns the hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.hits + self.misses {
            0 => 0.,
            reads => self.hits as f32 / reads as f32 * 100.,
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Num Entries", self.size)?;
        writeln!(f, "{:<30} {:>20}", "Hits", self.hits)?;
        writeln!(f, "{:<30} {:>20}", "Misses", self.misses)?;
        writeln!(f, "{:<30} {:>18.2} %", "Hit Rate", self.hit_rate())?;
        writeln!(f, "{:<30} {:>20}", "Evictions", self.evictions)?;
        writeln!(f, "{:<30} {:>20}", "Expirations", self.expirations)
    }
}

impl<K: Hash + Eq, V> ExpiringCache<K, V> {
    /// Creates a new cache which stores up to **capacity** entries, each living for **ttl**
    /// unless stored via [put_with_ttl](ExpiringCache::put_with_ttl).
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        ExpiringCache {
            inner: Mutex::new(Inner {
                capacity,
                ttl,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
                map: LinkedHashMap::new(),
            }),
        }
    }

    /// Creates a new cache with the given TTL which stores up to
    /// [DEFAULT_MAX_ENTRIES](DEFAULT_MAX_ENTRIES) entries.
    pub fn with_ttl(ttl: Duration) -> Self {
        ExpiringCache::new(DEFAULT_MAX_ENTRIES, ttl)
    }

    /// Returns a clone of the live value stored for the given key.
    ///
    /// An expired entry is reported as **None** and removed right away.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let mut inner = self.inner.lock();
        let value = inner.read(key, Instant::now());
        if value.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }

        value
    }

    /// Repeats a lookup whose miss has already been counted.
    ///
    /// If the key has been stored in the meantime, the counted miss becomes a hit.
    pub(crate) fn recheck<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let mut inner = self.inner.lock();
        let value = inner.read(key, Instant::now());
        if value.is_some() {
            inner.misses = inner.misses.saturating_sub(1);
            inner.hits += 1;
        }

        value
    }

    /// Stores the given value using the default TTL of this cache.
    pub fn put(&self, key: K, value: V) {
        let ttl = self.inner.lock().ttl;
        self.put_with_ttl(key, value, ttl);
    }

    /// Stores the given value so that it expires after the given TTL.
    ///
    /// Replacing an existing key stores a fresh entry which counts as the most recently
    /// inserted one. If the cache grows beyond its capacity, the oldest entries are evicted.
    pub fn put_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            inserted_at: now,
            expires_at: now.checked_add(ttl),
        };

        let mut inner = self.inner.lock();
        let _ = inner.map.insert(key, entry);
        inner.enforce_capacity(now);
    }

    /// Removes the entry for the given key if present.
    ///
    /// Callers use this once they know that a cached value became stale, e.g. after a write.
    pub fn invalidate<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _ = self.inner.lock().map.remove(key);
    }

    /// Removes all entries from this cache.
    ///
    /// Note that this doesn't reset the statistics, see [reset_stats](ExpiringCache::reset_stats).
    pub fn flush(&self) {
        self.inner.lock().map.clear();
    }

    /// Returns how long ago the live entry for the given key was stored.
    pub fn age<Q>(&self, key: &Q) -> Option<Duration>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let now = Instant::now();
        self.inner
            .lock()
            .map
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| now.duration_since(entry.inserted_at))
    }

    /// Returns the number of entries in the cache (including expired ones not purged yet).
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Returns the maximal number of entries permitted in this cache.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Changes the maximal number of entries permitted in this cache.
    ///
    /// Shrinking the cache evicts the oldest entries immediately.
    pub fn set_capacity(&self, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.capacity = capacity;
        inner.enforce_capacity(Instant::now());
    }

    /// Returns the TTL applied by [put](ExpiringCache::put).
    pub fn ttl(&self) -> Duration {
        self.inner.lock().ttl
    }

    /// Changes the TTL applied by [put](ExpiringCache::put).
    ///
    /// Note that this will not affect existing entries, but only ones stored after this call.
    pub fn set_ttl(&self, ttl: Duration) {
        self.inner.lock().ttl = ttl;
    }

    /// Returns a snapshot of the counters of this cache.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.map.len(),
        }
    }

    /// Resets all counters to zero. The stored entries are left untouched.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.hits = 0;
        inner.misses = 0;
        inner.evictions = 0;
        inner.expirations = 0;
    }

    /// Removes all expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.inner.lock().remove_expired(Instant::now())
    }
}

impl<K: Hash + Eq, V> Inner<K, V> {
    fn read<Q>(&mut self, key: &Q, now: Instant) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let (expired, value) = match self.map.get(key) {
            None => (false, None),
            Some(entry) if entry.is_expired(now) => (true, None),
            Some(entry) => (false, Some(entry.value.clone())),
        };

        if expired {
            let _ = self.map.remove(key);
            self.expirations += 1;
        }

        value
    }

    fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for entry in self.map.entries() {
            if entry.get().is_expired(now) {
                let _ = entry.remove();
                removed += 1;
            }
        }

        self.expirations += removed as u64;
        removed
    }

    /// Expired entries never occupy a slot which a live entry needs. Only if the live entries
    /// alone exceed the capacity, the oldest ones are evicted.
    fn enforce_capacity(&mut self, now: Instant) {
        if self.map.len() <= self.capacity {
            return;
        }

        let _ = self.remove_expired(now);
        while self.map.len() > self.capacity && self.map.pop_front().is_some() {
            self.evictions += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{CacheStats, ExpiringCache, DEFAULT_MAX_ENTRIES};
    use mock_instant::thread_local::MockClock;
    use std::time::Duration;

    fn cache(capacity: usize) -> ExpiringCache<String, String> {
        ExpiringCache::new(capacity, Duration::from_secs(60))
    }

    #[test]
    fn oldest_inserted_entries_are_evicted_first() {
        let cache = cache(3);
        for key in ["A", "B", "C", "D"] {
            cache.put(key.to_owned(), key.to_lowercase());
        }

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("A"), None);
        assert_eq!(cache.get("B").as_deref(), Some("b"));
        assert_eq!(cache.get("C").as_deref(), Some("c"));
        assert_eq!(cache.get("D").as_deref(), Some("d"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn reads_do_not_change_the_eviction_order() {
        let cache = cache(3);
        cache.put("A".to_owned(), "a".to_owned());
        cache.put("B".to_owned(), "b".to_owned());
        cache.put("C".to_owned(), "c".to_owned());

        // In an LRU cache, this would save "A"...
        assert!(cache.get("A").is_some());
        cache.put("D".to_owned(), "d".to_owned());

        assert_eq!(cache.get("A"), None);
        assert!(cache.get("B").is_some());
    }

    #[test]
    fn replacing_a_key_makes_it_the_newest_entry() {
        let cache = cache(3);
        cache.put("A".to_owned(), "a".to_owned());
        cache.put("B".to_owned(), "b".to_owned());
        cache.put("C".to_owned(), "c".to_owned());

        cache.put("A".to_owned(), "a2".to_owned());
        assert_eq!(cache.len(), 3);

        cache.put("D".to_owned(), "d".to_owned());
        assert_eq!(cache.get("A").as_deref(), Some("a2"));
        assert_eq!(cache.get("B"), None);
    }

    #[test]
    fn inserting_many_keys_keeps_the_most_recent_ones() {
        let cache = cache(10);
        for i in 0..25 {
            cache.put(format!("key-{}", i), i.to_string());
            assert!(cache.len() <= 10);
        }

        for i in 0..15 {
            assert_eq!(cache.get(format!("key-{}", i).as_str()), None);
        }
        for i in 15..25 {
            assert_eq!(cache.get(format!("key-{}", i).as_str()), Some(i.to_string()));
        }
        assert_eq!(cache.stats().evictions, 15);
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ExpiringCache::new(16, Duration::from_secs(15 * 60));
        cache.put("Foo".to_owned(), "Bar".to_owned());
        assert_eq!(cache.get("Foo").as_deref(), Some("Bar"));

        MockClock::advance(Duration::from_secs(15 * 60 - 1));
        assert_eq!(cache.get("Foo").as_deref(), Some("Bar"));

        MockClock::advance(Duration::from_secs(1));
        assert_eq!(cache.get("Foo"), None);

        // The expired entry has been removed by the lookup...
        assert_eq!(cache.len(), 0);
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 2,
                misses: 1,
                evictions: 0,
                expirations: 1,
                size: 0
            }
        );
    }

    #[test]
    fn individual_ttls_are_respected() {
        let cache = ExpiringCache::new(16, Duration::from_secs(60));
        cache.put_with_ttl("short".to_owned(), 1, Duration::from_secs(5));
        cache.put("long".to_owned(), 2);

        MockClock::advance(Duration::from_secs(10));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.age("long"), Some(Duration::from_secs(10)));
        assert_eq!(cache.age("short"), None);
    }

    #[test]
    fn expired_entries_are_not_counted_as_evictions() {
        let cache = ExpiringCache::new(2, Duration::from_secs(60));
        cache.put_with_ttl("A".to_owned(), 1, Duration::from_secs(1));
        cache.put("B".to_owned(), 2);

        MockClock::advance(Duration::from_secs(2));
        cache.put("C".to_owned(), 3);

        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
        assert_eq!(cache.get("B"), Some(2));
        assert_eq!(cache.get("C"), Some(3));
    }

    #[test]
    fn expired_entries_make_room_before_live_ones_are_evicted() {
        let cache = ExpiringCache::new(3, Duration::from_secs(60));
        cache.put("A".to_owned(), 1);
        cache.put_with_ttl("B".to_owned(), 2, Duration::from_secs(1));
        cache.put("C".to_owned(), 3);

        MockClock::advance(Duration::from_secs(2));
        cache.put("D".to_owned(), 4);

        assert_eq!(cache.get("A"), Some(1));
        assert_eq!(cache.get("C"), Some(3));
        assert_eq!(cache.get("D"), Some(4));
        let stats = cache.stats();
        assert_eq!((stats.evictions, stats.expirations, stats.size), (0, 1, 3));

        // Once all entries are live, the oldest one is evicted again...
        cache.put("E".to_owned(), 5);
        assert_eq!(cache.get("A"), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn a_late_hit_replaces_the_counted_miss() {
        let cache = cache(16);
        assert_eq!(cache.get("A"), None);
        assert_eq!(cache.recheck("A"), None);

        cache.put("A".to_owned(), "a".to_owned());
        assert_eq!(cache.recheck("A").as_deref(), Some("a"));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 0));
    }

    #[test]
    fn purging_removes_only_expired_entries() {
        let cache = ExpiringCache::new(16, Duration::from_secs(60));
        cache.put_with_ttl("A".to_owned(), 1, Duration::from_secs(1));
        cache.put_with_ttl("B".to_owned(), 2, Duration::from_secs(1));
        cache.put("C".to_owned(), 3);

        assert_eq!(cache.purge_expired(), 0);
        MockClock::advance(Duration::from_secs(1));
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("C"), Some(3));
    }

    #[test]
    fn invalidate_always_yields_a_miss() {
        let cache = cache(16);
        cache.put("Foo".to_owned(), "Bar".to_owned());

        cache.invalidate("Foo");
        assert_eq!(cache.get("Foo"), None);

        // Invalidating an absent key is fine as well...
        cache.invalidate("Foo");
        cache.invalidate("Unknown");
        assert_eq!(cache.get("Foo"), None);
    }

    #[test]
    fn shrinking_the_capacity_evicts_immediately() {
        let cache = cache(DEFAULT_MAX_ENTRIES);
        for i in 0..6 {
            cache.put(format!("key-{}", i), i.to_string());
        }

        cache.set_capacity(2);
        assert_eq!(cache.capacity(), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("key-4").is_some());
        assert!(cache.get("key-5").is_some());
    }

    #[test]
    fn a_new_ttl_only_applies_to_new_entries() {
        let cache = ExpiringCache::new(16, Duration::from_secs(60));
        cache.put("old".to_owned(), 1);
        cache.set_ttl(Duration::from_secs(5));
        assert_eq!(cache.ttl(), Duration::from_secs(5));
        cache.put("new".to_owned(), 2);

        MockClock::advance(Duration::from_secs(10));
        assert_eq!(cache.get("old"), Some(1));
        assert_eq!(cache.get("new"), None);
    }

    #[test]
    fn stats_are_only_reset_explicitly() {
        let cache = cache(16);
        cache.put("A".to_owned(), "a".to_owned());
        let _ = cache.get("A");
        let _ = cache.get("B");

        cache.flush();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hit_rate().round() as i32, 50);

        cache.reset_stats();
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
