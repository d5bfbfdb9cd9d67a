//! Provides a size constrained cache whose entries expire after a given time to live.
//!
//! An [ExpiringCache](ExpiringCache) is the leaf component of the caching layer. It behaves like a
//! map with two limits: each entry carries an expiry timestamp (TTL = time to live), and once more
//! than the configured number of entries is stored, the oldest entries are evicted. Note that
//! eviction strictly follows the insertion order. In contrast to an LRU cache, reading an entry
//! doesn't protect it from being evicted.
//!
//! Most probably a cache isn't used directly but wrapped in a
//! [StampedeGuard](crate::guard::StampedeGuard) which collapses concurrent misses for the same
//! key into a single computation.
//!
//! The [install](install) function creates such a guard based on the `caches` section of the
//! system config and keeps its settings up to date once the config changes.
mod expiring;
mod install;

pub use expiring::CacheStats;
pub use expiring::ExpiringCache;
pub use expiring::DEFAULT_MAX_ENTRIES;
pub use install::install;
pub use install::CacheSettings;
