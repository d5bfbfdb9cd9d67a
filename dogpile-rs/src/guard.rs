//! Collapses concurrent cache misses into a single computation.
//!
//! Imagine a popular outfit suggestion which just expired. Without further precautions, every
//! request which arrives until the new value has been computed would trigger its own (slow and
//! expensive) upstream call. This is known as cache stampede or dogpile.
//!
//! A [StampedeGuard](StampedeGuard) therefore keeps track of all computations which are currently
//! in flight. The first request which misses a key becomes the **owner** of a computation and
//! invokes the producer. All requests for the same key arriving in the meantime become
//! **joiners**: they never invoke the producer but wait for the outcome of the owner. A
//! successful outcome is stored in the cache, a failed one is handed to the owner and all joiners
//! but never cached, so that the next request retries.
//!
//! If the owner is dropped (e.g. because its request was cancelled) or if the producer exceeds
//! the configured compute timeout, the computation is torn down and all joiners receive an
//! appropriate error. Either way, the next request will start a new computation.
//!
//! # Examples
//!
//! ```
//! # use dogpile::guard::StampedeGuard;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let guard: StampedeGuard<String, String> =
//!     StampedeGuard::with_ttl("palettes", Duration::from_secs(300));
//!
//! // The first call invokes the producer...
//! let palette = guard
//!     .get_or_compute("img123".to_owned(), || async { Ok("navy, sand, white".to_owned()) })
//!     .await
//!     .unwrap();
//! assert_eq!(palette, "navy, sand, white");
//!
//! // ...whereas the second one is served from the cache.
//! let palette = guard
//!     .get_or_compute("img123".to_owned(), || async { Ok("something else".to_owned()) })
//!     .await
//!     .unwrap();
//! assert_eq!(palette, "navy, sand, white");
//!
//! assert_eq!(guard.stats().computations, 1);
//! assert_eq!(guard.stats().cache.hits, 1);
//! # });
//! ```
use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;

use crate::average::Average;
use crate::cache::{CacheStats, ExpiringCache};
use crate::fmt::format_short_duration;

/// Describes why a value couldn't be obtained.
///
/// Note that a miss is never an error. All variants describe a failed computation, which is
/// observed by the owner and all joiners alike.
#[derive(thiserror::Error, Debug)]
pub enum ComputeError<E> {
    /// The producer failed with the contained error.
    ///
    /// The error is shared by all waiters, therefore it is wrapped in an **Arc**.
    #[error("Producer failed: {0}")]
    Producer(Arc<E>),

    /// The owner of the computation was dropped before the producer completed.
    #[error("The computation was abandoned before it completed")]
    Abandoned,

    /// The producer didn't complete within the configured compute timeout.
    #[error("The computation timed out after {0:?}")]
    TimedOut(Duration),
}

impl<E> Clone for ComputeError<E> {
    fn clone(&self) -> Self {
        match self {
            ComputeError::Producer(error) => ComputeError::Producer(error.clone()),
            ComputeError::Abandoned => ComputeError::Abandoned,
            ComputeError::TimedOut(timeout) => ComputeError::TimedOut(*timeout),
        }
    }
}

impl<E> ComputeError<E> {
    /// Returns the error reported by the producer, if the computation failed for this reason.
    pub fn producer_error(&self) -> Option<&E> {
        match self {
            ComputeError::Producer(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// Represents the outcome of a computation as observed by its owner and all joiners.
pub type Outcome<V, E> = Result<V, ComputeError<E>>;

/// Represents a computation which is currently in flight.
struct PendingComputation<V, E> {
    outcome: Shared<oneshot::Receiver<Outcome<V, E>>>,
    waiters: usize,
}

/// Determines what a caller has to do after a miss.
enum Role<V, E> {
    Owner(oneshot::Sender<Outcome<V, E>>),
    Joiner(Shared<oneshot::Receiver<Outcome<V, E>>>),
}

/// Wraps an [ExpiringCache](ExpiringCache) and ensures that at most one computation per key is
/// in flight.
///
/// The type parameter **E** determines the error type of the producers, which defaults to
/// **anyhow::Error**.
pub struct StampedeGuard<K, V, E = anyhow::Error> {
    name: String,
    cache: ExpiringCache<K, V>,
    pending: Mutex<HashMap<K, PendingComputation<V, E>>>,
    compute_timeout: Mutex<Option<Duration>>,
    stampede_prevented: AtomicU64,
    computations: AtomicU64,
    failures: AtomicU64,
    durations: Average,
}

/// Contains a snapshot of the metrics of a guard and its underlying cache.
#[derive(Clone, Debug)]
pub struct GuardStats {
    /// The name of the guard.
    pub name: String,
    /// The counters of the underlying cache.
    pub cache: CacheStats,
    /// The number of calls which joined a computation instead of invoking the producer.
    pub stampede_prevented: u64,
    /// The number of producer invocations.
    pub computations: u64,
    /// The number of producer invocations which failed, timed out or were abandoned.
    pub failures: u64,
    /// The number of computations currently in flight.
    pub in_flight: usize,
    /// The sliding average of the producer durations in microseconds.
    pub average_duration: i32,
}

impl fmt::Display for GuardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Guard", self.name)?;
        write!(f, "{}", self.cache)?;
        writeln!(f, "{:<30} {:>20}", "Computations", self.computations)?;
        writeln!(f, "{:<30} {:>20}", "Failures", self.failures)?;
        writeln!(f, "{:<30} {:>20}", "In Flight", self.in_flight)?;
        writeln!(f, "{:<30} {:>20}", "Stampedes Prevented", self.stampede_prevented)?;
        writeln!(
            f,
            "{:<30} {:>20}",
            "Avg. Duration",
            format_short_duration(self.average_duration)
        )
    }
}

impl<K, V, E> StampedeGuard<K, V, E>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    /// Creates a new guard with the given name which stores its values in the given cache.
    pub fn new(name: impl Into<String>, cache: ExpiringCache<K, V>) -> Self {
        StampedeGuard {
            name: name.into(),
            cache,
            pending: Mutex::new(HashMap::new()),
            compute_timeout: Mutex::new(None),
            stampede_prevented: AtomicU64::new(0),
            computations: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            durations: Average::new(),
        }
    }

    /// Creates a new guard whose cache holds up to
    /// [DEFAULT_MAX_ENTRIES](crate::cache::DEFAULT_MAX_ENTRIES) entries with the given TTL.
    pub fn with_ttl(name: impl Into<String>, ttl: Duration) -> Self {
        StampedeGuard::new(name, ExpiringCache::with_ttl(ttl))
    }

    /// Returns the name of this guard.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Provides access to the underlying cache, e.g. to change its capacity or TTL.
    pub fn cache(&self) -> &ExpiringCache<K, V> {
        &self.cache
    }

    /// Returns the deadline applied to each producer invocation.
    pub fn compute_timeout(&self) -> Option<Duration> {
        *self.compute_timeout.lock()
    }

    /// Specifies a deadline for each producer invocation or removes it by passing **None**.
    pub fn set_compute_timeout(&self, timeout: Option<Duration>) {
        *self.compute_timeout.lock() = timeout;
    }

    /// Applies new settings to this guard and its cache.
    ///
    /// Shrinking the cache evicts the oldest entries right away, whereas a new TTL only affects
    /// entries stored from now on. Computations in flight keep their deadline.
    pub fn reconfigure(
        &self,
        max_entries: usize,
        ttl: Duration,
        compute_timeout: Option<Duration>,
    ) {
        self.cache.set_capacity(max_entries);
        self.cache.set_ttl(ttl);
        self.set_compute_timeout(compute_timeout);
    }

    /// Returns the cached value for the given key without ever computing it.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cache.get(key)
    }

    /// Removes the cached value for the given key.
    ///
    /// Note that a computation which is currently in flight isn't affected and will still store
    /// its result once completed.
    pub fn invalidate(&self, key: &K) {
        self.cache.invalidate(key);
    }

    /// Returns the number of computations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Returns a snapshot of the metrics of this guard.
    pub fn stats(&self) -> GuardStats {
        GuardStats {
            name: self.name.clone(),
            cache: self.cache.stats(),
            stampede_prevented: self.stampede_prevented.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            average_duration: self.durations.avg(),
        }
    }

    /// Resets the counters of this guard and its cache.
    ///
    /// The sliding average of the producer durations is kept.
    pub fn reset_stats(&self) {
        self.cache.reset_stats();
        self.stampede_prevented.store(0, Ordering::Relaxed);
        self.computations.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Delivers the outcome to all joiners and removes the pending computation.
    ///
    /// Both happen while holding the lock, so that any later caller either finds the result in
    /// the cache or starts a new computation.
    fn finish(&self, key: &K, sender: oneshot::Sender<Outcome<V, E>>, outcome: Outcome<V, E>) {
        let mut pending = self.pending.lock();
        let waiters = pending
            .remove(key)
            .map(|computation| computation.waiters)
            .unwrap_or(0);
        let _ = sender.send(outcome);
        std::mem::drop(pending);

        if waiters > 0 {
            log::debug!(
                "{}: Completed the computation of {:?} for {} joiners.",
                self.name,
                key,
                waiters
            );
        }
    }
}

impl<K, V, E> StampedeGuard<K, V, E>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
    E: fmt::Display,
{
    /// Returns the value for the given key, invoking the producer if it isn't cached.
    ///
    /// The result is stored using the default TTL of the underlying cache. See
    /// [get_or_compute_with_ttl](StampedeGuard::get_or_compute_with_ttl) for details.
    pub async fn get_or_compute<F, Fut>(&self, key: K, producer: F) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let ttl = self.cache.ttl();
        self.get_or_compute_with_ttl(key, ttl, producer).await
    }

    /// Returns the value for the given key, invoking the producer if it isn't cached.
    ///
    /// If the value is neither cached nor being computed, the caller becomes the owner of a new
    /// computation and invokes the producer. A successful result is stored with the given TTL.
    /// If another computation for the same key is already in flight, the caller waits for its
    /// outcome and the producer is dropped without being invoked.
    ///
    /// All callers of a computation observe the same outcome. Errors are never cached.
    pub async fn get_or_compute_with_ttl<F, Fut>(
        &self,
        key: K,
        ttl: Duration,
        producer: F,
    ) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.cache.get(&key) {
            return Ok(value);
        }

        let role = {
            let mut pending = self.pending.lock();

            // A computation might have completed since our lookup above...
            if let Some(value) = self.cache.recheck(&key) {
                return Ok(value);
            }

            match pending.get_mut(&key) {
                Some(computation) => {
                    computation.waiters += 1;
                    Role::Joiner(computation.outcome.clone())
                }
                None => {
                    let (sender, receiver) = oneshot::channel();
                    let _ = pending.insert(
                        key.clone(),
                        PendingComputation {
                            outcome: receiver.shared(),
                            waiters: 0,
                        },
                    );
                    Role::Owner(sender)
                }
            }
        };

        match role {
            Role::Joiner(outcome) => {
                let _ = self.stampede_prevented.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: Joining the computation of {:?}...", self.name, key);

                outcome
                    .await
                    .unwrap_or_else(|_| Err(ComputeError::Abandoned))
            }
            Role::Owner(sender) => {
                let completion = Completion {
                    guard: self,
                    key,
                    sender: Some(sender),
                };
                self.compute(completion, ttl, producer).await
            }
        }
    }

    async fn compute<F, Fut>(
        &self,
        completion: Completion<'_, K, V, E>,
        ttl: Duration,
        producer: F,
    ) -> Outcome<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let _ = self.computations.fetch_add(1, Ordering::Relaxed);
        let started = tokio::time::Instant::now();

        let outcome = match self.compute_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, producer()).await {
                Ok(result) => result.map_err(|error| ComputeError::Producer(Arc::new(error))),
                Err(_) => Err(ComputeError::TimedOut(timeout)),
            },
            None => producer()
                .await
                .map_err(|error| ComputeError::Producer(Arc::new(error))),
        };

        self.durations.record(started.elapsed());

        match &outcome {
            Ok(value) => self
                .cache
                .put_with_ttl(completion.key.clone(), value.clone(), ttl),
            Err(error) => {
                let _ = self.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "{}: Computing {:?} failed: {}",
                    self.name,
                    completion.key,
                    error
                );
            }
        }

        completion.complete(outcome.clone());
        outcome
    }
}

/// Tears down a pending computation once its owner is done or dropped.
struct Completion<'a, K, V, E>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    guard: &'a StampedeGuard<K, V, E>,
    key: K,
    sender: Option<oneshot::Sender<Outcome<V, E>>>,
}

impl<'a, K, V, E> Completion<'a, K, V, E>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn complete(mut self, outcome: Outcome<V, E>) {
        if let Some(sender) = self.sender.take() {
            self.guard.finish(&self.key, sender, outcome);
        }
    }
}

impl<'a, K, V, E> Drop for Completion<'a, K, V, E>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = self.guard.failures.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "{}: The computation of {:?} was abandoned.",
                self.guard.name,
                self.key
            );
            self.guard
                .finish(&self.key, sender, Err(ComputeError::Abandoned));
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::guard::{ComputeError, StampedeGuard};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn guard() -> StampedeGuard<String, String> {
        StampedeGuard::with_ttl("test", Duration::from_secs(60))
    }

    #[test]
    fn concurrent_misses_invoke_the_producer_once() {
        crate::testing::test_async(async {
            let guard = guard();
            let invocations = AtomicUsize::new(0);

            let calls = (0..20).map(|_| {
                guard.get_or_compute("look-1".to_owned(), || async {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok("denim".to_owned())
                })
            });
            let results = futures::future::join_all(calls).await;

            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            for result in results {
                assert_eq!(result.unwrap(), "denim");
            }

            let stats = guard.stats();
            assert_eq!(stats.computations, 1);
            assert_eq!(stats.stampede_prevented, 19);
            assert_eq!(stats.in_flight, 0);
            assert_eq!(guard.peek(&"look-1".to_owned()).as_deref(), Some("denim"));
        });
    }

    #[test]
    fn two_concurrent_calls_share_one_result() {
        crate::testing::test_async(async {
            let guard = guard();
            let producer = || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok("result-42".to_owned())
            };

            let (first, second) = tokio::join!(
                guard.get_or_compute("img123".to_owned(), producer),
                guard.get_or_compute("img123".to_owned(), producer)
            );

            assert_eq!(first.unwrap(), "result-42");
            assert_eq!(second.unwrap(), "result-42");
            assert_eq!(guard.stats().stampede_prevented, 1);
        });
    }

    #[test]
    fn all_waiters_observe_the_same_error() {
        crate::testing::test_async(async {
            let guard = guard();
            let invocations = AtomicUsize::new(0);

            let calls = (0..5).map(|_| {
                guard.get_or_compute("look-1".to_owned(), || async {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(anyhow::anyhow!("upstream unavailable"))
                })
            });
            let results = futures::future::join_all(calls).await;
            assert_eq!(invocations.load(Ordering::SeqCst), 1);

            let errors: Vec<_> = results
                .into_iter()
                .map(|result| match result {
                    Err(ComputeError::Producer(error)) => error,
                    _ => panic!("Expected a producer error"),
                })
                .collect();
            for error in &errors {
                assert!(Arc::ptr_eq(error, &errors[0]));
                assert_eq!(error.to_string(), "upstream unavailable");
            }
        });
    }

    #[test]
    fn failures_are_not_cached() {
        crate::testing::test_async(async {
            let guard = guard();

            let result = guard
                .get_or_compute("look-1".to_owned(), || async {
                    Err(anyhow::anyhow!("upstream unavailable"))
                })
                .await;
            assert!(result.unwrap_err().producer_error().is_some());
            assert_eq!(guard.peek(&"look-1".to_owned()), None);
            assert_eq!(guard.in_flight(), 0);

            let result = guard
                .get_or_compute("look-1".to_owned(), || async { Ok("linen".to_owned()) })
                .await;
            assert_eq!(result.unwrap(), "linen");

            let stats = guard.stats();
            assert_eq!(stats.computations, 2);
            assert_eq!(stats.failures, 1);
        });
    }

    #[test]
    fn an_abandoned_computation_is_torn_down() {
        crate::testing::test_async(async {
            let guard = guard();

            let owner = guard.get_or_compute("look-1".to_owned(), || async {
                futures::future::pending::<anyhow::Result<String>>().await
            });
            let joiner = guard.get_or_compute("look-1".to_owned(), || async {
                Ok("never computed".to_owned())
            });

            let (owner_result, joiner_result) = tokio::join!(
                tokio::time::timeout(Duration::from_millis(50), owner),
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    joiner.await
                }
            );

            assert!(owner_result.is_err());
            assert!(matches!(joiner_result, Err(ComputeError::Abandoned)));
            assert_eq!(guard.in_flight(), 0);

            // The next call starts a new computation...
            let result = guard
                .get_or_compute("look-1".to_owned(), || async { Ok("wool".to_owned()) })
                .await;
            assert_eq!(result.unwrap(), "wool");
        });
    }

    #[test]
    fn slow_producers_time_out() {
        crate::testing::test_async(async {
            let guard = guard();
            guard.set_compute_timeout(Some(Duration::from_millis(20)));

            let result = guard
                .get_or_compute("look-1".to_owned(), || async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("too late".to_owned())
                })
                .await;

            assert!(matches!(result, Err(ComputeError::TimedOut(_))));
            assert_eq!(guard.peek(&"look-1".to_owned()), None);
            assert_eq!(guard.in_flight(), 0);
            assert_eq!(guard.stats().failures, 1);
        });
    }

    #[test]
    fn invalidated_values_are_recomputed() {
        crate::testing::test_async(async {
            let guard = guard();
            let invocations = AtomicUsize::new(0);
            let producer = || async {
                Ok(format!("v{}", invocations.fetch_add(1, Ordering::SeqCst)))
            };

            assert_eq!(guard.get_or_compute("a".to_owned(), producer).await.unwrap(), "v0");
            assert_eq!(guard.get_or_compute("a".to_owned(), producer).await.unwrap(), "v0");

            guard.invalidate(&"a".to_owned());
            assert_eq!(guard.peek(&"a".to_owned()), None);
            assert_eq!(guard.get_or_compute("a".to_owned(), producer).await.unwrap(), "v1");
        });
    }

    #[test]
    fn reconfiguring_shrinks_the_cache() {
        let guard = guard();
        for i in 0..5 {
            guard.cache().put(format!("look-{}", i), i.to_string());
        }

        guard.reconfigure(2, Duration::from_secs(5), Some(Duration::from_secs(1)));
        assert_eq!(guard.cache().len(), 2);
        assert_eq!(guard.cache().ttl(), Duration::from_secs(5));
        assert_eq!(guard.compute_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(guard.peek(&"look-4".to_owned()).as_deref(), Some("4"));
    }

    #[test]
    fn stats_are_rendered_as_table() {
        let guard = guard();
        let output = guard.stats().to_string();
        assert!(output.contains("Stampedes Prevented"));
        assert!(output.contains("Hit Rate"));

        guard.reset_stats();
        assert_eq!(guard.stats().computations, 0);
    }

    #[test]
    fn concurrent_misses_across_threads_invoke_the_producer_once() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let guard: Arc<StampedeGuard<String, usize>> =
                Arc::new(StampedeGuard::with_ttl("stress", Duration::from_secs(60)));
            let invocations = Arc::new(AtomicUsize::new(0));

            let mut tasks = Vec::new();
            for _ in 0..64 {
                let guard = guard.clone();
                let invocations = invocations.clone();
                tasks.push(tokio::spawn(async move {
                    guard
                        .get_or_compute("hot-key".to_owned(), || async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok(invocations.fetch_add(1, Ordering::SeqCst))
                        })
                        .await
                }));
            }

            for task in tasks {
                assert_eq!(task.await.unwrap().unwrap(), 0);
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(guard.in_flight(), 0);
        });
    }
}
