//! Combines rate limiting and stampede guarded caching into a single entry point.
//!
//! Each inbound request first passes the [RateLimiter](RateLimiter). A denied request is rejected
//! right away without touching the cache. A permitted request is then served via
//! [StampedeGuard::get_or_compute](StampedeGuard::get_or_compute) using the fingerprint derived
//! from the request.
//!
//! # Examples
//!
//! ```
//! # use dogpile::admission::{Gate, Rejection};
//! # use dogpile::guard::StampedeGuard;
//! # use dogpile::limiter::RateLimiter;
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let gate: Gate<String> = Gate::new(
//!     Arc::new(RateLimiter::new(1, Duration::from_secs(60))),
//!     Arc::new(StampedeGuard::with_ttl("suggestions", Duration::from_secs(300))),
//! );
//!
//! let suggestion = gate
//!     .serve("user-1", "casual-summer".to_owned(), || async { Ok("linen shirt".to_owned()) })
//!     .await
//!     .unwrap();
//! assert_eq!(suggestion, "linen shirt");
//!
//! // The quota of "user-1" is used up...
//! let result = gate
//!     .serve("user-1", "casual-summer".to_owned(), || async { Ok("linen shirt".to_owned()) })
//!     .await;
//! assert!(matches!(result, Err(Rejection::TooManyRequests { .. })));
//! # });
//! ```
use std::fmt;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use crate::guard::{ComputeError, StampedeGuard};
use crate::limiter::{Admission, RateLimiter};

/// Describes why a request wasn't served.
#[derive(thiserror::Error, Debug)]
pub enum Rejection<E> {
    /// The rate limit of the identity has been reached.
    #[error("Too many requests, retry after {retry_after:?}")]
    TooManyRequests {
        /// The time until the identity is permitted to send requests again.
        retry_after: Duration,
    },

    /// The value couldn't be computed.
    #[error("{0}")]
    Failed(ComputeError<E>),
}

impl<E> From<ComputeError<E>> for Rejection<E> {
    fn from(error: ComputeError<E>) -> Self {
        Rejection::Failed(error)
    }
}

/// Admits requests via a rate limiter and serves them via a stampede guarded cache.
pub struct Gate<V, E = anyhow::Error, K = String> {
    limiter: Arc<RateLimiter>,
    guard: Arc<StampedeGuard<K, V, E>>,
}

impl<V, E, K> Clone for Gate<V, E, K> {
    fn clone(&self) -> Self {
        Gate {
            limiter: self.limiter.clone(),
            guard: self.guard.clone(),
        }
    }
}

impl<V, E, K> Gate<V, E, K>
where
    K: Hash + Eq + Clone + Debug,
    V: Clone,
{
    /// Creates a new gate using the given limiter and guard.
    pub fn new(limiter: Arc<RateLimiter>, guard: Arc<StampedeGuard<K, V, E>>) -> Self {
        Gate { limiter, guard }
    }

    /// Provides access to the underlying limiter.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Provides access to the underlying guard.
    pub fn guard(&self) -> &Arc<StampedeGuard<K, V, E>> {
        &self.guard
    }

    /// Serves a request of the given identity.
    ///
    /// If the identity exceeded its rate limit, the request is rejected and neither the cache
    /// nor the producer is consulted. Otherwise the value for the given fingerprint is obtained
    /// from the cache or computed via the given producer.
    pub async fn serve<F, Fut>(
        &self,
        identity: &str,
        fingerprint: K,
        producer: F,
    ) -> Result<V, Rejection<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: fmt::Display,
    {
        if let Admission::Denied { retry_after } = self.limiter.check(identity) {
            return Err(Rejection::TooManyRequests { retry_after });
        }

        Ok(self.guard.get_or_compute(fingerprint, producer).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::admission::{Gate, Rejection};
    use crate::guard::{ComputeError, StampedeGuard};
    use crate::limiter::RateLimiter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn gate(limit: u64) -> Gate<String> {
        Gate::new(
            Arc::new(RateLimiter::new(limit, Duration::from_secs(60))),
            Arc::new(StampedeGuard::with_ttl("test", Duration::from_secs(60))),
        )
    }

    #[test]
    fn denied_requests_never_reach_the_producer() {
        crate::testing::test_async(async {
            let gate = gate(0);
            let invocations = AtomicUsize::new(0);

            let result = gate
                .serve("user-1", "look-1".to_owned(), || async {
                    let _ = invocations.fetch_add(1, Ordering::SeqCst);
                    Ok("denim".to_owned())
                })
                .await;

            match result {
                Err(Rejection::TooManyRequests { retry_after }) => {
                    assert_eq!(retry_after, Duration::from_secs(60))
                }
                _ => panic!("Expected the request to be rejected"),
            }
            assert_eq!(invocations.load(Ordering::SeqCst), 0);
            assert_eq!(gate.guard().stats().cache.misses, 0);
            assert_eq!(gate.limiter().stats().denied, 1);
        });
    }

    #[test]
    fn permitted_requests_are_served_from_the_cache() {
        crate::testing::test_async(async {
            let gate = gate(10);
            let invocations = AtomicUsize::new(0);
            let producer = || async {
                let _ = invocations.fetch_add(1, Ordering::SeqCst);
                Ok("denim".to_owned())
            };

            for identity in ["user-1", "user-2", "user-1"] {
                let value = gate
                    .serve(identity, "look-1".to_owned(), producer)
                    .await
                    .unwrap();
                assert_eq!(value, "denim");
            }

            assert_eq!(invocations.load(Ordering::SeqCst), 1);
            assert_eq!(gate.guard().stats().cache.hits, 2);
        });
    }

    #[test]
    fn producer_errors_are_passed_through() {
        crate::testing::test_async(async {
            let gate = gate(10);
            let result = gate
                .serve("user-1", "look-1".to_owned(), || async {
                    Err(anyhow::anyhow!("model unavailable"))
                })
                .await;

            match result {
                Err(Rejection::Failed(ComputeError::Producer(error))) => {
                    assert_eq!(error.to_string(), "model unavailable")
                }
                _ => panic!("Expected a producer error"),
            }
        });
    }
}
