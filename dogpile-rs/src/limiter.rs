//! Provides a window based rate limiter which is consulted before any request is processed.
//!
//! Each identity (most probably a client or user id) owns a bucket which counts the requests
//! within the current window. Once the limit is reached, further requests are denied until the
//! window has elapsed. Note that a denied request doesn't count against the quota. Buckets are
//! created on demand and removed by [sweep_idle](RateLimiter::sweep_idle) once the identity
//! hasn't been seen for a while.
//!
//! Evaluating a request happens entirely while holding the lock of the limiter and never
//! suspends. Therefore two concurrent requests can never both observe the last free slot.
//!
//! The limiter can be configured via the `limiter` section of the system config:
//!
//! ```yaml
//! limiter:
//!     # Specifies the length of a window.
//!     window: 1m
//!     # Specifies the number of requests permitted per identity and window.
//!     limit: 60
//!     # Specifies after which period of inactivity a bucket is removed.
//!     idle_timeout: 10m
//!     # Specifies how often idle buckets are removed.
//!     sweep_interval: 1m
//! ```
//!
//! # Examples
//!
//! ```
//! # use dogpile::limiter::{Admission, RateLimiter};
//! # use std::time::Duration;
//! let limiter = RateLimiter::new(2, Duration::from_secs(60));
//!
//! assert!(limiter.allow("stylist-7"));
//! assert!(matches!(limiter.check("stylist-7"), Admission::Allowed { remaining: 0 }));
//! assert!(!limiter.allow("stylist-7"));
//!
//! // Other identities have their own quota...
//! assert!(limiter.allow("stylist-8"));
//!
//! assert_eq!(limiter.stats().allowed, 3);
//! assert_eq!(limiter.stats().denied, 1);
//! ```
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use yaml_rust::Yaml;

use crate::config::{duration, positive_int, Config};
use crate::fmt::format_duration;
use crate::platform::Platform;

/// Describes the result of evaluating a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The request is permitted.
    Allowed {
        /// The number of requests still permitted in the current window.
        remaining: u64,
    },
    /// The request has to be rejected.
    Denied {
        /// The time until the current window elapses and requests are permitted again.
        retry_after: Duration,
    },
}

impl Admission {
    /// Determines if the request is permitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed { .. })
    }
}

struct RateBucket {
    count: u64,
    window_start: Instant,
    last_seen: Instant,
}

struct Inner {
    limit: u64,
    window: Duration,
    buckets: HashMap<String, RateBucket>,
}

/// Enforces a maximal number of requests per identity and window.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    allowed: AtomicU64,
    denied: AtomicU64,
}

/// Contains a snapshot of the metrics and settings of a limiter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterStats {
    /// The number of permitted requests.
    pub allowed: u64,
    /// The number of rejected requests.
    pub denied: u64,
    /// The number of identities which currently own a bucket.
    pub identities: usize,
    /// The number of requests permitted per window.
    pub limit: u64,
    /// The length of a window.
    pub window: Duration,
}

impl fmt::Display for LimiterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Limit", self.limit)?;
        writeln!(f, "{:<30} {:>20}", "Window", format_duration(self.window))?;
        writeln!(f, "{:<30} {:>20}", "Identities", self.identities)?;
        writeln!(f, "{:<30} {:>20}", "Allowed", self.allowed)?;
        writeln!(f, "{:<30} {:>20}", "Denied", self.denied)
    }
}

impl RateLimiter {
    /// Creates a new limiter which permits **limit** requests per identity and window.
    pub fn new(limit: u64, window: Duration) -> Self {
        RateLimiter {
            inner: Mutex::new(Inner {
                limit,
                window,
                buckets: HashMap::new(),
            }),
            allowed: AtomicU64::new(0),
            denied: AtomicU64::new(0),
        }
    }

    /// Determines if a request of the given identity is permitted and records it if so.
    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity).is_allowed()
    }

    /// Evaluates a request of the given identity.
    ///
    /// If the window of the identity has elapsed, its bucket is reset first. A permitted request
    /// is counted, a denied one isn't.
    pub fn check(&self, identity: &str) -> Admission {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let bucket = inner
            .buckets
            .entry(identity.to_owned())
            .or_insert_with(|| RateBucket {
                count: 0,
                window_start: now,
                last_seen: now,
            });
        bucket.last_seen = now;

        if now.duration_since(bucket.window_start) >= inner.window {
            bucket.count = 0;
            bucket.window_start = now;
        }

        if bucket.count >= inner.limit {
            let retry_after = inner
                .window
                .saturating_sub(now.duration_since(bucket.window_start));
            std::mem::drop(guard);

            let _ = self.denied.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "Denying a request of {} (retry after {}).",
                identity,
                format_duration(retry_after)
            );
            Admission::Denied { retry_after }
        } else {
            bucket.count += 1;
            let remaining = inner.limit - bucket.count;
            std::mem::drop(guard);

            let _ = self.allowed.fetch_add(1, Ordering::Relaxed);
            Admission::Allowed { remaining }
        }
    }

    /// Removes the buckets of all identities which haven't been seen for **idle_after**.
    ///
    /// A bucket whose window hasn't elapsed yet is always kept, so that sweeping never resets a
    /// quota early. Returns the number of removed buckets.
    pub fn sweep_idle(&self, idle_after: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let window = inner.window;
        let before = inner.buckets.len();

        inner.buckets.retain(|_, bucket| {
            now.duration_since(bucket.last_seen) < idle_after
                || now.duration_since(bucket.window_start) < window
        });

        before - inner.buckets.len()
    }

    /// Changes the limit and window length.
    ///
    /// Existing buckets keep their counts. The new values apply to the next request evaluated.
    pub fn reconfigure(&self, limit: u64, window: Duration) {
        let mut inner = self.inner.lock();
        inner.limit = limit;
        inner.window = window;
    }

    /// Returns the number of requests permitted per window.
    pub fn limit(&self) -> u64 {
        self.inner.lock().limit
    }

    /// Returns the length of a window.
    pub fn window(&self) -> Duration {
        self.inner.lock().window
    }

    /// Returns the number of identities which currently own a bucket.
    pub fn identities(&self) -> usize {
        self.inner.lock().buckets.len()
    }

    /// Returns a snapshot of the metrics and settings of this limiter.
    pub fn stats(&self) -> LimiterStats {
        let inner = self.inner.lock();
        LimiterStats {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            identities: inner.buckets.len(),
            limit: inner.limit,
            window: inner.window,
        }
    }

    /// Resets the allowed and denied counters.
    pub fn reset_stats(&self) {
        self.allowed.store(0, Ordering::Relaxed);
        self.denied.store(0, Ordering::Relaxed);
    }
}

/// Contains the settings of the limiter as given in the config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimiterSettings {
    /// The length of a window.
    pub window: Duration,
    /// The number of requests permitted per identity and window.
    pub limit: u64,
    /// The period of inactivity after which a bucket is removed.
    pub idle_timeout: Duration,
    /// The interval in which idle buckets are removed.
    pub sweep_interval: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        LimiterSettings {
            window: Duration::from_secs(60),
            limit: 60,
            idle_timeout: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl LimiterSettings {
    /// Parses the settings from the given config section.
    ///
    /// Missing values are filled up with their defaults, malformed ones are rejected.
    pub fn from_config(node: &Yaml) -> anyhow::Result<Self> {
        let defaults = LimiterSettings::default();

        let window = duration(&node["window"], "window")?.unwrap_or(defaults.window);
        if window.is_zero() {
            return Err(anyhow::anyhow!("'window' must not be zero"));
        }

        let sweep_interval =
            duration(&node["sweep_interval"], "sweep_interval")?.unwrap_or(defaults.sweep_interval);
        if sweep_interval.is_zero() {
            return Err(anyhow::anyhow!("'sweep_interval' must not be zero"));
        }

        Ok(LimiterSettings {
            window,
            limit: positive_int(&node["limit"], "limit")?.unwrap_or(defaults.limit),
            idle_timeout: duration(&node["idle_timeout"], "idle_timeout")?
                .unwrap_or(defaults.idle_timeout),
            sweep_interval,
        })
    }
}

/// Creates and registers the [RateLimiter](RateLimiter) for the given platform.
///
/// The settings are read from the `limiter` section of the system config (if a
/// [Config](Config) is installed). A background task re-applies them once the config changes
/// and periodically removes idle buckets.
///
/// Note that this is called by the [Builder](crate::builder::Builder) if the limiter is enabled.
///
/// # Panics
/// Panics if invoked outside of a tokio runtime.
pub fn install(platform: &Arc<Platform>) -> Arc<RateLimiter> {
    let config = platform.find::<Config>();
    let settings = match &config {
        Some(config) => load_settings(config, LimiterSettings::default()),
        None => LimiterSettings::default(),
    };

    log::info!(
        "Installing rate limiter ({} requests per {})...",
        settings.limit,
        format_duration(settings.window)
    );
    let limiter = Arc::new(RateLimiter::new(settings.limit, settings.window));
    platform.register::<RateLimiter>(limiter.clone());

    run_maintenance(platform, config, limiter.clone(), settings);

    limiter
}

/// Reads the limiter settings from the given config.
///
/// In case of an invalid config, the current settings are kept.
fn load_settings(config: &Config, current: LimiterSettings) -> LimiterSettings {
    let handle = config.current();
    let node = handle.query("limiter");
    if node.is_badvalue() {
        log::info!("Config does not contain a 'limiter' object. Keeping the current settings.");
        return current;
    }

    match LimiterSettings::from_config(node) {
        Ok(settings) => settings,
        Err(error) => {
            log::error!(
                "Not going to update the rate limiter: {:#}. Keeping the current settings.",
                error
            );
            current
        }
    }
}

fn run_maintenance(
    platform: &Arc<Platform>,
    config: Option<Arc<Config>>,
    limiter: Arc<RateLimiter>,
    mut settings: LimiterSettings,
) {
    let mut config_changed = config.as_ref().map(|config| config.notifier());
    let mut shutdown = platform.shutdown_signal();
    let task_platform = platform.clone();

    platform.spawn("rate-limiter", async move {
        let mut sweep_timer = tokio::time::interval(settings.sweep_interval);

        while task_platform.is_running() {
            tokio::select! {
                _ = shutdown.changed() => {}
                change = next_change(&mut config_changed) => {
                    if let Err(RecvError::Closed) = change {
                        config_changed = None;
                        continue;
                    }

                    if let Some(config) = &config {
                        let updated = load_settings(config, settings.clone());
                        apply(&limiter, &settings, &updated);
                        if updated.sweep_interval != settings.sweep_interval {
                            sweep_timer = tokio::time::interval(updated.sweep_interval);
                        }
                        settings = updated;
                    }
                }
                _ = sweep_timer.tick() => {
                    let removed = limiter.sweep_idle(settings.idle_timeout);
                    if removed > 0 {
                        log::debug!("Removed {} idle rate limit buckets.", removed);
                    }
                }
            }
        }

        Ok(())
    });
}

fn apply(limiter: &RateLimiter, previous: &LimiterSettings, settings: &LimiterSettings) {
    if previous.limit != settings.limit || previous.window != settings.window {
        log::info!(
            "Updating the rate limiter from {} requests per {} to {} requests per {}.",
            previous.limit,
            format_duration(previous.window),
            settings.limit,
            format_duration(settings.window)
        );
        limiter.reconfigure(settings.limit, settings.window);
    }

    if previous.idle_timeout != settings.idle_timeout {
        log::info!(
            "Updating the idle_timeout of the rate limiter from {} to {}.",
            format_duration(previous.idle_timeout),
            format_duration(settings.idle_timeout)
        );
    }
}

async fn next_change(
    notifier: &mut Option<crate::config::ChangeNotifier>,
) -> Result<(), RecvError> {
    match notifier {
        Some(notifier) => notifier.recv().await,
        None => futures::future::pending().await,
    }
}
