//! Creates stampede guarded caches based on the system config.
//!
//! Each cache is described in the `caches` section of the config:
//!
//! ```yaml
//! caches:
//!     recommendations:
//!         # Specifies the max number of entries to store (defaults to 1000).
//!         max_entries: 1000
//!         # Specifies how long an entry stays valid. This is mandatory.
//!         ttl: 5m
//!         # Specifies a deadline for each upstream computation (optional).
//!         compute_timeout: 30s
//!         # Specifies how often expired entries are purged (optional).
//!         purge_interval: 1m
//! ```
//!
//! Once the config changes, the new settings are applied to the running cache. An invalid or
//! missing section will never damage an active cache. Instead, the error is logged and the
//! current settings are kept.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Interval;
use yaml_rust::Yaml;

use crate::cache::{ExpiringCache, DEFAULT_MAX_ENTRIES};
use crate::config::{duration, positive_int, Config};
use crate::fmt::format_duration;
use crate::guard::StampedeGuard;
use crate::platform::Platform;

/// Contains the settings of a single cache as given in the config.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheSettings {
    /// The maximal number of entries to keep.
    pub max_entries: usize,
    /// The time to live of each entry.
    pub ttl: Duration,
    /// The optional deadline of each producer invocation.
    pub compute_timeout: Option<Duration>,
    /// The optional interval in which expired entries are purged.
    pub purge_interval: Option<Duration>,
}

impl CacheSettings {
    /// Parses the settings from the given config section.
    ///
    /// Fails if the section is missing, if no **ttl** is given or if any value is malformed.
    pub fn from_config(node: &Yaml) -> anyhow::Result<Self> {
        if node.is_badvalue() {
            return Err(anyhow::anyhow!("No config section is present"));
        }

        let max_entries = positive_int(&node["max_entries"], "max_entries")?
            .map(|max_entries| max_entries as usize)
            .unwrap_or(DEFAULT_MAX_ENTRIES);
        let ttl =
            duration(&node["ttl"], "ttl")?.ok_or_else(|| anyhow::anyhow!("No 'ttl' was given"))?;

        Ok(CacheSettings {
            max_entries,
            ttl,
            compute_timeout: duration(&node["compute_timeout"], "compute_timeout")?,
            purge_interval: duration(&node["purge_interval"], "purge_interval")?
                .filter(|interval| !interval.is_zero()),
        })
    }

    /// Applies these settings to the given guard and logs every change.
    fn apply<V: Clone, E>(&self, guard: &StampedeGuard<String, V, E>, previous: &CacheSettings) {
        if previous.max_entries != self.max_entries {
            log::info!(
                "Updating the size of {} from {} to {}.",
                guard.name(),
                previous.max_entries,
                self.max_entries
            );
        }

        if previous.ttl != self.ttl {
            log::info!(
                "Updating the ttl of {} from {} to {}.",
                guard.name(),
                format_duration(previous.ttl),
                format_duration(self.ttl)
            );
        }

        if previous.compute_timeout != self.compute_timeout {
            log::info!(
                "Updating the compute_timeout of {} from {} to {}.",
                guard.name(),
                format_optional_duration(previous.compute_timeout),
                format_optional_duration(self.compute_timeout)
            );
        }

        if previous.purge_interval != self.purge_interval {
            log::info!(
                "Updating the purge_interval of {} from {} to {}.",
                guard.name(),
                format_optional_duration(previous.purge_interval),
                format_optional_duration(self.purge_interval)
            );
        }

        guard.reconfigure(self.max_entries, self.ttl, self.compute_timeout);
    }
}

fn format_optional_duration(duration: Option<Duration>) -> String {
    duration
        .map(format_duration)
        .unwrap_or_else(|| "-".to_owned())
}

/// Creates the cache with the given name as described in `caches.<name>` of the system config.
///
/// Next to creating the guarded cache, this spawns a background task on the platform, which
/// applies changed settings once the config is reloaded and purges expired entries
/// periodically (if a **purge_interval** is given).
///
/// Fails if no [Config](Config) is installed or if the config section is missing or invalid.
///
/// # Panics
/// Panics if invoked outside of a tokio runtime.
pub fn install<V, E>(
    platform: &Arc<Platform>,
    name: &str,
) -> anyhow::Result<Arc<StampedeGuard<String, V, E>>>
where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let config = platform
        .find::<Config>()
        .context("Cannot create a cache without a config")?;
    let settings = CacheSettings::from_config(config.current().query(format!("caches.{}", name)))
        .with_context(|| format!("Cannot create cache {}", name))?;

    log::info!(
        "Creating new cache {} (max_entries: {}, ttl: {})...",
        name,
        settings.max_entries,
        format_duration(settings.ttl)
    );
    let guard = Arc::new(StampedeGuard::new(
        name,
        ExpiringCache::new(settings.max_entries, settings.ttl),
    ));
    guard.set_compute_timeout(settings.compute_timeout);

    run_maintenance(platform, config, guard.clone(), settings);

    Ok(guard)
}

fn run_maintenance<V, E>(
    platform: &Arc<Platform>,
    config: Arc<Config>,
    guard: Arc<StampedeGuard<String, V, E>>,
    mut settings: CacheSettings,
) where
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    let mut config_changed = config.notifier();
    let mut shutdown = platform.shutdown_signal();
    let task_platform = platform.clone();

    platform.spawn(format!("cache-{}", guard.name()), async move {
        let mut purge_timer = settings.purge_interval.map(tokio::time::interval);

        while task_platform.is_running() {
            tokio::select! {
                _ = shutdown.changed() => {}
                change = config_changed.recv() => {
                    if let Err(RecvError::Closed) = change {
                        return Ok(());
                    }

                    let updated = update_settings(&guard, &config, settings.clone());
                    if updated.purge_interval != settings.purge_interval {
                        purge_timer = updated.purge_interval.map(tokio::time::interval);
                    }
                    settings = updated;
                }
                _ = next_purge(&mut purge_timer) => {
                    let purged = guard.cache().purge_expired();
                    if purged > 0 {
                        log::debug!("Purged {} expired entries from {}.", purged, guard.name());
                    }
                }
            }
        }

        Ok(())
    });
}

/// Re-reads the settings of the given guard.
///
/// In case of an invalid config, the current settings are kept.
fn update_settings<V: Clone, E>(
    guard: &StampedeGuard<String, V, E>,
    config: &Config,
    current: CacheSettings,
) -> CacheSettings {
    let handle = config.current();
    match CacheSettings::from_config(handle.query(format!("caches.{}", guard.name()))) {
        Ok(settings) => {
            settings.apply(guard, &current);
            settings
        }
        Err(error) => {
            log::error!(
                "Not going to update cache {}: {:#}. Keeping the current settings.",
                guard.name(),
                error
            );
            current
        }
    }
}

async fn next_purge(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            let _ = timer.tick().await;
        }
        None => futures::future::pending().await,
    }
}
