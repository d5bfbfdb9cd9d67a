//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. Note that we observe this file for changes and reload it once a change is detected.
//! Therefore each user of the config should attach itself to the
//! [Config::notifier](Config::notifier) and re-process the config once a change message is
//! received. This is how caches and the rate limiter pick up new TTLs, sizes and quotas without
//! a restart.
//!
//! Note that the **Config** struct can be obtained from the **Platform** once and then kept
//! around. However, the handle returned by **Config::current()** should not be stored, as it
//! will not be updated once a new config has been loaded.
//!
//! # Examples
//!
//! ```
//! # use dogpile::config::Config;
//! let config = Config::new("settings.yml");
//! config.load_from_string("
//! limiter:
//!     window: 1m
//!     limit: 60
//! ", None).unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.query("limiter.limit").as_i64(), Some(60));
//! assert_eq!(handle.query("limiter.window").as_str(), Some("1m"));
//! assert!(handle.query("limiter.unknown").is_badvalue());
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::fmt::parse_duration;
use crate::platform::Platform;

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The actual message being broadcast
/// can and should be ignored. All that matters is, once a message has been received, the config
/// was changed and needs to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
///
/// Note that this handle should not be stored or kept around for long, as it will not be updated
/// if the underlying config changed.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// Within docker, the file might be presented as volume. Therefore we check that it is a
    /// file, as an unmounted volume shows up as directory.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Forces the config to read the underlying file.
    ///
    /// Note that this is normally called by the framework and should not be invoked manually.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!("Config file is an unmounted volume - skipping config load.");
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Validates the given config and writes it into the config file.
    ///
    /// The running system picks it up via the change monitor installed by [install](install).
    /// Invalid YAML is rejected and never written to disk.
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        let _ = YamlLoader::load_from_str(config).context("Cannot parse config data")?;
        tokio::fs::write(&self.filename, config)
            .await
            .context("Failed to write to config file!")?;
        log::info!("Config has been updated successfully!");

        Ok(())
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk. A malformed document is rejected and the previous config stays
    /// active.
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data)
            .with_context(|| format!("Cannot parse config file {}", &self.filename))?;

        let doc = match docs.drain(..).next() {
            Some(doc @ Yaml::Hash(_)) => doc,
            _ => Yaml::Hash(Default::default()),
        };

        self.config.store(Arc::new((doc, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the currently loaded configuration document.
    pub fn root(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dotted path like `caches.results.ttl` against the current document.
    ///
    /// Returns **Yaml::BadValue** if any part of the path is missing.
    pub fn query(&self, query: impl AsRef<str>) -> &Yaml {
        query
            .as_ref()
            .split('.')
            .fold(self.root(), |node, key| &node[key])
    }
}

/// Reads an optional positive integer from the given config node.
///
/// A missing value yields **None**, everything which isn't a positive integer is rejected.
pub fn positive_int(node: &Yaml, name: &str) -> anyhow::Result<Option<u64>> {
    match node {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(value) if *value > 0 => Ok(Some(*value as u64)),
        other => Err(anyhow::anyhow!(
            "'{}' has to be a positive integer but was {:?}",
            name,
            other
        )),
    }
}

/// Reads an optional duration (like `15m` or `250ms`) from the given config node.
///
/// A missing value yields **None**. Plain integers are treated as milliseconds.
pub fn duration(node: &Yaml, name: &str) -> anyhow::Result<Option<Duration>> {
    match node {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::String(value) => parse_duration(value)
            .with_context(|| format!("Failed to parse '{}'", name))
            .map(Some),
        Yaml::Integer(value) if *value >= 0 => Ok(Some(Duration::from_millis(*value as u64))),
        other => Err(anyhow::anyhow!(
            "'{}' has to be a duration but was {:?}",
            name,
            other
        )),
    }
}

/// Creates an installs a **Config** for the given platform.
///
/// This will read its contents from **config/settings.yml** and also install a change listener
/// for this file. Note that this listener will only watch the "last modified" date of the file
/// and will not perform a structural comparison. Therefore it is the duty of each config user to
/// gracefully handle partial config changes.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **Config** part is disabled.
pub async fn install(platform: Arc<Platform>) {
    let path = Path::new("config");
    if let Err(error) = tokio::fs::create_dir_all(path).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    let config = Arc::new(Config::new("config/settings.yml"));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config);
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    let mut shutdown = platform.shutdown_signal();
    platform.spawn("config-monitor", async move {
        let mut ticks = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = ticks.tick() => {}
            }

            // Reload if a file is present and newer than the one previously loaded (or if none
            // has been loaded so far)...
            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}
