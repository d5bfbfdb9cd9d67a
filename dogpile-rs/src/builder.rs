//! Provides a builder which can be used to setup and initialize the framework.
//!
//! This can be used to create and setup central parts of the framework. As Dogpile provides some
//! optional components, a builder permits to selectively enable or disable them.
//!
//! # Example
//! Setting up the framework with all features enabled:
//! ```no_run
//! # use dogpile::admission::Gate;
//! # use dogpile::builder::Builder;
//! # use dogpile::limiter::RateLimiter;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Enable all features and build the platform...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Create the caches as described in the config...
//!     let suggestions = dogpile::cache::install::<String, anyhow::Error>(&platform, "suggestions")?;
//!     let gate = Gate::new(platform.require::<RateLimiter>(), suggestions);
//!
//!     // Hand the gate to the request handlers here...
//!
//!     // Wait until CTRL-C or SIGHUP terminates the platform...
//!     let mut shutdown = platform.shutdown_signal();
//!     let _ = shutdown.changed().await;
//!     platform.shutdown().await;
//!
//!     Ok(())
//! }
//! ```
use std::sync::Arc;

use crate::platform::Platform;
use crate::{init_logging, DOGPILE_REVISION, DOGPILE_VERSION};

/// Initializes the framework by creating and initializing all core components.
///
/// As Dogpile provides a bunch of components of which some are optional, the actual setup
/// can be configured here. Note that caches are not created by the builder, as each of them
/// has its own value and error type. Use [cache::install](crate::cache::install) once the
/// platform has been built.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    enable_signals: bool,
    setup_config: bool,
    setup_limiter: bool,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            enable_signals: false,
            setup_config: false,
            setup_limiter: false,
        }
    }

    /// Enables all features.
    ///
    /// Note that using this method (and then maybe disabling selected components) is quite
    /// convenient, but be aware that new components which might be added in a library update
    /// will then also be enabled by default. This might or might not be the expected behaviour.
    pub fn enable_all(mut self) -> Self {
        self.setup_logging = true;
        self.enable_signals = true;
        self.setup_config = true;
        self.setup_limiter = true;

        self
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// Using this, we properly initialize **simplelog** to log to stdout. As we intend the
    /// backend to be run in docker containers, this is all that is needed for proper logging.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Installs a signal listener which terminates the framework once **CTRL-C** or **SIGHUP**
    /// is received.
    ///
    /// For more details see: [signals](crate::signals)
    pub fn enable_signals(mut self) -> Self {
        self.enable_signals = true;
        self
    }

    /// Disables installing the signal listener after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_signals(mut self) -> Self {
        self.enable_signals = false;
        self
    }

    /// Installs [config::Config](crate::config::Config) and loads the **settings.yml**.
    ///
    /// For more details see: [config](crate::config)
    pub fn enable_config(mut self) -> Self {
        self.setup_config = true;
        self
    }

    /// Disables setting up a **Config** instance after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_config(mut self) -> Self {
        self.setup_config = false;
        self
    }

    /// Creates and installs a [RateLimiter](crate::limiter::RateLimiter).
    ///
    /// For more details see: [limiter](crate::limiter)
    pub fn enable_limiter(mut self) -> Self {
        self.setup_limiter = true;
        self
    }

    /// Disables setting up a **RateLimiter** after [enable_all()](Builder::enable_all)
    /// has been used.
    pub fn disable_limiter(mut self) -> Self {
        self.setup_limiter = false;
        self
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled components
    /// being registered.
    pub async fn build(self) -> Arc<Platform> {
        let platform = Platform::new();

        if self.setup_logging {
            init_logging();
        }

        log::info!(
            "||. DOGPILE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            DOGPILE_VERSION,
            DOGPILE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.enable_signals {
            crate::signals::install(&platform);
        }

        if self.setup_config {
            crate::config::install(platform.clone()).await;
        }

        if self.setup_limiter {
            let _ = crate::limiter::install(&platform);
        }

        platform
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::limiter::RateLimiter;

    #[test]
    fn only_enabled_components_are_installed() {
        crate::testing::test_async(async {
            let platform = Builder::new().enable_limiter().build().await;
            assert!(platform.find::<RateLimiter>().is_some());
            assert!(platform.find::<Config>().is_none());

            platform.shutdown().await;
            assert_eq!(platform.running_tasks(), 0);
        });
    }
}
