//! Dogpile is a library which protects a backend from redundant upstream work and overload.
//!
//! # Introduction
//! A fashion recommendation backend spends most of its time waiting for external services:
//! language models suggest outfits, image generators render looks, search APIs find matching
//! products. Each of these calls is slow and expensive, and quite often many requests ask for the
//! very same thing at the very same time (think of a popular look which just got shared).
//!
//! **Dogpile** provides the layer which sits in front of these calls:
//! * an **admission control** which rejects clients that exceed their request quota before any
//!   work is done,
//! * a **time bounded cache** which keeps computed results for a while and never grows beyond a
//!   given number of entries,
//! * a **stampede guard** which ensures that concurrent misses for the same key result in exactly
//!   one upstream call whose outcome is shared by all waiting requests.
//!
//! # Features
//! * **Hard memory bounds**: Each cache holds a fixed maximal number of entries. Once this is
//!   exceeded, the oldest entries are evicted in insertion order.
//! * **At most one computation per key**: Concurrent misses are collapsed into a single producer
//!   invocation. Errors are handed to all waiters but never cached, so that the next request
//!   retries.
//! * **Atomic quota enforcement**: The rate limiter evaluates each request within a single
//!   critical section, so that concurrent requests can never overdraw a quota.
//! * **Reload-aware config facility** which permits to change TTLs, cache sizes and quotas during
//!   operation. Therefore, no restart is ever required.
//! * **Supervised background work**: Purging expired entries, sweeping idle rate limit buckets and
//!   watching the config file all happen in tasks owned by the [Platform](platform::Platform).
//!   Failures of these tasks are logged and all of them are joined on shutdown.
//!
//! # Modules
//! * [cache]: The size constrained [ExpiringCache](cache::ExpiringCache).
//! * [guard]: The [StampedeGuard](guard::StampedeGuard) which provides "get or compute"
//!   semantics on top of a cache.
//! * [limiter]: The window based [RateLimiter](limiter::RateLimiter).
//! * [admission]: The [Gate](admission::Gate) which combines limiter and guard as each request
//!   handler would.
//!
//! # Examples
//! A short example on how to initialize the library can be found here [Builder](builder::Builder).
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod admission;
pub mod average;
pub mod builder;
pub mod cache;
pub mod config;
pub mod fmt;
pub mod guard;
pub mod limiter;
pub mod platform;
pub mod signals;

/// Contains the version of the Dogpile library.
pub const DOGPILE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Dogpile build being used.
pub const DOGPILE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests might build several platforms, but a logger can only be installed once...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            eprintln!("Failed to initialize logging system: {}", error);
        }
    });
}
