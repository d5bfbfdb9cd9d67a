//! Installs a signal handler which terminates the platform on CTRL+C or SIGHUP.
//!
//! Spawns a supervised task which waits for either **CTRL+C** or **SIGHUP** and then invokes
//! [Platform::terminate](crate::platform::Platform::terminate) on the given platform. If the
//! platform is terminated otherwise, the task simply stops.
use std::sync::Arc;

use anyhow::Context;
use tokio::signal::unix::SignalKind;

use crate::platform::Platform;

/// Installs a signal handler for the given platform which awaits either a **CTRL+C** or **SIGHUP**.
///
/// Note that this is automatically called by the [Builder](crate::builder::Builder) unless it is
/// disabled.
///
/// # Panics
/// Panics if invoked outside of a tokio runtime.
pub fn install(platform: &Arc<Platform>) {
    let mut shutdown = platform.shutdown_signal();
    let task_platform = platform.clone();

    platform.spawn("signals", async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup())
            .context("Failed to register a handler for SIGHUP")?;

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
                task_platform.terminate();
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down...");
                task_platform.terminate();
            },
            _ = shutdown.changed() => {}
        }

        Ok(())
    });
}
