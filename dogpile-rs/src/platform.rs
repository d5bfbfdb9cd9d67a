//! Provides a tiny DI like container which owns all long living components of the system.
//!
//! Caches, the rate limiter and the config are never kept in global statics. Instead they are
//! created during startup (most probably by the [Builder](crate::builder::Builder)), registered
//! here as **Arc<T>** and handed to request handlers explicitly. Once
//! [Platform::terminate](Platform::terminate) is invoked, all services are released, the
//! central **is_running** flag toggles to *false* and the shutdown signal fires, so that all
//! background tasks wind down.
//!
//! Background tasks are never fired and forgotten: [Platform::spawn](Platform::spawn) keeps track
//! of each of them, logs their failures and [Platform::shutdown](Platform::shutdown) joins them.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use dogpile::platform::Platform;
//! struct RecommendationService {
//!     model: &'static str,
//! }
//!
//! struct UnknownService;
//!
//! let platform = Platform::new();
//!
//! // Registers a new service...
//! platform.register::<RecommendationService>(Arc::new(RecommendationService { model: "outfit-v2" }));
//!
//! // Obtains a reference to a previously registered service...
//! assert_eq!(platform.require::<RecommendationService>().model, "outfit-v2");
//!
//! // Unknown services yield an empty optional...
//! assert!(platform.find::<UnknownService>().is_none());
//!
//! // Once terminated, all services are released and the platform is halted...
//! platform.terminate();
//! assert!(platform.find::<RecommendationService>().is_none());
//! assert!(!platform.is_running());
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Represents the receiving end of the shutdown signal.
///
/// The contained value turns **true** once the platform has been terminated.
pub type ShutdownSignal = watch::Receiver<bool>;

/// Provides a container to keep all central services and background tasks in a single place.
pub struct Platform {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    tasks: Mutex<Vec<(String, JoinHandle<anyhow::Result<()>>)>>,
    is_running: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Platform {
    /// Creates a new platform instance.
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Platform {
            services: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(true),
            shutdown,
        })
    }

    /// Registers a new component.
    ///
    /// Registering another component of the same type replaces the previous one.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self.services.lock().insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered service.
    ///
    /// Note, if one knows for certain, that a service will be present,
    /// [Platform::require](Platform::require) can be used.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.services
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered service.
    ///
    /// # Panics
    /// Panics if the requested service isn't available or if the platform is already shutting
    /// down. This is intended to be used while wiring up the system during startup.
    ///
    /// ```should_panic
    /// # use dogpile::platform::Platform;
    /// struct UnknownService;
    ///
    /// let platform = Platform::new();
    /// platform.require::<UnknownService>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            );
        }

        match self.find::<T>() {
            Some(service) => service,
            None => panic!(
                "A required component ({}) was not available in the platform registry!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if the platform is still running or if [Platform::terminate](Platform::terminate)
    /// has already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Obtains a receiver which is notified once the platform is terminated.
    ///
    /// Background loops should `tokio::select!` on `signal.changed()` next to their actual work
    /// so that they stop promptly.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.subscribe()
    }

    /// Spawns a supervised background task.
    ///
    /// The task is expected to return once the platform is terminated. If it fails, the error is
    /// logged right away. The task handle is kept so that [Platform::shutdown](Platform::shutdown)
    /// can await it and report panics.
    ///
    /// # Panics
    /// Panics if invoked outside of a tokio runtime.
    pub fn spawn<F>(&self, name: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => log::debug!("Background task {} has stopped.", task_name),
                Err(error) => log::error!("Background task {} failed: {:#}", task_name, error),
            }
            result
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|(_, handle)| !handle.is_finished());
        tasks.push((name, handle));
    }

    /// Returns the number of supervised background tasks which are still running.
    pub fn running_tasks(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Terminates the platform.
    ///
    /// This will immediately release all services (so that the Dropped handlers run eventually),
    /// toggle the [is_running()](Platform::is_running) flag to **false** and fire the shutdown
    /// signal.
    pub fn terminate(&self) {
        self.services.lock().clear();
        self.is_running.store(false, Ordering::Release);
        let _ = self.shutdown.send(true);
    }

    /// Terminates the platform and waits until all supervised background tasks have stopped.
    ///
    /// Tasks which panicked are reported in the log.
    pub async fn shutdown(&self) {
        self.terminate();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, handle) in tasks {
            if let Err(error) = handle.await {
                log::error!("Background task {} panicked: {}", name, error);
            }
        }

        log::info!("Platform has been shut down.");
    }
}
