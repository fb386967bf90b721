//! Composition root: one scheduler plus the services that feed it jobs.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{job::Job, scheduler::Scheduler, source::TickSource, SchedulerError};

/// A long-lived subsystem owned by an [`Engine`].
///
/// Services that need per-tick work return it from [`job`](Service::job);
/// the engine schedules it when the service starts.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Stable name for logs and errors.
    fn name(&self) -> &str;

    async fn start(&self, engine: &Engine) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()>;

    /// Per-tick work, if any.
    fn job(self: Arc<Self>) -> Option<Job> {
        None
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// A service of this type is already loaded.
    #[error("Service already loaded: {name}")]
    DuplicateService { name: String },

    /// A service's `start` hook failed.
    #[error("Service '{name}' failed to start")]
    ServiceStart {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Whether the engine's services and scheduler are live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
}

struct ServiceEntry {
    service: Arc<dyn Service>,
    /// Same allocation as `service`, kept as `Any` for typed lookup.
    any: Arc<dyn Any + Send + Sync>,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<TypeId, ServiceEntry>,
    /// Load order; services start in this order and stop in reverse.
    order: Vec<TypeId>,
}

/// Owns a [`Scheduler`] and a registry of services keyed by their type.
pub struct Engine {
    scheduler: Scheduler,
    registry: RwLock<Registry>,
    state: RwLock<EngineState>,
}

impl Engine {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            registry: RwLock::new(Registry::default()),
            state: RwLock::new(EngineState::Stopped),
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn state(&self) -> EngineState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn schedule_job(&self, job: Job) -> bool {
        self.scheduler.schedule(job)
    }

    /// Register a service. If the engine is already running the service is
    /// started immediately and its job scheduled; if that start fails the
    /// service is unregistered again.
    pub async fn load_service<T: Service>(&self, service: T) -> Result<Arc<T>, EngineError> {
        let service = Arc::new(service);
        let type_id = TypeId::of::<T>();
        {
            let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
            if registry.entries.contains_key(&type_id) {
                return Err(EngineError::DuplicateService {
                    name: service.name().to_string(),
                });
            }
            registry.entries.insert(
                type_id,
                ServiceEntry {
                    service: service.clone(),
                    any: service.clone(),
                },
            );
            registry.order.push(type_id);
        }
        debug!(service = %service.name(), "service loaded");

        if self.state() == EngineState::Running {
            if let Err(e) = self.start_service(service.clone()).await {
                self.unregister(type_id);
                return Err(e);
            }
        }
        Ok(service)
    }

    /// Look up a loaded service by type.
    pub fn service<T: Service>(&self) -> Option<Arc<T>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        let entry = registry.entries.get(&TypeId::of::<T>())?;
        Arc::clone(&entry.any).downcast::<T>().ok()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services_in_order()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    /// Start the scheduler, then every loaded service in load order.
    ///
    /// If a service fails to start, the scheduler is stopped again and the
    /// error returned.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.scheduler.start()?;
        self.start_services().await
    }

    /// Like [`start`](Self::start), with an injected wake-up source.
    pub async fn start_with<S: TickSource>(&self, source: S) -> Result<(), EngineError> {
        self.scheduler.start_with(source)?;
        self.start_services().await
    }

    /// Stop services in reverse load order, then stop the scheduler and wait
    /// for it to drain. Service stop failures are logged, not returned.
    pub async fn stop(&self) {
        for service in self.services_in_order().into_iter().rev() {
            if let Err(e) = service.stop().await {
                warn!(service = %service.name(), error = %e, "service failed to stop cleanly");
            }
        }
        self.scheduler.stop().await;
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = EngineState::Stopped;
        info!("engine stopped");
    }

    async fn start_services(&self) -> Result<(), EngineError> {
        for service in self.services_in_order() {
            if let Err(e) = self.start_service(service).await {
                self.scheduler.stop().await;
                return Err(e);
            }
        }
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = EngineState::Running;
        info!(services = self.service_names().len(), "engine started");
        Ok(())
    }

    async fn start_service(&self, service: Arc<dyn Service>) -> Result<(), EngineError> {
        let name = service.name().to_string();
        if let Err(source) = service.start(self).await {
            error!(service = %name, error = %source, "service failed to start");
            return Err(EngineError::ServiceStart { name, source });
        }
        if let Some(job) = service.job() {
            self.scheduler.schedule(job);
        }
        debug!(service = %name, "service started");
        Ok(())
    }

    fn unregister(&self, type_id: TypeId) {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        registry.entries.remove(&type_id);
        registry.order.retain(|id| *id != type_id);
    }

    fn services_in_order(&self) -> Vec<Arc<dyn Service>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|entry| Arc::clone(&entry.service))
            .collect()
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("services", &self.service_names())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
