//! Process-wide set of projections and their lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use eventview_types::{Backend, EventSource, SchemaError};
use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::ProjectionConfig;
use crate::projection::Projection;
use crate::scheduler::Scheduler;
use crate::worker::{Clock, SystemClock, Worker, WorkerError};

/// Errors starting or addressing projections.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two registered projections share a name.
    #[error("projection {name} is registered more than once")]
    DuplicateName { name: String },

    /// A projection could not be turned into a worker.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// A projection's tables could not be created or reconciled.
    #[error("schema initialization of {projection} failed")]
    Schema {
        projection: String,
        #[source]
        source: SchemaError,
    },

    /// No running projection has this name.
    #[error("no running projection named {name}")]
    UnknownProjection { name: String },
}

/// Projections waiting to be started.
///
/// Built once at process start, then consumed by [`Registry::start`].
pub struct Registry {
    backend: Arc<dyn Backend>,
    source: Arc<dyn EventSource>,
    config: ProjectionConfig,
    clock: Arc<dyn Clock>,
    projections: Vec<Arc<dyn Projection>>,
}

impl Registry {
    /// Empty registry writing to `backend` and reading from `source`.
    pub fn new(
        backend: Arc<dyn Backend>,
        source: Arc<dyn EventSource>,
        config: ProjectionConfig,
    ) -> Self {
        Self {
            backend,
            source,
            config,
            clock: Arc::new(SystemClock),
            projections: Vec::new(),
        }
    }

    /// Use `clock` for failure bookkeeping.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add `projection`. Name clashes surface in [`Registry::start`].
    pub fn register(&mut self, projection: Arc<dyn Projection>) -> &mut Self {
        self.projections.push(projection);
        self
    }

    /// Names of the registered projections, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.projections.iter().map(|projection| projection.name()).collect()
    }

    /// Validate every projection, bootstrap their tables, then start one
    /// scheduling loop per projection.
    ///
    /// Fails before anything starts when two projections share a name, when
    /// reducers are miswired or when a schema cannot be reconciled.
    #[instrument(name = "registry.start", skip(self), fields(projections = self.projections.len()))]
    pub async fn start(self) -> Result<RunningProjections, RegistryError> {
        let mut seen = HashSet::new();
        for projection in &self.projections {
            if !seen.insert(projection.name()) {
                error!(
                    projection = projection.name(),
                    "[registry.duplicate] projection registered twice"
                );
                return Err(RegistryError::DuplicateName {
                    name: projection.name().to_string(),
                });
            }
        }

        for name in self.config.customizations.keys() {
            if !seen.contains(name.as_str()) {
                warn!(projection = %name, "[registry.unknown_customization] no such projection");
            }
        }

        let mut workers = Vec::with_capacity(self.projections.len());
        for projection in &self.projections {
            let config = self.config.for_projection(projection.name());
            let worker = Worker::new(
                Arc::clone(projection),
                Arc::clone(&self.backend),
                Arc::clone(&self.source),
                config,
            )?
            .with_clock(Arc::clone(&self.clock));
            workers.push(Arc::new(worker));
        }

        for worker in &workers {
            worker.initialize().await.map_err(|source| {
                error!(
                    projection = %worker.name(),
                    error = %source,
                    "[registry.schema_failed] schema initialization failed"
                );
                RegistryError::Schema {
                    projection: worker.name().to_string(),
                    source,
                }
            })?;
        }

        let (shutdown, _) = watch::channel(false);
        let mut running = HashMap::with_capacity(workers.len());
        for worker in workers {
            let (trigger, triggers) = mpsc::channel(1);
            let scheduler = Scheduler::new(Arc::clone(&worker), shutdown.subscribe(), triggers);
            let task = tokio::spawn(scheduler.run());
            running.insert(
                worker.name().to_string(),
                RunningProjection {
                    worker,
                    trigger,
                    task,
                },
            );
        }

        info!(count = running.len(), "[registry.started] projections started");
        Ok(RunningProjections {
            projections: running,
            shutdown,
        })
    }
}

struct RunningProjection {
    worker: Arc<Worker>,
    trigger: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle on started projections.
pub struct RunningProjections {
    projections: HashMap<String, RunningProjection>,
    shutdown: watch::Sender<bool>,
}

impl RunningProjections {
    /// Names of the running projections, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.projections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Worker of the projection `name`.
    pub fn worker(&self, name: &str) -> Option<&Arc<Worker>> {
        self.projections.get(name).map(|running| &running.worker)
    }

    /// Run a tick of `name` now instead of waiting for its interval.
    ///
    /// Triggers arriving while one is already pending are merged.
    pub fn trigger(&self, name: &str) -> Result<(), RegistryError> {
        let running = self
            .projections
            .get(name)
            .ok_or_else(|| RegistryError::UnknownProjection {
                name: name.to_string(),
            })?;
        // A full channel already holds a pending trigger.
        let _ = running.trigger.try_send(());
        Ok(())
    }

    /// Stop every scheduling loop, waiting for ticks in progress to finish.
    #[instrument(name = "registry.stop", skip(self))]
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        let tasks = self.projections.into_values().map(|running| running.task);
        for result in join_all(tasks).await {
            if let Err(error) = result {
                error!(error = %error, "[registry.join_failed] scheduler task failed");
            }
        }
        info!("[registry.stopped] projections stopped");
    }
}
