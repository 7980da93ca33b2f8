//! The per-projection processing loop.
//!
//! One batch runs in one transaction: lock, load the checkpoint, fetch,
//! then reduce and apply each event under its own savepoint. A failing event
//! is rolled back to its savepoint, so everything applied before it commits
//! together with the checkpoint and the failure record.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use eventview_types::{
    AppliedEvent, Backend, Event, EventQuery, EventSource, InstanceId, Position, ProjectionKey,
    ProjectionName, ProjectionState, ReduceError, SchemaError, SourceError, StatementError,
    StatementKind, StoreError, Transaction,
};
use tracing::{debug, info, instrument, warn};

use crate::config::HandlerConfig;
use crate::projection::Projection;
use crate::reducer::{DispatchError, ReducerTable};
use crate::schema::ensure_schema;

const SAVEPOINT: &str = "exec_stmt";

/// Source of the current time for failure bookkeeping.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Errors constructing a worker.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The projection name is blank or too long.
    #[error("invalid projection name {name:?}")]
    InvalidName { name: String },

    /// The projection's reducers cannot be dispatched.
    #[error("reducers of {projection} are miswired")]
    Dispatch {
        projection: String,
        #[source]
        source: DispatchError,
    },
}

/// Infrastructure failures that abort a whole batch.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The event source failed.
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Why a single event could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    /// The reducer failed.
    #[error("reduce failed: {0}")]
    Reduce(#[from] ReduceError),

    /// The reducer produced a malformed statement.
    #[error("statement rejected: {0}")]
    Statement(#[from] StatementError),

    /// Executing the statement failed.
    #[error("execution failed: {0}")]
    Store(#[from] StoreError),

    /// The reducer built its statement from another event.
    #[error("statement derived from position {found} while applying {expected}")]
    ForeignStatement { expected: Position, found: Position },
}

/// Result of one batch for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Another worker holds the lock; nothing was done.
    Contended,
    /// Too many consecutive failures; waiting until `retry_at`.
    Stalled { retry_at: DateTime<Utc> },
    /// No events after the checkpoint.
    UpToDate,
    /// Every fetched event was applied.
    Applied {
        /// Events applied.
        applied: usize,
        /// Checkpoint after the batch.
        position: Position,
        /// The batch was full, more events may be waiting.
        more: bool,
    },
    /// Applying stopped at a failing event.
    Failed {
        /// Events applied before the failure.
        applied: usize,
        /// Position of the failing event.
        position: Position,
        /// What went wrong.
        error: ApplyError,
    },
}

/// Summary of one tick over every instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Instances visited.
    pub instances: usize,
    /// Events applied.
    pub applied: usize,
    /// Instances whose batch stopped at a failing event.
    pub failed: usize,
    /// Instances skipped because they are stalled.
    pub stalled: usize,
    /// Instances skipped because another worker held the lock.
    pub contended: usize,
    /// Instances whose batch aborted on an infrastructure error.
    pub errors: usize,
    /// Some instance still had a full batch waiting when the iteration cap
    /// was reached.
    pub backlog: bool,
    /// Earliest time one of the stalled instances may be retried.
    pub retry_at: Option<DateTime<Utc>>,
    /// Set when every visited instance was stalled: how long until the
    /// earliest of them may be retried.
    pub retry_after: Option<Duration>,
}

impl TickReport {
    fn record(&mut self, outcome: &BatchOutcome) {
        match outcome {
            BatchOutcome::Contended => self.contended += 1,
            BatchOutcome::Stalled { retry_at } => {
                self.stalled += 1;
                self.retry_at = Some(self.retry_at.map_or(*retry_at, |at| at.min(*retry_at)));
            }
            BatchOutcome::UpToDate => {}
            BatchOutcome::Applied { applied, .. } => self.applied += applied,
            BatchOutcome::Failed { applied, .. } => {
                self.applied += applied;
                self.failed += 1;
            }
        }
    }
}

/// Runs one projection: schema bootstrap, batches and checkpoint bookkeeping.
pub struct Worker {
    name: ProjectionName,
    projection: Arc<dyn Projection>,
    reducers: ReducerTable,
    config: HandlerConfig,
    backend: Arc<dyn Backend>,
    source: Arc<dyn EventSource>,
    clock: Arc<dyn Clock>,
}

impl Worker {
    /// Worker for `projection`, validating its name and reducers.
    pub fn new(
        projection: Arc<dyn Projection>,
        backend: Arc<dyn Backend>,
        source: Arc<dyn EventSource>,
        config: HandlerConfig,
    ) -> Result<Self, WorkerError> {
        let name = ProjectionName::try_new(projection.name().to_string()).map_err(|_| {
            WorkerError::InvalidName {
                name: projection.name().to_string(),
            }
        })?;
        let reducers =
            ReducerTable::new(projection.reducers()).map_err(|source| WorkerError::Dispatch {
                projection: name.to_string(),
                source,
            })?;

        Ok(Self {
            name,
            projection,
            reducers,
            config,
            backend,
            source,
            clock: Arc::new(SystemClock),
        })
    }

    /// Use `clock` instead of the wall clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Projection name.
    pub const fn name(&self) -> &ProjectionName {
        &self.name
    }

    /// Effective configuration.
    pub const fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Create or extend the projection's tables.
    pub async fn initialize(&self) -> Result<(), SchemaError> {
        match self.projection.init() {
            Some(check) => ensure_schema(self.backend.as_ref(), self.name.as_str(), &check).await,
            None => Ok(()),
        }
    }

    /// Run one tick: every instance, up to `max_iterators` batches each.
    ///
    /// A failing instance does not keep the others from progressing.
    #[instrument(name = "worker.tick", skip(self), fields(projection = %self.name))]
    pub async fn run_once(&self) -> Result<TickReport, HandlerError> {
        let instances = self
            .source
            .instance_ids(self.reducers.aggregate_types())
            .await?;

        let mut report = TickReport::default();
        for instance_id in &instances {
            report.instances += 1;
            match self.process_instance(instance_id, &mut report).await {
                Ok(()) => {}
                Err(error) => {
                    warn!(
                        instance = %instance_id,
                        error = %error,
                        "[worker.batch_aborted] batch aborted"
                    );
                    report.errors += 1;
                }
            }
        }

        if report.stalled > 0 && report.stalled == report.instances {
            report.retry_after = report.retry_at.map(|retry_at| {
                (retry_at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO)
            });
        }

        if report.applied > 0 {
            info!(
                applied = report.applied,
                instances = report.instances,
                "[worker.tick] projection advanced"
            );
        }
        Ok(report)
    }

    async fn process_instance(
        &self,
        instance_id: &InstanceId,
        report: &mut TickReport,
    ) -> Result<(), HandlerError> {
        for iteration in 1..=self.config.max_iterators {
            let outcome = self.process_batch(instance_id).await?;
            report.record(&outcome);
            let more = matches!(outcome, BatchOutcome::Applied { more: true, .. });
            if !more {
                return Ok(());
            }
            if iteration == self.config.max_iterators {
                report.backlog = true;
            }
        }
        Ok(())
    }

    /// Run one batch for `instance_id`.
    #[instrument(
        name = "worker.batch",
        skip(self),
        fields(projection = %self.name, instance = %instance_id)
    )]
    pub async fn process_batch(&self, instance_id: &InstanceId) -> Result<BatchOutcome, HandlerError> {
        let key = self.key(instance_id);
        let mut tx = self.backend.begin().await?;

        if !tx.try_lock(&key).await? {
            debug!("[worker.locked] another worker holds the lock");
            tx.rollback().await?;
            return Ok(BatchOutcome::Contended);
        }

        let mut state = tx.load_state(&key).await?.unwrap_or_default();
        if let Some(retry_at) = self.deferred_until(&state) {
            debug!(retry_at = %retry_at, "[worker.stalled] waiting before retrying failed event");
            tx.rollback().await?;
            return Ok(BatchOutcome::Stalled { retry_at });
        }

        let events = self
            .source
            .fetch_events(&self.query(instance_id, state.position))
            .await?;
        if events.is_empty() {
            tx.rollback().await?;
            return Ok(BatchOutcome::UpToDate);
        }
        let more = u64::try_from(events.len()).unwrap_or(u64::MAX) >= self.config.bulk_limit;

        let mut applied = 0;
        let mut failure = None;
        for event in &events {
            if event.position <= state.position {
                debug!(position = %event.position, "[worker.replay] event already applied");
                continue;
            }
            match self.apply(tx.as_mut(), event).await? {
                Ok(()) => {
                    state.advance(
                        event.position,
                        AppliedEvent {
                            aggregate_type: event.aggregate_type.clone(),
                            aggregate_id: event.aggregate_id.clone(),
                            sequence: event.sequence,
                        },
                    );
                    applied += 1;
                }
                Err(error) => {
                    state.record_failure(event.position, error.to_string(), self.clock.now());
                    warn!(
                        position = %event.position,
                        event_type = %event.event_type,
                        failure_count = state.failure_count(),
                        error = %error,
                        "[worker.apply_failed] event could not be applied"
                    );
                    if state.failure_count() >= self.config.max_failure_count {
                        warn!(
                            position = %event.position,
                            "[worker.stalled] projection stalled on failing event"
                        );
                    }
                    failure = Some((event.position, error));
                    break;
                }
            }
        }

        if applied > 0 || failure.is_some() {
            tx.save_state(&key, &state).await?;
        }
        tx.commit().await?;

        debug!(applied, position = %state.position, "[worker.checkpoint] batch committed");
        Ok(match failure {
            Some((position, error)) => BatchOutcome::Failed {
                applied,
                position,
                error,
            },
            None => BatchOutcome::Applied {
                applied,
                position: state.position,
                more,
            },
        })
    }

    /// Checkpoint of `instance_id`, `None` before the first batch.
    pub async fn state(&self, instance_id: &InstanceId) -> Result<Option<ProjectionState>, StoreError> {
        let mut tx = self.backend.begin().await?;
        let state = tx.load_state(&self.key(instance_id)).await?;
        tx.rollback().await?;
        Ok(state)
    }

    /// Clear the failure record of a stalled instance so the next tick
    /// retries immediately.
    ///
    /// Returns `false` when another worker holds the lock.
    #[instrument(name = "worker.reset_failures", skip(self), fields(projection = %self.name))]
    pub async fn reset_failures(&self, instance_id: &InstanceId) -> Result<bool, StoreError> {
        let key = self.key(instance_id);
        let mut tx = self.backend.begin().await?;
        if !tx.try_lock(&key).await? {
            tx.rollback().await?;
            return Ok(false);
        }

        if let Some(mut state) = tx.load_state(&key).await? {
            if state.failure.take().is_some() {
                tx.save_state(&key, &state).await?;
                info!(instance = %instance_id, "[worker.reset_failures] failure record cleared");
            }
        }
        tx.commit().await?;
        Ok(true)
    }

    fn key(&self, instance_id: &InstanceId) -> ProjectionKey {
        ProjectionKey::new(self.name.clone(), instance_id.clone())
    }

    fn query(&self, instance_id: &InstanceId, after: Position) -> EventQuery {
        EventQuery {
            instance_id: instance_id.clone(),
            after,
            aggregate_types: self.reducers.aggregate_types().to_vec(),
            event_types: self.reducers.event_types().to_vec(),
            limit: self.config.bulk_limit,
        }
    }

    /// Below the failure limit a failed event is retried on the next tick.
    /// At or above it, attempts wait `retry_failed_after` since the last one.
    fn deferred_until(&self, state: &ProjectionState) -> Option<DateTime<Utc>> {
        let failure = state.failure.as_ref()?;
        if failure.count < self.config.max_failure_count {
            return None;
        }
        let retry_at = TimeDelta::from_std(self.config.retry_failed_after)
            .ok()
            .and_then(|delay| failure.last_failed_at.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        (self.clock.now() < retry_at).then_some(retry_at)
    }

    async fn apply(
        &self,
        tx: &mut dyn Transaction,
        event: &Event,
    ) -> Result<Result<(), ApplyError>, StoreError> {
        let statement = match self.reducers.reduce(event) {
            Ok(statement) => statement,
            Err(error) => return Ok(Err(error.into())),
        };
        let found = statement.origin().position;
        if found != event.position {
            return Ok(Err(ApplyError::ForeignStatement {
                expected: event.position,
                found,
            }));
        }
        if let Err(error) = statement.kind().validate() {
            return Ok(Err(error.into()));
        }
        if statement.is_no_op() {
            debug!(position = %event.position, "[worker.no_op] nothing to execute");
            return Ok(Ok(()));
        }

        tx.savepoint(SAVEPOINT).await?;
        match self.execute(tx, statement.kind()).await {
            Ok(()) => {
                tx.release_savepoint(SAVEPOINT).await?;
                Ok(Ok(()))
            }
            Err(error) => {
                tx.rollback_to_savepoint(SAVEPOINT).await?;
                tx.release_savepoint(SAVEPOINT).await?;
                Ok(Err(error))
            }
        }
    }

    async fn execute(&self, tx: &mut dyn Transaction, kind: &StatementKind) -> Result<(), ApplyError> {
        let mut steps = Vec::new();
        flatten(kind, &mut steps);

        for step in steps {
            match step {
                StatementKind::Write(write) => {
                    let table = write.table.resolve(self.name.as_str());
                    let rows = tx.execute(&table, &write.mutation).await?;
                    if rows == 0 {
                        debug!(
                            table = %table,
                            kind = write.mutation.kind(),
                            "[worker.zero_rows] statement matched no rows"
                        );
                    }
                }
                StatementKind::Action(action) => action.run(&mut *tx).await?,
                StatementKind::Multi(_) | StatementKind::NoOp => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("reducers", &self.reducers)
            .finish_non_exhaustive()
    }
}

fn flatten<'a>(kind: &'a StatementKind, steps: &mut Vec<&'a StatementKind>) {
    match kind {
        StatementKind::Multi(statements) => {
            for statement in statements {
                flatten(statement, steps);
            }
        }
        other => steps.push(other),
    }
}
