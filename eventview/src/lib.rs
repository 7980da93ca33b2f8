//! `EventView` - projection engine for event-sourced read models
//!
//! Each [`Projection`] names a base table, declares its tables through a
//! [`TableCheck`] and maps events to [`Statement`]s with pure reducers. The
//! [`Registry`] bootstraps every schema, then runs one [`Worker`] per
//! projection on its own schedule. A worker processes each tenant instance
//! in batches: lock, read the checkpoint, fetch the events after it, apply
//! them and move the checkpoint forward in the same transaction.
//!
//! Failing events are retried on later ticks. After
//! [`HandlerConfig::max_failure_count`] consecutive failures on the same
//! event the instance stalls and is probed again every
//! [`HandlerConfig::retry_failed_after`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod projection;
pub mod reducer;
pub mod registry;
mod scheduler;
mod schema;
pub mod worker;

pub use config::{
    BulkLimit, ConfigError, CustomConfig, HandlerConfig, MaxFailureCount, MaxIterators,
    ProjectionConfig, RequeueEveryMs, RetryFailedAfterMs,
};
pub use eventview_types::*;
pub use projection::Projection;
pub use reducer::{
    instance_removed, owner_removed, AggregateReducer, DispatchError, EventReducer, ReduceFn,
    ReducerTable, INSTANCE_AGGREGATE, INSTANCE_REMOVED,
};
pub use registry::{Registry, RegistryError, RunningProjections};
pub use schema::ensure_schema;
pub use worker::{
    ApplyError, BatchOutcome, Clock, HandlerError, SystemClock, TickReport, Worker, WorkerError,
};
