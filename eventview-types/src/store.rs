//! Contracts of the transactional store projections are written to.
//!
//! A [`Backend`] hands out [`Transaction`]s. Every transaction also acts as
//! the [`PositionStore`]: the projection lock, the checkpoint and the rows
//! written for a batch all live in the same transaction, so they commit or
//! roll back together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::event::{AggregateId, AggregateType, InstanceId, Position};
use crate::schema::{ColumnDef, ExistingColumn, Index, TableDefinition};
use crate::statement::Mutation;

/// Unique name of a projection. Also the name of its base table.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct ProjectionName(String);

/// Identifies one checkpoint row and the lock guarding it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectionKey {
    /// Projection the checkpoint belongs to.
    pub projection: ProjectionName,
    /// Tenant instance the checkpoint covers.
    pub instance_id: InstanceId,
}

impl ProjectionKey {
    /// Key for `projection` on `instance_id`.
    pub const fn new(projection: ProjectionName, instance_id: InstanceId) -> Self {
        Self {
            projection,
            instance_id,
        }
    }
}

impl std::fmt::Display for ProjectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.projection, self.instance_id)
    }
}

/// Last event a projection applied for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedEvent {
    /// Aggregate type of the event.
    pub aggregate_type: AggregateType,
    /// Aggregate id of the event.
    pub aggregate_id: AggregateId,
    /// Per-aggregate sequence of the event.
    pub sequence: u64,
}

/// Record of consecutive failures on the same event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Consecutive failed attempts.
    pub count: u32,
    /// Time of the latest failed attempt.
    pub last_failed_at: DateTime<Utc>,
    /// Position of the event that failed.
    pub position: Position,
    /// Error text of the latest attempt.
    pub error: String,
}

/// Checkpoint of one projection for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Global position of the last applied event.
    pub position: Position,
    /// Last applied event, `None` before the first one.
    pub last_event: Option<AppliedEvent>,
    /// Outstanding failures, cleared by the next success.
    pub failure: Option<FailureRecord>,
}

impl ProjectionState {
    /// Consecutive failures, zero when healthy.
    pub fn failure_count(&self) -> u32 {
        self.failure.as_ref().map_or(0, |failure| failure.count)
    }

    /// Record that the event at `position` was applied.
    pub fn advance(&mut self, position: Position, event: AppliedEvent) {
        self.position = position;
        self.last_event = Some(event);
        self.failure = None;
    }

    /// Record a failed attempt on the event at `position`.
    pub fn record_failure(&mut self, position: Position, error: String, at: DateTime<Utc>) {
        let count = match &self.failure {
            Some(previous) if previous.position == position => previous.count.saturating_add(1),
            _ => 1,
        };
        self.failure = Some(FailureRecord {
            count,
            last_failed_at: at,
            position,
            error,
        });
    }
}

/// Checkpoint and lock operations available inside a transaction.
#[async_trait]
pub trait PositionStore: Send {
    /// Take the lock for `key` for the rest of the transaction.
    ///
    /// Returns `false` without waiting when another transaction holds it.
    async fn try_lock(&mut self, key: &ProjectionKey) -> Result<bool, StoreError>;

    /// Checkpoint for `key`, `None` when the projection never ran.
    async fn load_state(&mut self, key: &ProjectionKey)
        -> Result<Option<ProjectionState>, StoreError>;

    /// Insert or replace the checkpoint for `key`.
    async fn save_state(
        &mut self,
        key: &ProjectionKey,
        state: &ProjectionState,
    ) -> Result<(), StoreError>;
}

/// An open transaction.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: PositionStore {
    /// Apply `mutation` to `table`, returning the number of affected rows.
    async fn execute(&mut self, table: &str, mutation: &Mutation) -> Result<u64, StoreError>;

    /// Open a savepoint.
    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Undo everything since the savepoint was opened. The savepoint stays open.
    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Forget the savepoint, keeping its writes.
    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError>;

    /// Make every write durable and release held locks.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    /// Discard every write and release held locks.
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

/// A transactional store with schema management.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError>;

    /// Columns of `table`, `None` when it does not exist.
    async fn inspect_table(&self, table: &str) -> Result<Option<Vec<ExistingColumn>>, StoreError>;

    /// Names of the foreign key constraints on `table`.
    async fn foreign_keys(&self, table: &str) -> Result<Vec<String>, StoreError>;

    /// Create `table` with its primary and foreign keys. Indexes are created
    /// separately through [`Backend::ensure_index`].
    async fn create_table(&self, table: &TableDefinition) -> Result<(), StoreError>;

    /// Add `column` to `table`.
    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError>;

    /// Create `index` on `table` unless it exists.
    async fn ensure_index(&self, table: &TableDefinition, index: &Index) -> Result<(), StoreError>;
}
