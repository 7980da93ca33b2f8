//! PostgreSQL storage for `EventView` projections
//!
//! - [`PostgresBackend`]: projection tables, checkpoints in
//!   `eventview_current_states` and transaction scoped advisory locks
//! - [`PostgresEventSource`]: reads `eventview_events` in position order
//! - [`compiler`]: SQL generation for table mutations, usable without a
//!   connection
//!
//! Run [`PostgresBackend::migrate`] once before use to create the checkpoint
//! and event tables.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod compiler;
mod ddl;
mod source;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventview_types::{
    AggregateId, AggregateType, AppliedEvent, Backend, ColumnDef, ExistingColumn, FailureRecord,
    Index, Mutation, Operation, Position, PositionStore, ProjectionKey, ProjectionState,
    StoreError, TableDefinition, Transaction, Value,
};
use nutype::nutype;
use sqlx::postgres::{PgArguments, PgPoolOptions};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{query, Pool, Postgres, Row};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::compiler::{compile, quote_ident};

pub use source::PostgresEventSource;

/// Errors setting up a [`PostgresBackend`].
#[derive(Debug, Error)]
pub enum PostgresBackendError {
    /// The pool could not connect.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// The bundled migrations could not be applied.
    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// Every running projection holds one connection for the duration of a
/// batch, so the pool should be at least as large as the number of
/// projections that may tick at the same time.
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the [`PostgresBackend`] connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// [`Backend`] storing projection tables and checkpoints in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: Pool<Postgres>,
}

impl PostgresBackend {
    /// Connect with default configuration.
    pub async fn new<S: Into<String>>(connection_string: S) -> Result<Self, PostgresBackendError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresBackendError> {
        let connection_string = connection_string.into();
        let max_connections: std::num::NonZeroU32 = config.max_connections.into();
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.get())
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&connection_string)
            .await
            .map_err(PostgresBackendError::ConnectionFailed)?;
        Ok(Self { pool })
    }

    /// Use an existing pool, for example one shared with a
    /// [`PostgresEventSource`].
    pub const fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Create the checkpoint and event tables.
    pub async fn migrate(&self) -> Result<(), PostgresBackendError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresBackendError::MigrationFailed)?;
        info!("[postgres.migrated] eventview tables are up to date");
        Ok(())
    }

    async fn run_ddl(&self, statement: &str) -> Result<(), StoreError> {
        debug!(statement = %statement, "[postgres.ddl] applying schema change");
        query(statement)
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::ApplySchema))?;
        Ok(())
    }
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        Ok(Box::new(PostgresTransaction { tx }))
    }

    #[instrument(name = "postgres.inspect_table", skip(self))]
    async fn inspect_table(&self, table: &str) -> Result<Option<Vec<ExistingColumn>>, StoreError> {
        let (schema, name) = ddl::split_table_name(table);
        let rows = query(
            "SELECT column_name, udt_name FROM information_schema.columns
             WHERE table_schema = COALESCE($1, current_schema()) AND table_name = $2
             ORDER BY ordinal_position",
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::InspectSchema))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row
                .try_get("column_name")
                .map_err(|error| map_sqlx_error(error, Operation::InspectSchema))?;
            let udt_name: String = row
                .try_get("udt_name")
                .map_err(|error| map_sqlx_error(error, Operation::InspectSchema))?;
            columns.push(ExistingColumn {
                name,
                column_type: ddl::column_type_of(&udt_name),
            });
        }
        Ok(Some(columns))
    }

    #[instrument(name = "postgres.foreign_keys", skip(self))]
    async fn foreign_keys(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let (schema, name) = ddl::split_table_name(table);
        let rows = query(
            "SELECT c.conname::text AS conname FROM pg_constraint c
             JOIN pg_class t ON t.oid = c.conrelid
             JOIN pg_namespace n ON n.oid = t.relnamespace
             WHERE c.contype = 'f'
               AND n.nspname = COALESCE($1, current_schema()) AND t.relname = $2",
        )
        .bind(schema)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::InspectSchema))?;

        rows.iter()
            .map(|row| {
                row.try_get("conname")
                    .map_err(|error| map_sqlx_error(error, Operation::InspectSchema))
            })
            .collect()
    }

    #[instrument(name = "postgres.create_table", skip(self, table), fields(table = %table.name))]
    async fn create_table(&self, table: &TableDefinition) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;
        for statement in ddl::create_table(table) {
            debug!(statement = %statement, "[postgres.ddl] applying schema change");
            query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|error| map_sqlx_error(error, Operation::ApplySchema))?;
        }
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        self.run_ddl(&ddl::add_column(table, column)).await
    }

    async fn ensure_index(&self, table: &TableDefinition, index: &Index) -> Result<(), StoreError> {
        self.run_ddl(&ddl::create_index(table, index)).await
    }
}

/// An open PostgreSQL transaction. Dropping it rolls back.
pub struct PostgresTransaction {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PostgresTransaction {
    async fn savepoint_command(&mut self, command: &str, name: &str) -> Result<(), StoreError> {
        query(&format!("{command} {}", quote_ident(name)))
            .execute(&mut *self.tx)
            .await
            .map_err(|error| {
                if sql_state(&error).as_deref() == Some("3B001") {
                    StoreError::UnknownSavepoint {
                        name: name.to_string(),
                    }
                } else {
                    map_sqlx_error(error, Operation::Savepoint)
                }
            })?;
        Ok(())
    }
}

#[async_trait]
impl PositionStore for PostgresTransaction {
    async fn try_lock(&mut self, key: &ProjectionKey) -> Result<bool, StoreError> {
        let row = query("SELECT pg_try_advisory_xact_lock(hashtext($1), hashtext($2)) AS locked")
            .bind(key.projection.as_str())
            .bind(key.instance_id.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))?;
        row.try_get("locked")
            .map_err(|error| map_sqlx_error(error, Operation::AcquireLock))
    }

    async fn load_state(
        &mut self,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionState>, StoreError> {
        let row = query(
            "SELECT position, aggregate_type, aggregate_id, sequence, failure_count,
                    last_failed_at, failed_position, last_error
             FROM eventview_current_states
             WHERE projection_name = $1 AND instance_id = $2",
        )
        .bind(key.projection.as_str())
        .bind(key.instance_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::LoadState))?;

        row.map(|row| decode_state(key, &row)).transpose()
    }

    async fn save_state(
        &mut self,
        key: &ProjectionKey,
        state: &ProjectionState,
    ) -> Result<(), StoreError> {
        let failure = state.failure.as_ref();
        let last_event = state.last_event.as_ref();
        query(
            "INSERT INTO eventview_current_states
                (projection_name, instance_id, position, aggregate_type, aggregate_id, sequence,
                 failure_count, last_failed_at, failed_position, last_error, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now())
             ON CONFLICT (projection_name, instance_id) DO UPDATE SET
                position = EXCLUDED.position,
                aggregate_type = EXCLUDED.aggregate_type,
                aggregate_id = EXCLUDED.aggregate_id,
                sequence = EXCLUDED.sequence,
                failure_count = EXCLUDED.failure_count,
                last_failed_at = EXCLUDED.last_failed_at,
                failed_position = EXCLUDED.failed_position,
                last_error = EXCLUDED.last_error,
                updated_at = now()",
        )
        .bind(key.projection.as_str())
        .bind(key.instance_id.as_str())
        .bind(to_sql_position(state.position)?)
        .bind(last_event.map(|event| event.aggregate_type.as_str()))
        .bind(last_event.map(|event| event.aggregate_id.as_str()))
        .bind(last_event.map(|event| to_sql_int(event.sequence)).transpose()?)
        .bind(i32::try_from(state.failure_count()).unwrap_or(i32::MAX))
        .bind(failure.map(|failure| failure.last_failed_at))
        .bind(failure.map(|failure| to_sql_position(failure.position)).transpose()?)
        .bind(failure.map(|failure| failure.error.as_str()))
        .execute(&mut *self.tx)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::SaveState))?;
        Ok(())
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn execute(&mut self, table: &str, mutation: &Mutation) -> Result<u64, StoreError> {
        mutation
            .validate()
            .map_err(|source| StoreError::InvalidStatement {
                table: table.to_string(),
                source,
            })?;

        let compiled = compile(table, mutation);
        debug!(sql = %compiled.sql, "[postgres.execute] executing statement");
        let mut statement = query(&compiled.sql);
        for value in &compiled.params {
            statement = bind_value(statement, value);
        }
        let result = statement
            .execute(&mut *self.tx)
            .await
            .map_err(|error| map_execute_error(error, table))?;
        Ok(result.rows_affected())
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoint_command("SAVEPOINT", name).await
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoint_command("ROLLBACK TO SAVEPOINT", name).await
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoint_command("RELEASE SAVEPOINT", name).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx } = *self;
        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx } = *self;
        tx.rollback()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::RollbackTransaction))
    }
}

fn bind_value<'q>(
    statement: Query<'q, Postgres, PgArguments>,
    value: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => statement.bind(None::<String>),
        Value::Text(text) => statement.bind(text.clone()),
        Value::Int(number) => statement.bind(*number),
        Value::Bool(flag) => statement.bind(*flag),
        Value::Timestamp(at) => statement.bind(*at),
        Value::Enum(number) => statement.bind(*number),
        Value::EnumArray(numbers) => statement.bind(numbers.clone()),
        Value::TextArray(texts) => statement.bind(texts.clone()),
        Value::Json(json) => statement.bind(Json(json.clone())),
    }
}

fn decode_state(
    key: &ProjectionKey,
    row: &sqlx::postgres::PgRow,
) -> Result<ProjectionState, StoreError> {
    let column = |error| map_sqlx_error(error, Operation::LoadState);

    let position: i64 = row.try_get("position").map_err(column)?;
    let aggregate_type: Option<String> = row.try_get("aggregate_type").map_err(column)?;
    let aggregate_id: Option<String> = row.try_get("aggregate_id").map_err(column)?;
    let sequence: Option<i64> = row.try_get("sequence").map_err(column)?;
    let failure_count: i32 = row.try_get("failure_count").map_err(column)?;
    let last_failed_at: Option<DateTime<Utc>> = row.try_get("last_failed_at").map_err(column)?;
    let failed_position: Option<i64> = row.try_get("failed_position").map_err(column)?;
    let last_error: Option<String> = row.try_get("last_error").map_err(column)?;

    let last_event = match (aggregate_type, aggregate_id, sequence) {
        (Some(aggregate_type), Some(aggregate_id), Some(sequence)) => Some(AppliedEvent {
            aggregate_type: AggregateType::new(aggregate_type),
            aggregate_id: AggregateId::try_new(aggregate_id)
                .map_err(|_| corrupt_state(key, "aggregate_id"))?,
            sequence: u64::try_from(sequence).map_err(|_| corrupt_state(key, "sequence"))?,
        }),
        _ => None,
    };

    let failure = match (last_failed_at, failed_position) {
        (Some(last_failed_at), Some(failed_position)) if failure_count > 0 => {
            Some(FailureRecord {
                count: u32::try_from(failure_count)
                    .map_err(|_| corrupt_state(key, "failure_count"))?,
                last_failed_at,
                position: Position::new(
                    u64::try_from(failed_position)
                        .map_err(|_| corrupt_state(key, "failed_position"))?,
                ),
                error: last_error.unwrap_or_default(),
            })
        }
        _ => None,
    };

    Ok(ProjectionState {
        position: Position::new(
            u64::try_from(position).map_err(|_| corrupt_state(key, "position"))?,
        ),
        last_event,
        failure,
    })
}

fn corrupt_state(key: &ProjectionKey, column: &str) -> StoreError {
    error!(
        projection = %key.projection,
        instance = %key.instance_id,
        column,
        "[postgres.corrupt_state] checkpoint row holds an out of range value"
    );
    StoreError::StoreFailure {
        operation: Operation::LoadState,
    }
}

fn to_sql_int(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::StoreFailure {
        operation: Operation::SaveState,
    })
}

fn to_sql_position(position: Position) -> Result<i64, StoreError> {
    to_sql_int(position.into_inner())
}

fn sql_state(error: &sqlx::Error) -> Option<String> {
    match error {
        sqlx::Error::Database(db_error) => db_error.code().map(|code| code.into_owned()),
        _ => None,
    }
}

/// Map errors of infrastructure operations.
///
/// Lock and serialization failures are expected under contention and logged
/// as warnings; everything else is an error.
fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    match sql_state(&error).as_deref() {
        // serialization_failure, deadlock_detected, lock_not_available
        Some("40001" | "40P01" | "55P03") => {
            warn!(
                error = %error,
                operation = %operation,
                "[postgres.lock_conflict] concurrent transaction interfered"
            );
        }
        _ => {
            error!(
                error = %error,
                operation = %operation,
                "[postgres.database_error] database operation failed"
            );
        }
    }
    StoreError::StoreFailure { operation }
}

/// Map errors of a projection table mutation, keeping constraint and schema
/// errors distinguishable from infrastructure failures.
fn map_execute_error(error: sqlx::Error, table: &str) -> StoreError {
    let sqlx::Error::Database(db_error) = &error else {
        return map_sqlx_error(error, Operation::Execute);
    };
    let detail = db_error.message().to_string();
    match db_error.code().as_deref() {
        // unique, foreign key, not null, check, datatype mismatch, bad input
        Some("23505" | "23503" | "23502" | "23514" | "42804" | "22P02") => {
            StoreError::ConstraintViolation {
                table: table.to_string(),
                detail,
            }
        }
        Some("42P01") => StoreError::UnknownTable {
            table: table.to_string(),
        },
        Some("42703") => StoreError::UnknownColumn {
            table: table.to_string(),
            column: quoted_name(&detail).unwrap_or(detail.as_str()).to_string(),
        },
        _ => map_sqlx_error(error, Operation::Execute),
    }
}

/// First double-quoted name in a PostgreSQL error message.
fn quoted_name(message: &str) -> Option<&str> {
    let start = message.find('"')? + 1;
    let length = message[start..].find('"')?;
    Some(&message[start..start + length])
}
