use crate::event::{EventType, InstanceId};

/// Identifies the backend operation that failed.
///
/// Used by `StoreError::StoreFailure` and `SourceError::SourceFailure` so
/// callers and logs can tell which step of a batch hit an infrastructure
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Beginning a transaction.
    BeginTransaction,
    /// Executing a table mutation.
    Execute,
    /// Creating, rolling back to or releasing a savepoint.
    Savepoint,
    /// Committing a transaction.
    CommitTransaction,
    /// Rolling back a transaction.
    RollbackTransaction,
    /// Acquiring the projection lock.
    AcquireLock,
    /// Reading a checkpoint row.
    LoadState,
    /// Writing a checkpoint row.
    SaveState,
    /// Reading the current shape of a table.
    InspectSchema,
    /// Creating tables, columns or indexes.
    ApplySchema,
    /// Reading events from the log.
    FetchEvents,
    /// Listing the instances present in the log.
    ListInstances,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BeginTransaction => write!(f, "begin_transaction"),
            Self::Execute => write!(f, "execute"),
            Self::Savepoint => write!(f, "savepoint"),
            Self::CommitTransaction => write!(f, "commit_transaction"),
            Self::RollbackTransaction => write!(f, "rollback_transaction"),
            Self::AcquireLock => write!(f, "acquire_lock"),
            Self::LoadState => write!(f, "load_state"),
            Self::SaveState => write!(f, "save_state"),
            Self::InspectSchema => write!(f, "inspect_schema"),
            Self::ApplySchema => write!(f, "apply_schema"),
            Self::FetchEvents => write!(f, "fetch_events"),
            Self::ListInstances => write!(f, "list_instances"),
        }
    }
}

/// Returned by reducers.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ReduceError {
    /// The reducer was handed an event it does not understand.
    #[error("reduce.wrong.event.type: expected {expected}, got {actual}")]
    UnexpectedEvent {
        expected: &'static str,
        actual: EventType,
    },

    /// The event payload does not match the reducer's expected shape.
    #[error("unable to decode payload of {event_type}: {detail}")]
    InvalidPayload { event_type: EventType, detail: String },

    /// Reducer-specific rejection.
    #[error("{0}")]
    Rejected(String),
}

/// A statement that cannot be executed as built.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StatementError {
    /// Create, update and upsert need at least one column.
    #[error("statement has no columns")]
    NoColumns,

    /// Update and delete must be scoped by at least one condition.
    #[error("statement has no conditions")]
    NoConditions,

    /// Upsert needs the columns that identify a conflicting row.
    #[error("upsert has no conflict columns")]
    NoConflictColumns,

    /// Upsert conflict columns must also be written.
    #[error("conflict column {0} is not among the written columns")]
    ConflictColumnNotWritten(String),

    /// A multi statement without sub statements.
    #[error("multi statement is empty")]
    EmptyMulti,
}

/// A table declaration that is invalid or cannot be reconciled with the store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// The table declares no columns.
    #[error("table {table} declares no columns")]
    NoColumns { table: String },

    /// Two columns share a name.
    #[error("table {table} declares column {column} twice")]
    DuplicateColumn { table: String, column: String },

    /// A key, index or foreign key references a column the table lacks.
    #[error("table {table} references unknown column {column}")]
    UnknownColumn { table: String, column: String },

    /// The primary key is empty.
    #[error("table {table} has no primary key")]
    MissingPrimaryKey { table: String },

    /// Every primary key must lead with the instance column.
    #[error("primary key of {table} must start with {expected}, found {found}")]
    PrimaryKeyNotTenantScoped {
        table: String,
        expected: String,
        found: String,
    },

    /// An existing column has a different type than declared.
    #[error("column {table}.{column} is {existing} but declared as {declared}")]
    TypeMismatch {
        table: String,
        column: String,
        existing: String,
        declared: String,
    },

    /// A missing column cannot be added to a table that already has rows.
    #[error("column {table}.{column} is missing and neither nullable nor defaulted")]
    CannotAddColumn { table: String, column: String },

    /// An existing table lacks a declared foreign key. Foreign keys are only
    /// created with their table.
    #[error("table {table} exists without foreign key {foreign_key}")]
    MissingForeignKey { table: String, foreign_key: String },

    /// Two suffix tables share a suffix.
    #[error("suffix {suffix} is declared twice for {table}")]
    DuplicateSuffix { table: String, suffix: String },

    /// The store failed while inspecting or altering the schema.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Error returned by backend operations.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Infrastructure failure surfaced by the backing store.
    #[error("{operation} operation failed")]
    StoreFailure { operation: Operation },

    /// The mutation was malformed.
    #[error("invalid statement for {table}: {source}")]
    InvalidStatement {
        table: String,
        #[source]
        source: StatementError,
    },

    /// A mutation targeted a table that does not exist.
    #[error("table {table} does not exist")]
    UnknownTable { table: String },

    /// A mutation referenced a column the table lacks.
    #[error("column {column} does not exist on {table}")]
    UnknownColumn { table: String, column: String },

    /// A unique, not-null or foreign key constraint rejected the write.
    #[error("constraint violated on {table}: {detail}")]
    ConstraintViolation { table: String, detail: String },

    /// The named savepoint is not active in this transaction.
    #[error("savepoint {name} is not active")]
    UnknownSavepoint { name: String },

    /// A transactional action reported a failure of its own.
    #[error("action failed: {0}")]
    ActionFailed(String),
}

/// Error returned by event sources.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Infrastructure failure while reading the log.
    #[error("{operation} operation failed")]
    SourceFailure { operation: Operation },

    /// A stored event could not be mapped into an [`crate::Event`].
    #[error("malformed event at position {position} for instance {instance_id}: {detail}")]
    MalformedEvent {
        instance_id: InstanceId,
        position: u64,
        detail: String,
    },
}
