//! Dialect independent table mutations produced by reducers.
//!
//! A [`Statement`] pairs the event it was derived from with a
//! [`StatementKind`]. Backends never see statements directly: the worker
//! resolves each [`Write`] against the projection's table names and hands the
//! resulting [`Mutation`] to [`crate::Transaction::execute`].

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{StatementError, StoreError};
use crate::event::{Event, Origin};
use crate::store::Transaction;

/// A typed column or condition value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Text value.
    Text(String),
    /// 64 bit integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
    /// Enumeration stored as a small integer.
    Enum(i16),
    /// Array of enumerations.
    EnumArray(Vec<i16>),
    /// Array of text values.
    TextArray(Vec<String>),
    /// JSON document.
    Json(serde_json::Value),
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Self::TextArray(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

/// How a column value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColumnMode {
    /// Overwrite the column.
    #[default]
    Set,
    /// Written on insert only; an upsert hitting an existing row keeps the
    /// stored value (first write wins).
    InsertOnly,
    /// Append the value to an array column.
    ArrayAppend,
    /// Remove every occurrence of the value from an array column.
    ArrayRemove,
}

/// A column name with the value to write.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    value: Value,
    mode: ColumnMode,
}

impl Column {
    /// Column that overwrites the stored value.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_mode(name, value, ColumnMode::Set)
    }

    /// Column written only when the row is first inserted.
    pub fn insert_only(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_mode(name, value, ColumnMode::InsertOnly)
    }

    /// Append `value` to the array column `name`.
    pub fn array_append(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_mode(name, value, ColumnMode::ArrayAppend)
    }

    /// Remove `value` from the array column `name`.
    pub fn array_remove(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::with_mode(name, value, ColumnMode::ArrayRemove)
    }

    fn with_mode(name: impl Into<String>, value: impl Into<Value>, mode: ColumnMode) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            mode,
        }
    }

    /// Column name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value to write.
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Write mode.
    pub const fn mode(&self) -> ColumnMode {
        self.mode
    }
}

/// Comparison operator of a [`Condition::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Comparison {
    /// `=`
    #[default]
    Equal,
    /// `<>`
    NotEqual,
    /// `<`
    Less,
    /// `<=`
    LessOrEqual,
    /// `>`
    Greater,
    /// `>=`
    GreaterOrEqual,
}

impl Comparison {
    /// SQL operator token.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "<>",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        }
    }
}

/// Row predicate for updates and deletes.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column <op> value`
    Compare {
        column: String,
        op: Comparison,
        value: Value,
    },
    /// `column IS NULL`
    IsNull(String),
    /// Array `column` contains the element `value`.
    Contains { column: String, value: Value },
    /// Negation.
    Not(Box<Condition>),
    /// Conjunction.
    And(Vec<Condition>),
    /// Disjunction.
    Or(Vec<Condition>),
}

impl Condition {
    /// `column = value`
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Equal, value)
    }

    /// `column <op> value`
    pub fn compare(column: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Self::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    /// `column IS NULL`
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    /// Array column contains `value`.
    pub fn contains(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Negate this condition.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// All of `conditions`.
    pub const fn and(conditions: Vec<Self>) -> Self {
        Self::And(conditions)
    }

    /// Any of `conditions`.
    pub const fn or(conditions: Vec<Self>) -> Self {
        Self::Or(conditions)
    }
}

/// A single table mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Plain insert.
    Create { columns: Vec<Column> },
    /// Insert, or update the row identified by `conflict` when it exists.
    Upsert {
        columns: Vec<Column>,
        conflict: Vec<String>,
    },
    /// Update rows matching every condition. Matching zero rows succeeds.
    Update {
        columns: Vec<Column>,
        conditions: Vec<Condition>,
    },
    /// Delete rows matching every condition. Matching zero rows succeeds.
    Delete { conditions: Vec<Condition> },
}

impl Mutation {
    /// Reject mutations that cannot be executed.
    pub fn validate(&self) -> Result<(), StatementError> {
        match self {
            Self::Create { columns } => non_empty_columns(columns),
            Self::Upsert { columns, conflict } => {
                non_empty_columns(columns)?;
                if conflict.is_empty() {
                    return Err(StatementError::NoConflictColumns);
                }
                if let Some(missing) = conflict
                    .iter()
                    .find(|name| !columns.iter().any(|column| column.name() == name.as_str()))
                {
                    return Err(StatementError::ConflictColumnNotWritten(missing.clone()));
                }
                Ok(())
            }
            Self::Update {
                columns,
                conditions,
            } => {
                non_empty_columns(columns)?;
                non_empty_conditions(conditions)
            }
            Self::Delete { conditions } => non_empty_conditions(conditions),
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Upsert { .. } => "upsert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

fn non_empty_columns(columns: &[Column]) -> Result<(), StatementError> {
    if columns.is_empty() {
        Err(StatementError::NoColumns)
    } else {
        Ok(())
    }
}

fn non_empty_conditions(conditions: &[Condition]) -> Result<(), StatementError> {
    if conditions.is_empty() {
        Err(StatementError::NoConditions)
    } else {
        Ok(())
    }
}

/// The projection table a write targets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TableRef {
    /// The projection's own table.
    #[default]
    Base,
    /// A suffix table of the projection, named `<base>_<suffix>`.
    Suffix(String),
}

impl TableRef {
    /// Suffix table reference.
    pub fn suffix(suffix: impl Into<String>) -> Self {
        Self::Suffix(suffix.into())
    }

    /// Concrete table name given the projection's base table.
    pub fn resolve(&self, base: &str) -> String {
        match self {
            Self::Base => base.to_owned(),
            Self::Suffix(suffix) => suffixed_table_name(base, suffix),
        }
    }
}

/// Name of the suffix table `suffix` of `base`.
pub fn suffixed_table_name(base: &str, suffix: &str) -> String {
    format!("{base}_{suffix}")
}

/// A mutation of one projection table.
#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    /// Target table.
    pub table: TableRef,
    /// Mutation to apply.
    pub mutation: Mutation,
}

/// Future returned by a [`TxAction`].
pub type ActionFuture<'a> = BoxFuture<'a, Result<(), StoreError>>;

type ActionFn = dyn for<'a> Fn(&'a mut dyn Transaction) -> ActionFuture<'a> + Send + Sync;

/// Opaque transactional action.
///
/// Receives the active transaction and may run arbitrary writes through it.
/// The action must be idempotent. It runs inside the same savepoint as any
/// other statement, so a returned error undoes everything it wrote.
#[derive(Clone)]
pub struct TxAction(Arc<ActionFn>);

impl TxAction {
    /// Wrap `action`.
    pub fn new<F>(action: F) -> Self
    where
        F: for<'a> Fn(&'a mut dyn Transaction) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        Self(Arc::new(action))
    }

    /// Run the action against `tx`.
    pub fn run<'a>(&self, tx: &'a mut dyn Transaction) -> ActionFuture<'a> {
        (self.0)(tx)
    }
}

impl fmt::Debug for TxAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TxAction")
    }
}

/// What a statement does.
#[derive(Debug, Clone)]
pub enum StatementKind {
    /// One table mutation.
    Write(Write),
    /// Ordered sub statements applied as one unit.
    Multi(Vec<StatementKind>),
    /// Nothing to execute; the checkpoint still advances.
    NoOp,
    /// Opaque action with direct transaction access.
    Action(TxAction),
}

impl StatementKind {
    /// Insert into `table`.
    pub fn create(table: TableRef, columns: Vec<Column>) -> Self {
        Self::Write(Write {
            table,
            mutation: Mutation::Create { columns },
        })
    }

    /// Insert or update on `conflict`.
    pub fn upsert(table: TableRef, columns: Vec<Column>, conflict: Vec<String>) -> Self {
        Self::Write(Write {
            table,
            mutation: Mutation::Upsert { columns, conflict },
        })
    }

    /// Update the rows matching `conditions`.
    pub fn update(table: TableRef, columns: Vec<Column>, conditions: Vec<Condition>) -> Self {
        Self::Write(Write {
            table,
            mutation: Mutation::Update {
                columns,
                conditions,
            },
        })
    }

    /// Delete the rows matching `conditions`.
    pub fn delete(table: TableRef, conditions: Vec<Condition>) -> Self {
        Self::Write(Write {
            table,
            mutation: Mutation::Delete { conditions },
        })
    }

    /// Check every write is executable.
    pub fn validate(&self) -> Result<(), StatementError> {
        match self {
            Self::Write(write) => write.mutation.validate(),
            Self::Multi(statements) if statements.is_empty() => Err(StatementError::EmptyMulti),
            Self::Multi(statements) => statements.iter().try_for_each(Self::validate),
            Self::NoOp | Self::Action(_) => Ok(()),
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Write(write) => write.mutation.kind(),
            Self::Multi(_) => "multi",
            Self::NoOp => "no_op",
            Self::Action(_) => "action",
        }
    }
}

/// A statement together with the event it was derived from.
#[derive(Debug, Clone)]
pub struct Statement {
    origin: Origin,
    kind: StatementKind,
}

impl Statement {
    /// Statement derived from `event`.
    pub fn new(event: &Event, kind: StatementKind) -> Self {
        Self {
            origin: event.origin(),
            kind,
        }
    }

    /// Insert into `table`.
    pub fn create(event: &Event, table: TableRef, columns: Vec<Column>) -> Self {
        Self::new(event, StatementKind::create(table, columns))
    }

    /// Insert into `table`, updating the row identified by `conflict` if it exists.
    pub fn upsert(
        event: &Event,
        table: TableRef,
        columns: Vec<Column>,
        conflict: Vec<String>,
    ) -> Self {
        Self::new(event, StatementKind::upsert(table, columns, conflict))
    }

    /// Update the rows of `table` matching `conditions`.
    pub fn update(
        event: &Event,
        table: TableRef,
        columns: Vec<Column>,
        conditions: Vec<Condition>,
    ) -> Self {
        Self::new(event, StatementKind::update(table, columns, conditions))
    }

    /// Delete the rows of `table` matching `conditions`.
    pub fn delete(event: &Event, table: TableRef, conditions: Vec<Condition>) -> Self {
        Self::new(event, StatementKind::delete(table, conditions))
    }

    /// Apply `statements` in order as one unit.
    pub fn multi(event: &Event, statements: Vec<StatementKind>) -> Self {
        Self::new(event, StatementKind::Multi(statements))
    }

    /// Execute nothing.
    pub fn no_op(event: &Event) -> Self {
        Self::new(event, StatementKind::NoOp)
    }

    /// Run `action` inside the batch transaction.
    pub fn action(event: &Event, action: TxAction) -> Self {
        Self::new(event, StatementKind::Action(action))
    }

    /// Event this statement was derived from.
    pub const fn origin(&self) -> &Origin {
        &self.origin
    }

    /// What the statement does.
    pub const fn kind(&self) -> &StatementKind {
        &self.kind
    }

    /// `true` for a statement that executes nothing.
    pub const fn is_no_op(&self) -> bool {
        matches!(self.kind, StatementKind::NoOp)
    }
}
