//! Shared vocabulary of the eventview projection engine.
//!
//! This crate holds the types every other eventview crate agrees on:
//!
//! - [`Event`] and its identifiers, as read from the event log
//! - the statement model reducers produce ([`Statement`], [`Mutation`],
//!   [`Column`], [`Condition`])
//! - declarative table schemas ([`TableCheck`])
//! - the contracts of the external collaborators ([`EventSource`],
//!   [`Backend`], [`Transaction`], [`PositionStore`])

mod error;
mod event;
mod schema;
mod source;
mod statement;
mod store;

pub use error::{Operation, ReduceError, SchemaError, SourceError, StatementError, StoreError};
pub use event::{AggregateId, AggregateType, DomainEvent, Event, EventType, InstanceId, Origin, Position};
pub use schema::{
    plan_changes, ColumnDef, ColumnType, ExistingColumn, ForeignKey, ForeignKeyTarget, Index,
    ResolvedForeignKey, SchemaChanges, SuffixTable, Table, TableCheck, TableDefinition,
    DEFAULT_INSTANCE_COLUMN,
};
pub use source::{EventQuery, EventSource};
pub use statement::{
    suffixed_table_name, ActionFuture, Column, ColumnMode, Comparison, Condition, Mutation,
    Statement, StatementKind, TableRef, TxAction, Value, Write,
};
pub use store::{
    AppliedEvent, Backend, FailureRecord, PositionStore, ProjectionKey, ProjectionName,
    ProjectionState, Transaction,
};
