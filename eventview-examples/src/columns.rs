//! Column names and values shared by the example projections.

use eventview::{Column, Condition, Event, ReduceError};

pub const INSTANCE_ID: &str = "instance_id";
pub const CREATION_DATE: &str = "creation_date";
pub const CHANGE_DATE: &str = "change_date";
pub const SEQUENCE: &str = "sequence";
pub const RESOURCE_OWNER: &str = "resource_owner";

pub fn sequence(event: &Event) -> Result<i64, ReduceError> {
    i64::try_from(event.sequence)
        .map_err(|_| ReduceError::Rejected(format!("sequence {} out of range", event.sequence)))
}

/// `change_date` and `sequence` of `event`, written by every update.
pub fn changed(event: &Event) -> Result<Vec<Column>, ReduceError> {
    Ok(vec![
        Column::new(CHANGE_DATE, event.created_at),
        Column::new(SEQUENCE, sequence(event)?),
    ])
}

/// Columns every created row carries. Rows are upserted on their primary
/// key, so replaying a creation keeps the first `creation_date`.
pub fn created(event: &Event) -> Result<Vec<Column>, ReduceError> {
    let mut columns = vec![
        Column::new(INSTANCE_ID, event.instance_id.as_str()),
        Column::insert_only(CREATION_DATE, event.created_at),
        Column::new(RESOURCE_OWNER, event.resource_owner.as_str()),
    ];
    columns.extend(changed(event)?);
    Ok(columns)
}

/// Conflict target of an upsert on `columns`.
pub fn key(columns: &[&str]) -> Vec<String> {
    columns.iter().map(ToString::to_string).collect()
}

pub fn instance(event: &Event) -> Condition {
    Condition::eq(INSTANCE_ID, event.instance_id.as_str())
}
