use std::ops::Deref;

use async_trait::async_trait;
use eventview_types::{
    AggregateId, AggregateType, Event, EventQuery, EventSource, EventType, InstanceId, Operation,
    Position, SourceError,
};
use sqlx::postgres::PgRow;
use sqlx::{query, Pool, Postgres, Row};
use tracing::{error, instrument};

/// [`EventSource`] over the `eventview_events` table.
#[derive(Debug, Clone)]
pub struct PostgresEventSource {
    pool: Pool<Postgres>,
}

impl PostgresEventSource {
    /// Read events through `pool`.
    pub const fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn names<T: Deref<Target = String>>(values: &[T]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn source_failure(error: &sqlx::Error, operation: Operation) -> SourceError {
    error!(
        error = %error,
        operation = %operation,
        "[postgres.source_error] reading the event log failed"
    );
    SourceError::SourceFailure { operation }
}

#[async_trait]
impl EventSource for PostgresEventSource {
    #[instrument(name = "postgres.fetch_events", skip(self), fields(instance = %query.instance_id))]
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        let after = i64::try_from(query.after.into_inner()).unwrap_or(i64::MAX);
        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);

        let rows = sqlx::query(
            "SELECT position, instance_id, aggregate_type, aggregate_id, resource_owner,
                    event_type, sequence, created_at, payload
             FROM eventview_events
             WHERE instance_id = $1
               AND position > $2
               AND aggregate_type = ANY($3)
               AND (cardinality($4::text[]) = 0 OR event_type = ANY($4))
             ORDER BY position
             LIMIT $5",
        )
        .bind(query.instance_id.as_str())
        .bind(after)
        .bind(names(&query.aggregate_types))
        .bind(names(&query.event_types))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|error| source_failure(&error, Operation::FetchEvents))?;

        rows.iter().map(|row| decode_event(query, row)).collect()
    }

    async fn instance_ids(
        &self,
        aggregate_types: &[AggregateType],
    ) -> Result<Vec<InstanceId>, SourceError> {
        let rows = query(
            "SELECT DISTINCT instance_id FROM eventview_events
             WHERE aggregate_type = ANY($1)
             ORDER BY instance_id",
        )
        .bind(names(aggregate_types))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| source_failure(&error, Operation::ListInstances))?;

        rows.iter()
            .map(|row| {
                let id: String = row
                    .try_get("instance_id")
                    .map_err(|error| source_failure(&error, Operation::ListInstances))?;
                InstanceId::try_new(id).map_err(|_| SourceError::SourceFailure {
                    operation: Operation::ListInstances,
                })
            })
            .collect()
    }
}

fn decode_event(query: &EventQuery, row: &PgRow) -> Result<Event, SourceError> {
    let position: i64 = row
        .try_get("position")
        .map_err(|error| source_failure(&error, Operation::FetchEvents))?;
    let malformed = |detail: String| SourceError::MalformedEvent {
        instance_id: query.instance_id.clone(),
        position: u64::try_from(position).unwrap_or_default(),
        detail,
    };
    let column = |error: sqlx::Error| malformed(error.to_string());

    let instance_id: String = row.try_get("instance_id").map_err(column)?;
    let aggregate_type: String = row.try_get("aggregate_type").map_err(column)?;
    let aggregate_id: String = row.try_get("aggregate_id").map_err(column)?;
    let resource_owner: String = row.try_get("resource_owner").map_err(column)?;
    let event_type: String = row.try_get("event_type").map_err(column)?;
    let sequence: i64 = row.try_get("sequence").map_err(column)?;
    let created_at = row.try_get("created_at").map_err(column)?;
    let payload: serde_json::Value = row.try_get("payload").map_err(column)?;

    Ok(Event {
        aggregate_type: AggregateType::new(aggregate_type),
        aggregate_id: AggregateId::try_new(aggregate_id)
            .map_err(|error| malformed(error.to_string()))?,
        instance_id: InstanceId::try_new(instance_id)
            .map_err(|error| malformed(error.to_string()))?,
        resource_owner,
        event_type: EventType::new(event_type),
        created_at,
        sequence: u64::try_from(sequence).map_err(|error| malformed(error.to_string()))?,
        position: Position::new(
            u64::try_from(position).map_err(|error| malformed(error.to_string()))?,
        ),
        payload,
    })
}
