use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eventview_types::{
    AggregateId, AggregateType, DomainEvent, Event, EventQuery, EventSource, EventType,
    InstanceId, Position, SourceError,
};
use parking_lot::RwLock;
use serde::Serialize;

/// An event about to be appended to an [`InMemoryEventSource`].
///
/// The log assigns the position and the per-aggregate sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Aggregate id.
    pub aggregate_id: AggregateId,
    /// Tenant instance.
    pub instance_id: InstanceId,
    /// Owning organization, the aggregate id unless set otherwise.
    pub resource_owner: String,
    /// Event type.
    pub event_type: EventType,
    /// Creation time, now unless set otherwise.
    pub created_at: Option<DateTime<Utc>>,
    /// Event payload.
    pub payload: serde_json::Value,
}

impl PendingEvent {
    /// Untyped event.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: AggregateId,
        instance_id: InstanceId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_type: AggregateType::new(aggregate_type.into()),
            resource_owner: aggregate_id.to_string(),
            aggregate_id,
            instance_id,
            event_type: EventType::new(event_type.into()),
            created_at: None,
            payload,
        }
    }

    /// Event carrying `payload` under its declared aggregate and event type.
    pub fn typed<T>(
        aggregate_id: AggregateId,
        instance_id: InstanceId,
        payload: &T,
    ) -> Result<Self, serde_json::Error>
    where
        T: DomainEvent + Serialize,
    {
        Ok(Self::new(
            T::AGGREGATE_TYPE,
            aggregate_id,
            instance_id,
            T::EVENT_TYPE,
            serde_json::to_value(payload)?,
        ))
    }

    /// Set the owning organization.
    #[must_use]
    pub fn with_resource_owner(mut self, resource_owner: impl Into<String>) -> Self {
        self.resource_owner = resource_owner.into();
        self
    }

    /// Set the creation time.
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

#[derive(Debug, Default)]
struct EventLog {
    events: Vec<Event>,
    sequences: HashMap<(AggregateType, AggregateId), u64>,
}

/// Append-only in-memory event log.
///
/// Positions start at 1 and grow by one per appended event. Clones share the
/// same log.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventSource {
    log: Arc<RwLock<EventLog>>,
}

impl InMemoryEventSource {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `pending`, returning the stored event.
    pub fn append(&self, pending: PendingEvent) -> Event {
        let mut log = self.log.write();
        let sequence = log
            .sequences
            .entry((pending.aggregate_type.clone(), pending.aggregate_id.clone()))
            .or_insert(0);
        *sequence += 1;
        let sequence = *sequence;

        let event = Event {
            aggregate_type: pending.aggregate_type,
            aggregate_id: pending.aggregate_id,
            instance_id: pending.instance_id,
            resource_owner: pending.resource_owner,
            event_type: pending.event_type,
            created_at: pending.created_at.unwrap_or_else(Utc::now),
            sequence,
            position: Position::new(log.events.len() as u64 + 1),
            payload: pending.payload,
        };
        log.events.push(event.clone());
        event
    }

    /// Append every event of `pending` in order.
    pub fn append_all(&self, pending: impl IntoIterator<Item = PendingEvent>) -> Vec<Event> {
        pending.into_iter().map(|event| self.append(event)).collect()
    }

    /// Every stored event.
    pub fn events(&self) -> Vec<Event> {
        self.log.read().events.clone()
    }
}

#[async_trait]
impl EventSource for InMemoryEventSource {
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        let limit = usize::try_from(query.limit).unwrap_or(usize::MAX);
        Ok(self
            .log
            .read()
            .events
            .iter()
            .filter(|event| query.matches(event))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn instance_ids(
        &self,
        aggregate_types: &[AggregateType],
    ) -> Result<Vec<InstanceId>, SourceError> {
        let mut instances: Vec<InstanceId> = self
            .log
            .read()
            .events
            .iter()
            .filter(|event| aggregate_types.contains(&event.aggregate_type))
            .map(|event| event.instance_id.clone())
            .collect();
        instances.sort();
        instances.dedup();
        Ok(instances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(aggregate: &str, instance: &str, event_type: &str) -> PendingEvent {
        PendingEvent::new(
            "org",
            AggregateId::try_new(aggregate.to_string()).expect("valid aggregate id"),
            InstanceId::try_new(instance.to_string()).expect("valid instance id"),
            event_type,
            json!({}),
        )
    }

    fn query(instance: &str, after: u64, limit: u64) -> EventQuery {
        EventQuery {
            instance_id: InstanceId::try_new(instance.to_string()).expect("valid instance id"),
            after: Position::new(after),
            aggregate_types: vec![AggregateType::new("org".to_string())],
            event_types: Vec::new(),
            limit,
        }
    }

    #[test]
    fn positions_are_global_and_sequences_per_aggregate() {
        let source = InMemoryEventSource::new();

        let events = source.append_all([
            pending("o1", "i1", "org.added"),
            pending("o2", "i1", "org.added"),
            pending("o1", "i1", "org.changed"),
        ]);

        let positions: Vec<u64> = events.iter().map(|event| event.position.into_inner()).collect();
        let sequences: Vec<u64> = events.iter().map(|event| event.sequence).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(sequences, vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn fetch_filters_by_instance_position_and_limit() {
        let source = InMemoryEventSource::new();
        source.append_all([
            pending("o1", "i1", "org.added"),
            pending("o2", "i2", "org.added"),
            pending("o1", "i1", "org.changed"),
            pending("o1", "i1", "org.removed"),
        ]);

        let events = source
            .fetch_events(&query("i1", 1, 1))
            .await
            .expect("fetch succeeds");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position, Position::new(3));
    }

    #[tokio::test]
    async fn instance_ids_are_distinct() {
        let source = InMemoryEventSource::new();
        source.append_all([
            pending("o1", "i2", "org.added"),
            pending("o2", "i1", "org.added"),
            pending("o3", "i2", "org.added"),
        ]);

        let instances = source
            .instance_ids(&[AggregateType::new("org".to_string())])
            .await
            .expect("listing succeeds");

        assert_eq!(instances.len(), 2);
    }
}
