use async_trait::async_trait;

use crate::error::SourceError;
use crate::event::{AggregateType, Event, EventType, InstanceId, Position};

/// Which events a worker wants next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    /// Only events of this instance.
    pub instance_id: InstanceId,
    /// Only events strictly after this position.
    pub after: Position,
    /// Only events of these aggregate types.
    pub aggregate_types: Vec<AggregateType>,
    /// Only events of these event types. Empty means every type.
    pub event_types: Vec<EventType>,
    /// At most this many events.
    pub limit: u64,
}

impl EventQuery {
    /// Whether `event` satisfies every filter except the limit.
    pub fn matches(&self, event: &Event) -> bool {
        event.instance_id == self.instance_id
            && event.position > self.after
            && self.aggregate_types.contains(&event.aggregate_type)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
    }
}

/// Read side of the event log.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Events matching `query`, ascending by global position.
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError>;

    /// Instances with at least one event of `aggregate_types`.
    async fn instance_ids(
        &self,
        aggregate_types: &[AggregateType],
    ) -> Result<Vec<InstanceId>, SourceError>;
}
