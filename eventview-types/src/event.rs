//! Events as the projection engine consumes them.
//!
//! Events are owned by the external event log. The engine only ever reads
//! them, so every field here is a plain value that reducers inspect to build
//! their statements.

use chrono::{DateTime, Utc};
use nutype::nutype;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ReduceError;

/// Global ordering position of an event in the log.
///
/// Positions form a total order across every aggregate and are what
/// projection checkpoints store. Position 0 means "nothing processed yet";
/// the first stored event always has a position greater than zero.
#[nutype(
    default = 0,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct Position(u64);

/// Name of an aggregate kind, such as `org` or `instance`.
#[nutype(derive(
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
))]
pub struct AggregateType(String);

/// Name of an event kind, such as `org.added`.
#[nutype(derive(
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
))]
pub struct EventType(String);

/// Identifier of one aggregate.
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
pub struct AggregateId(String);

/// Tenant instance every event, row and checkpoint is scoped to.
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
pub struct InstanceId(String);

/// An immutable fact read from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Kind of aggregate that emitted the event.
    pub aggregate_type: AggregateType,
    /// Aggregate that emitted the event.
    pub aggregate_id: AggregateId,
    /// Tenant instance the aggregate belongs to.
    pub instance_id: InstanceId,
    /// Organization (or instance) owning the aggregate.
    pub resource_owner: String,
    /// Kind of event.
    pub event_type: EventType,
    /// Time the event was appended.
    pub created_at: DateTime<Utc>,
    /// Per-aggregate sequence, strictly increasing and gapless.
    pub sequence: u64,
    /// Global position in the log.
    pub position: Position,
    /// Opaque payload, decoded by reducers via [`Event::decode`].
    pub payload: serde_json::Value,
}

impl Event {
    /// Decode the payload into the concrete event `T`.
    ///
    /// Fails with [`ReduceError::UnexpectedEvent`] when the event is not of
    /// `T`'s aggregate and event type. Dispatch is keyed by exactly those two
    /// values, so that error signals a miswired reducer table.
    pub fn decode<T: DomainEvent>(&self) -> Result<T, ReduceError> {
        if self.aggregate_type.as_str() != T::AGGREGATE_TYPE
            || self.event_type.as_str() != T::EVENT_TYPE
        {
            return Err(ReduceError::UnexpectedEvent {
                expected: T::EVENT_TYPE,
                actual: self.event_type.clone(),
            });
        }

        serde_json::from_value(self.payload.clone()).map_err(|error| {
            ReduceError::InvalidPayload {
                event_type: self.event_type.clone(),
                detail: error.to_string(),
            }
        })
    }

    /// Bookkeeping data a statement carries back to the worker.
    pub fn origin(&self) -> Origin {
        Origin {
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            instance_id: self.instance_id.clone(),
            sequence: self.sequence,
            position: self.position,
            created_at: self.created_at,
        }
    }
}

/// A concrete, typed event payload.
///
/// Implementors name the aggregate and event type they decode from, which is
/// also the key their reducer is registered under.
pub trait DomainEvent: DeserializeOwned + Send + 'static {
    /// Aggregate type this event belongs to.
    const AGGREGATE_TYPE: &'static str;
    /// Event type string in the log.
    const EVENT_TYPE: &'static str;
}

/// The event a statement was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    /// Aggregate type of the originating event.
    pub aggregate_type: AggregateType,
    /// Aggregate id of the originating event.
    pub aggregate_id: AggregateId,
    /// Instance of the originating event.
    pub instance_id: InstanceId,
    /// Per-aggregate sequence of the originating event.
    pub sequence: u64,
    /// Global position of the originating event.
    pub position: Position,
    /// Creation time of the originating event.
    pub created_at: DateTime<Utc>,
}
