//! Dispatch of events to the reducers a projection registered.

use std::collections::HashMap;
use std::sync::Arc;

use eventview_types::{
    AggregateType, Condition, DomainEvent, Event, EventType, ReduceError, Statement, TableRef,
};
use tracing::debug;

/// Aggregate type of tenant instances.
pub const INSTANCE_AGGREGATE: &str = "instance";
/// Event removing a whole tenant instance.
pub const INSTANCE_REMOVED: &str = "instance.removed";

/// Pure function turning one event into one statement.
pub type ReduceFn = Arc<dyn Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync>;

/// Reducer for one event type.
#[derive(Clone)]
pub struct EventReducer {
    event_type: EventType,
    reduce: ReduceFn,
}

impl EventReducer {
    /// Reducer for events of `event_type`.
    pub fn new<F>(event_type: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        Self {
            event_type: EventType::new(event_type.into()),
            reduce: Arc::new(reduce),
        }
    }

    /// Reducer receiving the payload already decoded as `T`.
    pub fn typed<T, F>(reduce: F) -> Self
    where
        T: DomainEvent,
        F: Fn(&Event, T) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        Self::new(T::EVENT_TYPE, move |event| {
            let payload = event.decode::<T>()?;
            reduce(event, payload)
        })
    }

    /// Event type handled.
    pub const fn event_type(&self) -> &EventType {
        &self.event_type
    }
}

impl std::fmt::Debug for EventReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReducer")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Reducers for the events of one aggregate type.
#[derive(Debug, Clone)]
pub struct AggregateReducer {
    aggregate_type: AggregateType,
    reducers: Vec<EventReducer>,
}

impl AggregateReducer {
    /// No reducers yet for `aggregate_type`.
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: AggregateType::new(aggregate_type.into()),
            reducers: Vec::new(),
        }
    }

    /// Reduce `T` with `reduce`.
    #[must_use]
    pub fn on<T, F>(mut self, reduce: F) -> Self
    where
        T: DomainEvent,
        F: Fn(&Event, T) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        self.reducers.push(EventReducer::typed::<T, F>(reduce));
        self
    }

    /// Reduce untyped events of `event_type` with `reduce`.
    #[must_use]
    pub fn on_event<F>(mut self, event_type: impl Into<String>, reduce: F) -> Self
    where
        F: Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static,
    {
        self.reducers.push(EventReducer::new(event_type, reduce));
        self
    }

    /// The `instance.removed` reducer every tenant scoped projection shares.
    pub fn instance_removal(instance_column: impl Into<String>) -> Self {
        Self::new(INSTANCE_AGGREGATE).on_event(INSTANCE_REMOVED, instance_removed(instance_column))
    }

    /// Aggregate type handled.
    pub const fn aggregate_type(&self) -> &AggregateType {
        &self.aggregate_type
    }

    /// Event reducers, in registration order.
    pub fn reducers(&self) -> &[EventReducer] {
        &self.reducers
    }
}

/// Miswired reducer registrations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The projection registered no reducers.
    #[error("no reducers registered")]
    Empty,

    /// Two reducers claim the same event.
    #[error("{event_type} of {aggregate_type} is registered twice")]
    Duplicate {
        aggregate_type: AggregateType,
        event_type: EventType,
    },
}

/// Static map from (aggregate type, event type) to reducer.
pub struct ReducerTable {
    reducers: HashMap<AggregateType, HashMap<EventType, ReduceFn>>,
    aggregate_types: Vec<AggregateType>,
    event_types: Vec<EventType>,
}

impl ReducerTable {
    /// Build the table, rejecting duplicate registrations.
    pub fn new(aggregates: Vec<AggregateReducer>) -> Result<Self, DispatchError> {
        let mut reducers: HashMap<AggregateType, HashMap<EventType, ReduceFn>> = HashMap::new();
        let mut aggregate_types = Vec::new();
        let mut event_types = Vec::new();

        for aggregate in aggregates {
            let by_event = reducers.entry(aggregate.aggregate_type.clone()).or_default();
            if !aggregate_types.contains(&aggregate.aggregate_type) {
                aggregate_types.push(aggregate.aggregate_type.clone());
            }
            for reducer in aggregate.reducers {
                if by_event.contains_key(&reducer.event_type) {
                    return Err(DispatchError::Duplicate {
                        aggregate_type: aggregate.aggregate_type,
                        event_type: reducer.event_type,
                    });
                }
                if !event_types.contains(&reducer.event_type) {
                    event_types.push(reducer.event_type.clone());
                }
                by_event.insert(reducer.event_type, reducer.reduce);
            }
        }

        if event_types.is_empty() {
            return Err(DispatchError::Empty);
        }

        Ok(Self {
            reducers,
            aggregate_types,
            event_types,
        })
    }

    /// Reduce `event`.
    ///
    /// Events without a registered reducer reduce to a no-op so newer event
    /// types in the log never block a projection.
    pub fn reduce(&self, event: &Event) -> Result<Statement, ReduceError> {
        let reducer = self
            .reducers
            .get(&event.aggregate_type)
            .and_then(|by_event| by_event.get(&event.event_type));

        match reducer {
            Some(reduce) => reduce(event),
            None => {
                debug!(
                    aggregate_type = %event.aggregate_type,
                    event_type = %event.event_type,
                    position = %event.position,
                    "[reducer.skip] no reducer registered"
                );
                Ok(Statement::no_op(event))
            }
        }
    }

    /// Aggregate types to fetch.
    pub fn aggregate_types(&self) -> &[AggregateType] {
        &self.aggregate_types
    }

    /// Event types to fetch.
    pub fn event_types(&self) -> &[EventType] {
        &self.event_types
    }
}

impl std::fmt::Debug for ReducerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerTable")
            .field("aggregate_types", &self.aggregate_types)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

/// Delete every row of the base table belonging to the removed instance.
///
/// Suffix tables declared with [`eventview_types::ForeignKey::of_public_keys`]
/// follow through their cascading foreign key.
pub fn instance_removed(
    instance_column: impl Into<String>,
) -> impl Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static {
    let instance_column = instance_column.into();
    move |event| {
        Ok(Statement::delete(
            event,
            TableRef::Base,
            vec![Condition::eq(
                instance_column.as_str(),
                event.instance_id.as_str(),
            )],
        ))
    }
}

/// Delete every row of the base table owned by the removed aggregate.
///
/// Used for `org.removed` style events: the removed aggregate's id is the
/// resource owner of the rows to drop.
pub fn owner_removed(
    instance_column: impl Into<String>,
    owner_column: impl Into<String>,
) -> impl Fn(&Event) -> Result<Statement, ReduceError> + Send + Sync + 'static {
    let instance_column = instance_column.into();
    let owner_column = owner_column.into();
    move |event| {
        Ok(Statement::delete(
            event,
            TableRef::Base,
            vec![
                Condition::eq(instance_column.as_str(), event.instance_id.as_str()),
                Condition::eq(owner_column.as_str(), event.aggregate_id.as_str()),
            ],
        ))
    }
}
