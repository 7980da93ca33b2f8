//! Shared fixtures for the example projection tests.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::sync::Arc;

use eventview::{
    AggregateId, Backend, DomainEvent, HandlerConfig, InstanceId, PositionStore, Projection,
    ProjectionKey, ProjectionState, Value, Worker,
};
use eventview_memory::{InMemoryBackend, InMemoryEventSource, PendingEvent, Row};
use serde::Serialize;

/// A projection wired to an in-memory store and event log.
pub struct Harness {
    pub worker: Worker,
    pub backend: InMemoryBackend,
    pub source: InMemoryEventSource,
}

impl Harness {
    pub async fn new(projection: impl Projection + 'static) -> Self {
        let backend = InMemoryBackend::new();
        let source = InMemoryEventSource::new();
        let config = HandlerConfig {
            max_iterators: 100,
            ..HandlerConfig::default()
        };
        let worker = Worker::new(
            Arc::new(projection),
            Arc::new(backend.clone()),
            Arc::new(source.clone()),
            config,
        )
        .expect("valid projection");
        worker.initialize().await.expect("schema initialized");
        Self {
            worker,
            backend,
            source,
        }
    }

    /// Append `payload` as an event of aggregate `aggregate_id` in `instance_id`.
    pub fn append<T>(&self, instance_id: &str, aggregate_id: &str, payload: &T)
    where
        T: DomainEvent + Serialize,
    {
        self.source.append(
            PendingEvent::typed(aggregate(aggregate_id), instance(instance_id), payload)
                .expect("payload serializes"),
        );
    }

    pub fn append_pending(&self, pending: PendingEvent) {
        self.source.append(pending);
    }

    /// Run ticks until every instance is caught up.
    pub async fn catch_up(&self) {
        loop {
            let report = self.worker.run_once().await.expect("tick should succeed");
            assert_eq!(report.failed, 0, "no event should fail: {report:?}");
            if !report.backlog {
                break;
            }
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.backend.rows(table)
    }

    /// Move the checkpoint of `instance_id` back to the start of the log.
    pub async fn rewind(&self, instance_id: &str) {
        let key = ProjectionKey::new(self.worker.name().clone(), instance(instance_id));
        let mut tx = self.backend.begin().await.expect("transaction begins");
        tx.save_state(&key, &ProjectionState::default())
            .await
            .expect("state saved");
        tx.commit().await.expect("rewind committed");
    }

    pub async fn position(&self, instance_id: &str) -> u64 {
        self.worker
            .state(&instance(instance_id))
            .await
            .expect("state readable")
            .map_or(0, |state| state.position.into_inner())
    }
}

pub fn instance(id: &str) -> InstanceId {
    InstanceId::try_new(id.to_string()).expect("valid instance id")
}

pub fn aggregate(id: &str) -> AggregateId {
    AggregateId::try_new(id.to_string()).expect("valid aggregate id")
}

pub fn instance_removed(instance_id: &str) -> PendingEvent {
    PendingEvent::new(
        "instance",
        aggregate(instance_id),
        instance(instance_id),
        "instance.removed",
        serde_json::json!({}),
    )
}

pub fn text(row: &Row, column: &str) -> String {
    match row.get(column) {
        Some(Value::Text(text)) => text.clone(),
        other => panic!("{column} is not text: {other:?}"),
    }
}

pub fn flag(row: &Row, column: &str) -> bool {
    match row.get(column) {
        Some(Value::Bool(flag)) => *flag,
        other => panic!("{column} is not a flag: {other:?}"),
    }
}
