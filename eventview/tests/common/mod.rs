//! Shared fixtures for eventview integration tests.
//!
//! `NotesProjection` is a small tenant scoped read model over `note` events
//! whose failing and action reducers can be steered from the test.

// Not every test binary uses every fixture.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use eventview::{
    AggregateId, AggregateReducer, Clock, Column, ColumnDef, ColumnType, Condition, DomainEvent,
    Event, HandlerConfig, InstanceId, Mutation, Projection, ReduceError, Statement, Table,
    TableCheck, TableRef, TxAction, Worker,
};
use eventview_memory::{InMemoryBackend, InMemoryEventSource, PendingEvent};
use serde::{Deserialize, Serialize};

pub const NOTES: &str = "projections.notes";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteAdded {
    pub title: String,
}

impl DomainEvent for NoteAdded {
    const AGGREGATE_TYPE: &'static str = "note";
    const EVENT_TYPE: &'static str = "note.added";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteRenamed {
    pub title: String,
}

impl DomainEvent for NoteRenamed {
    const AGGREGATE_TYPE: &'static str = "note";
    const EVENT_TYPE: &'static str = "note.renamed";
}

/// Projection of notes into `projections.notes`.
///
/// `note.poisoned` fails to reduce until [`NotesProjection::heal`] is called.
/// `note.archived` runs a transactional action counting its invocations.
pub struct NotesProjection {
    name: String,
    healed: Arc<AtomicBool>,
    actions: Arc<AtomicUsize>,
}

impl NotesProjection {
    pub fn new() -> Self {
        Self::named(NOTES)
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healed: Arc::new(AtomicBool::new(false)),
            actions: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    pub fn actions(&self) -> usize {
        self.actions.load(Ordering::SeqCst)
    }
}

fn note_key(event: &Event) -> Vec<Condition> {
    vec![
        Condition::eq("instance_id", event.instance_id.as_str()),
        Condition::eq("id", event.aggregate_id.as_str()),
    ]
}

fn sequence(event: &Event) -> Result<i64, ReduceError> {
    i64::try_from(event.sequence).map_err(|error| ReduceError::Rejected(error.to_string()))
}

impl Projection for NotesProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self) -> Option<TableCheck> {
        Some(TableCheck::new(Table::new(
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("title", ColumnType::Text).nullable(),
                ColumnDef::new("sequence", ColumnType::Int64),
            ],
            ["instance_id", "id"],
        )))
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        let healed = Arc::clone(&self.healed);
        let actions = Arc::clone(&self.actions);
        let table = self.name.clone();

        vec![
            AggregateReducer::new("note")
                .on::<NoteAdded, _>(|event, added| {
                    Ok(Statement::create(
                        event,
                        TableRef::Base,
                        vec![
                            Column::new("instance_id", event.instance_id.as_str()),
                            Column::new("id", event.aggregate_id.as_str()),
                            Column::new("title", added.title),
                            Column::new("sequence", sequence(event)?),
                        ],
                    ))
                })
                .on::<NoteRenamed, _>(|event, renamed| {
                    Ok(Statement::update(
                        event,
                        TableRef::Base,
                        vec![
                            Column::new("title", renamed.title),
                            Column::new("sequence", sequence(event)?),
                        ],
                        note_key(event),
                    ))
                })
                .on_event("note.poisoned", move |event| {
                    if healed.load(Ordering::SeqCst) {
                        Ok(Statement::no_op(event))
                    } else {
                        Err(ReduceError::Rejected("poisoned note".to_string()))
                    }
                })
                .on_event("note.archived", move |event| {
                    let actions = Arc::clone(&actions);
                    let table = table.clone();
                    let conditions = note_key(event);
                    Ok(Statement::action(
                        event,
                        TxAction::new(move |tx| {
                            let actions = Arc::clone(&actions);
                            let table = table.clone();
                            let mutation = Mutation::Update {
                                columns: vec![Column::new("title", "archived")],
                                conditions: conditions.clone(),
                            };
                            Box::pin(async move {
                                actions.fetch_add(1, Ordering::SeqCst);
                                tx.execute(&table, &mutation).await?;
                                Ok(())
                            })
                        }),
                    ))
                }),
            AggregateReducer::instance_removal("instance_id"),
        ]
    }
}

/// Clock advanced by hand.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new() -> Self {
        Self(Mutex::new(Utc::now()))
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.0.lock().expect("clock mutex should not be poisoned");
        *now += TimeDelta::from_std(by).expect("duration fits");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("clock mutex should not be poisoned")
    }
}

pub fn instance(id: &str) -> InstanceId {
    InstanceId::try_new(id.to_string()).expect("valid instance id")
}

pub fn aggregate(id: &str) -> AggregateId {
    AggregateId::try_new(id.to_string()).expect("valid aggregate id")
}

pub fn added(instance_id: &str, note: &str, title: &str) -> PendingEvent {
    PendingEvent::typed(
        aggregate(note),
        instance(instance_id),
        &NoteAdded {
            title: title.to_string(),
        },
    )
    .expect("payload serializes")
}

pub fn renamed(instance_id: &str, note: &str, title: &str) -> PendingEvent {
    PendingEvent::typed(
        aggregate(note),
        instance(instance_id),
        &NoteRenamed {
            title: title.to_string(),
        },
    )
    .expect("payload serializes")
}

pub fn note_event(instance_id: &str, note: &str, event_type: &str) -> PendingEvent {
    PendingEvent::new(
        "note",
        aggregate(note),
        instance(instance_id),
        event_type,
        serde_json::json!({}),
    )
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

/// Memory backend, event log and an initialized worker for `projection`.
pub async fn notes_worker(
    projection: Arc<NotesProjection>,
    config: HandlerConfig,
) -> (Worker, InMemoryBackend, InMemoryEventSource) {
    let backend = InMemoryBackend::new();
    let source = InMemoryEventSource::new();
    let worker = Worker::new(
        projection,
        Arc::new(backend.clone()),
        Arc::new(source.clone()),
        config,
    )
    .expect("valid projection");
    worker.initialize().await.expect("schema initialized");
    (worker, backend, source)
}

pub fn titles(backend: &InMemoryBackend) -> Vec<String> {
    backend
        .rows(NOTES)
        .iter()
        .filter_map(|row| match row.get("title") {
            Some(eventview::Value::Text(title)) => Some(title.clone()),
            _ => None,
        })
        .collect()
}
