//! Batch processing of a single projection worker.
//!
//! Scenario: a worker catches one projection up with the event log
//! - Given events for a tenant instance after the stored checkpoint
//! - When the worker runs a batch
//! - Then every event is applied in position order in one transaction
//! - And the checkpoint moves to the last applied event
//! - And a failing event stops the batch without losing the events before it

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    added, instance, instance_removed, note_event, notes_worker, renamed, titles, NotesProjection,
    NOTES,
};
use eventview::{
    AggregateReducer, AggregateType, ApplyError, Backend, BatchOutcome, Column, Event, EventQuery,
    EventSource, HandlerConfig, HandlerError, InstanceId, Position, Projection, ProjectionKey,
    ProjectionName, ReduceError, SourceError, Statement, StoreError, TableCheck, TableRef, Worker,
};
use eventview_memory::{InMemoryBackend, InMemoryEventSource};
use eventview_testing::{ChaosBackend, ChaosConfig, ChaosExt};

fn key(instance_id: &str) -> ProjectionKey {
    ProjectionKey::new(
        ProjectionName::try_new(NOTES.to_string()).expect("valid projection name"),
        instance(instance_id),
    )
}

#[tokio::test]
async fn batch_applies_events_in_order_and_advances_checkpoint() {
    // Given: Three events for one instance
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), HandlerConfig::default()).await;
    source.append_all([
        added("i1", "n1", "first"),
        added("i1", "n2", "second"),
        renamed("i1", "n1", "first, renamed"),
    ]);

    // When: The worker runs one batch
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    // Then: Every event is applied and the checkpoint points at the last one
    assert_eq!(
        outcome,
        BatchOutcome::Applied {
            applied: 3,
            position: Position::new(3),
            more: false,
        }
    );
    assert_eq!(titles(&backend), vec!["first, renamed", "second"]);
    let state = worker
        .state(&instance("i1"))
        .await
        .expect("state loads")
        .expect("checkpoint exists");
    assert_eq!(state.position, Position::new(3));
    assert_eq!(state.last_event.map(|event| event.sequence), Some(2));
}

#[tokio::test]
async fn failing_event_keeps_everything_applied_before_it() {
    // Given: Five events where the third cannot be reduced
    let projection = Arc::new(NotesProjection::new());
    let (worker, backend, source) =
        notes_worker(Arc::clone(&projection), HandlerConfig::default()).await;
    source.append_all([
        added("i1", "n1", "one"),
        added("i1", "n2", "two"),
        note_event("i1", "n1", "note.poisoned"),
        added("i1", "n3", "three"),
        added("i1", "n4", "four"),
    ]);

    // When: The worker runs a batch
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch completes");

    // Then: The first two events are committed and the checkpoint stops before the failure
    assert!(matches!(
        outcome,
        BatchOutcome::Failed {
            applied: 2,
            error: ApplyError::Reduce(ReduceError::Rejected(_)),
            ..
        }
    ));
    assert_eq!(titles(&backend), vec!["one", "two"]);
    let state = worker
        .state(&instance("i1"))
        .await
        .expect("state loads")
        .expect("checkpoint exists");
    assert_eq!(state.position, Position::new(2));
    let failure = state.failure.expect("failure recorded");
    assert_eq!(failure.count, 1);
    assert_eq!(failure.position, Position::new(3));

    // When: The cause is fixed and the worker runs again
    projection.heal();
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    // Then: Processing resumes at the failed event
    assert_eq!(
        outcome,
        BatchOutcome::Applied {
            applied: 3,
            position: Position::new(5),
            more: false,
        }
    );
    assert_eq!(titles(&backend), vec!["one", "two", "three", "four"]);
    let state = worker
        .state(&instance("i1"))
        .await
        .expect("state loads")
        .expect("checkpoint exists");
    assert_eq!(state.failure, None);
}

#[tokio::test]
async fn failing_statement_rolls_back_only_its_own_writes() {
    // Given: The same note added twice, which violates the primary key
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), HandlerConfig::default()).await;
    source.append_all([
        added("i1", "n1", "original"),
        renamed("i1", "n1", "renamed"),
        added("i1", "n1", "duplicate"),
    ]);

    // When: The worker runs a batch
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch completes");

    // Then: The rename survives and the duplicate is reported as a store failure
    assert!(matches!(
        outcome,
        BatchOutcome::Failed {
            applied: 2,
            error: ApplyError::Store(StoreError::ConstraintViolation { .. }),
            ..
        }
    ));
    assert_eq!(titles(&backend), vec!["renamed"]);
}

#[tokio::test]
async fn no_op_statements_still_advance_the_checkpoint() {
    // Given: A projection that reduces its only event to a no-op
    let projection = Arc::new(NotesProjection::new());
    projection.heal();
    let (worker, backend, source) =
        notes_worker(Arc::clone(&projection), HandlerConfig::default()).await;
    source.append(note_event("i1", "n1", "note.poisoned"));

    // When: The worker runs a batch
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    // Then: Nothing is written but the event counts as applied
    assert!(matches!(
        outcome,
        BatchOutcome::Applied { applied: 1, .. }
    ));
    assert!(backend.rows(NOTES).is_empty());
}

#[tokio::test]
async fn update_matching_no_rows_is_not_an_error() {
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), HandlerConfig::default()).await;
    source.append(renamed("i1", "missing", "nobody"));

    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    assert!(matches!(
        outcome,
        BatchOutcome::Applied { applied: 1, .. }
    ));
    assert!(backend.rows(NOTES).is_empty());
}

#[tokio::test]
async fn actions_run_inside_the_batch_transaction() {
    // Given: A note and an event reduced to a transactional action
    let projection = Arc::new(NotesProjection::new());
    let (worker, backend, source) =
        notes_worker(Arc::clone(&projection), HandlerConfig::default()).await;
    source.append_all([
        added("i1", "n1", "draft"),
        note_event("i1", "n1", "note.archived"),
    ]);

    // When: The worker runs a batch
    worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    // Then: The action ran once and its write is committed
    assert_eq!(projection.actions(), 1);
    assert_eq!(titles(&backend), vec!["archived"]);
}

#[tokio::test]
async fn instance_removal_only_touches_its_instance() {
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), HandlerConfig::default()).await;
    source.append_all([
        added("i1", "n1", "kept"),
        added("i2", "n1", "removed"),
        instance_removed("i2"),
    ]);

    worker.run_once().await.expect("tick succeeds");

    assert_eq!(titles(&backend), vec!["kept"]);
}

#[tokio::test]
async fn contended_instance_is_skipped() {
    // Given: Another transaction holding the projection lock of the instance
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), HandlerConfig::default()).await;
    source.append(added("i1", "n1", "waiting"));
    let mut other = backend.begin().await.expect("begin");
    assert!(other.try_lock(&key("i1")).await.expect("lock"));

    // When: The worker runs a batch
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch completes");

    // Then: It backs off without writing
    assert_eq!(outcome, BatchOutcome::Contended);
    assert!(backend.rows(NOTES).is_empty());

    // When: The lock is released
    other.rollback().await.expect("rollback");
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch succeeds");

    // Then: The instance is processed
    assert!(matches!(
        outcome,
        BatchOutcome::Applied { applied: 1, .. }
    ));
}

/// Source that ignores the checkpoint and always returns the whole log.
struct ReplayingSource(InMemoryEventSource);

#[async_trait]
impl EventSource for ReplayingSource {
    async fn fetch_events(&self, query: &EventQuery) -> Result<Vec<Event>, SourceError> {
        let replay = EventQuery {
            after: Position::default(),
            ..query.clone()
        };
        self.0.fetch_events(&replay).await
    }

    async fn instance_ids(
        &self,
        aggregate_types: &[AggregateType],
    ) -> Result<Vec<InstanceId>, SourceError> {
        self.0.instance_ids(aggregate_types).await
    }
}

#[tokio::test]
async fn events_at_or_before_the_checkpoint_are_never_reapplied() {
    // Given: A source redelivering events the worker already applied
    let backend = InMemoryBackend::new();
    let log = InMemoryEventSource::new();
    log.append_all([added("i1", "n1", "one"), added("i1", "n2", "two")]);
    let worker = Worker::new(
        Arc::new(NotesProjection::new()),
        Arc::new(backend.clone()),
        Arc::new(ReplayingSource(log.clone())),
        HandlerConfig::default(),
    )
    .expect("valid projection");
    worker.initialize().await.expect("schema initialized");
    worker
        .process_batch(&instance("i1"))
        .await
        .expect("first batch succeeds");

    // When: The worker runs again after one more event
    log.append(added("i1", "n3", "three"));
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("second batch succeeds");

    // Then: Only the new event is applied, no duplicate key is hit
    assert_eq!(
        outcome,
        BatchOutcome::Applied {
            applied: 1,
            position: Position::new(3),
            more: false,
        }
    );
    assert_eq!(titles(&backend), vec!["one", "two", "three"]);
}

#[tokio::test]
async fn full_batches_report_a_backlog() {
    // Given: Three events and a bulk limit of two
    let config = HandlerConfig {
        bulk_limit: 2,
        ..HandlerConfig::default()
    };
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), config).await;
    source.append_all([
        added("i1", "n1", "one"),
        added("i1", "n2", "two"),
        added("i1", "n3", "three"),
    ]);

    // When: The worker ticks once
    let first = worker.run_once().await.expect("tick succeeds");

    // Then: One batch ran and a backlog remains
    assert_eq!(first.applied, 2);
    assert!(first.backlog);

    // When: It ticks again
    let second = worker.run_once().await.expect("tick succeeds");

    // Then: The instance is caught up
    assert_eq!(second.applied, 1);
    assert!(!second.backlog);
    assert_eq!(backend.rows(NOTES).len(), 3);
}

#[tokio::test]
async fn max_iterators_drains_several_batches_per_tick() {
    let config = HandlerConfig {
        bulk_limit: 2,
        max_iterators: 3,
        ..HandlerConfig::default()
    };
    let (worker, backend, source) =
        notes_worker(Arc::new(NotesProjection::new()), config).await;
    source.append_all((1..=5).map(|n| added("i1", &format!("n{n}"), "note")));

    let report = worker.run_once().await.expect("tick succeeds");

    assert_eq!(report.applied, 5);
    assert!(!report.backlog);
    assert_eq!(backend.rows(NOTES).len(), 5);
}

#[tokio::test]
async fn unreachable_event_source_fails_the_tick() {
    // Given: An event source that always fails
    let source = InMemoryEventSource::new();
    source.append(added("i1", "n1", "never read"));
    let worker = Worker::new(
        Arc::new(NotesProjection::new()),
        Arc::new(InMemoryBackend::new()),
        Arc::new(source.with_chaos(ChaosConfig::deterministic().with_failure_probability(1.0))),
        HandlerConfig::default(),
    )
    .expect("valid projection");

    // When: The worker ticks
    let result = worker.run_once().await;

    // Then: The tick reports the source failure
    assert!(matches!(
        result,
        Err(HandlerError::Source(SourceError::SourceFailure { .. }))
    ));
}

#[tokio::test]
async fn store_failures_are_counted_per_instance() {
    // Given: A backend that can no longer open transactions
    let backend = InMemoryBackend::new();
    let source = InMemoryEventSource::new();
    let projection = Arc::new(NotesProjection::new());
    Worker::new(
        Arc::clone(&projection) as Arc<dyn eventview::Projection>,
        Arc::new(backend.clone()),
        Arc::new(source.clone()),
        HandlerConfig::default(),
    )
    .expect("valid projection")
    .initialize()
    .await
    .expect("schema initialized");
    source.append_all([added("i1", "n1", "one"), added("i2", "n1", "two")]);
    let worker = Worker::new(
        projection,
        Arc::new(ChaosBackend::new(
            backend.clone(),
            ChaosConfig::deterministic().with_failure_probability(1.0),
        )),
        Arc::new(source),
        HandlerConfig::default(),
    )
    .expect("valid projection");

    // When: The worker ticks
    let report = worker.run_once().await.expect("tick completes");

    // Then: Every instance is reported as errored and nothing is written
    assert_eq!(report.instances, 2);
    assert_eq!(report.errors, 2);
    assert_eq!(report.applied, 0);
    assert!(backend.rows(NOTES).is_empty());
}

struct MisattributedProjection;

impl Projection for MisattributedProjection {
    fn name(&self) -> &str {
        "projections.misattributed"
    }

    fn init(&self) -> Option<TableCheck> {
        None
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![AggregateReducer::new("note").on_event("note.added", |event| {
            let mut earlier = event.clone();
            earlier.position = Position::new(0);
            Ok(Statement::create(
                &earlier,
                TableRef::Base,
                vec![Column::new("title", "stale")],
            ))
        })]
    }
}

#[tokio::test]
async fn statement_built_from_another_event_is_rejected() {
    let backend = InMemoryBackend::new();
    let source = InMemoryEventSource::new();
    source.append(added("i1", "n1", "one"));
    let worker = Worker::new(
        Arc::new(MisattributedProjection),
        Arc::new(backend),
        Arc::new(source),
        HandlerConfig::default(),
    )
    .expect("valid projection");

    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch completes");

    assert_eq!(
        outcome,
        BatchOutcome::Failed {
            applied: 0,
            position: Position::new(1),
            error: ApplyError::ForeignStatement {
                expected: Position::new(1),
                found: Position::new(0),
            },
        }
    );
}
