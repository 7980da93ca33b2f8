//! A worker projecting events read from `eventview_events` into PostgreSQL.

mod common;

use std::sync::Arc;

use eventview::{
    AggregateReducer, BatchOutcome, Column, ColumnDef, ColumnType, Condition, Event,
    HandlerConfig, InstanceId, Position, Projection, ReduceError, Statement, Table, TableCheck,
    TableRef, Worker,
};
use eventview_postgres::PostgresEventSource;
use serde_json::json;

use crate::common::PostgresTestFixture;

const USERS: &str = "projections.users";

struct UsersProjection;

fn user_name(event: &Event) -> Result<String, ReduceError> {
    event.payload["name"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| ReduceError::Rejected("name missing".to_string()))
}

impl Projection for UsersProjection {
    fn name(&self) -> &str {
        USERS
    }

    fn init(&self) -> Option<TableCheck> {
        Some(TableCheck::new(Table::new(
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("name", ColumnType::Text),
            ],
            ["instance_id", "id"],
        )))
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new("user")
                .on_event("user.added", |event| {
                    Ok(Statement::create(
                        event,
                        TableRef::Base,
                        vec![
                            Column::new("instance_id", event.instance_id.as_str()),
                            Column::new("id", event.aggregate_id.as_str()),
                            Column::new("name", user_name(event)?),
                        ],
                    ))
                })
                .on_event("user.renamed", |event| {
                    Ok(Statement::update(
                        event,
                        TableRef::Base,
                        vec![Column::new("name", user_name(event)?)],
                        vec![
                            Condition::eq("instance_id", event.instance_id.as_str()),
                            Condition::eq("id", event.aggregate_id.as_str()),
                        ],
                    ))
                }),
            AggregateReducer::instance_removal("instance_id"),
        ]
    }
}

fn instance(id: &str) -> InstanceId {
    InstanceId::try_new(id.to_string()).expect("valid instance id")
}

async fn users_worker(fixture: &PostgresTestFixture) -> Worker {
    let source = PostgresEventSource::new(fixture.backend.pool().clone());
    let worker = Worker::new(
        Arc::new(UsersProjection),
        Arc::new(fixture.backend.clone()),
        Arc::new(source),
        HandlerConfig::default(),
    )
    .expect("valid projection");
    worker.initialize().await.expect("schema initialized");
    worker
}

async fn names(fixture: &PostgresTestFixture, instance_id: &str) -> Vec<String> {
    sqlx::query_scalar(
        r#"SELECT name FROM "projections"."users" WHERE instance_id = $1 ORDER BY id"#,
    )
    .bind(instance_id)
    .fetch_all(fixture.backend.pool())
    .await
    .expect("users should be readable")
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn worker_projects_the_event_log_and_checkpoints_it() {
    // Given: two users and a rename in the event log
    let fixture = PostgresTestFixture::new().await;
    let worker = users_worker(&fixture).await;
    fixture
        .append_event("i1", "user", "u1", "user.added", json!({"name": "ada"}))
        .await;
    fixture
        .append_event("i1", "user", "u2", "user.added", json!({"name": "grace"}))
        .await;
    let last = fixture
        .append_event("i1", "user", "u1", "user.renamed", json!({"name": "lovelace"}))
        .await;

    // When: the worker runs one tick
    let report = worker.run_once().await.expect("tick should succeed");

    // Then: the table reflects the log and the checkpoint is the last position
    assert_eq!(report.applied, 3);
    assert_eq!(names(&fixture, "i1").await, vec!["lovelace", "grace"]);
    let state = worker
        .state(&instance("i1"))
        .await
        .expect("state readable")
        .expect("state saved");
    assert_eq!(
        state.position,
        Position::new(u64::try_from(last).expect("positive position"))
    );
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn constraint_violations_are_recorded_as_failures() {
    // Given: a user added twice under the same id
    let fixture = PostgresTestFixture::new().await;
    let worker = users_worker(&fixture).await;
    fixture
        .append_event("i1", "user", "u1", "user.added", json!({"name": "ada"}))
        .await;
    fixture
        .append_event("i1", "user", "u1", "user.added", json!({"name": "again"}))
        .await;

    // When: the batch runs
    let outcome = worker
        .process_batch(&instance("i1"))
        .await
        .expect("batch should run");

    // Then: the first event is kept and the failure persists in the state row
    assert!(matches!(outcome, BatchOutcome::Failed { applied: 1, .. }));
    assert_eq!(names(&fixture, "i1").await, vec!["ada"]);
    let state = worker
        .state(&instance("i1"))
        .await
        .expect("state readable")
        .expect("state saved");
    assert_eq!(state.failure_count(), 1);
}

#[tokio::test]
#[ignore = "requires a docker daemon"]
async fn instance_removal_only_clears_its_own_rows() {
    // Given: users in two instances
    let fixture = PostgresTestFixture::new().await;
    let worker = users_worker(&fixture).await;
    fixture
        .append_event("i1", "user", "u1", "user.added", json!({"name": "ada"}))
        .await;
    fixture
        .append_event("i2", "user", "u2", "user.added", json!({"name": "grace"}))
        .await;
    fixture
        .append_event("i1", "instance", "i1", "instance.removed", json!({}))
        .await;

    // When: both instances are processed
    worker.run_once().await.expect("tick should succeed");

    // Then: only the removed instance is empty
    assert!(names(&fixture, "i1").await.is_empty());
    assert_eq!(names(&fixture, "i2").await, vec!["grace"]);
}
