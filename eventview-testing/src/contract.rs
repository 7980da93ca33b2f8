use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eventview_types::{
    AggregateId, AggregateType, AppliedEvent, Backend, Column, ColumnDef, ColumnType, Comparison,
    Condition, FailureRecord, ForeignKey, Index, InstanceId, Mutation, Position, ProjectionKey,
    ProjectionName, ProjectionState, StoreError, SuffixTable, Table, TableCheck, TableDefinition,
    Transaction, Value,
};
use uuid::Uuid;

const INSTANCE: &str = "contract-instance";
const SAVEPOINT: &str = "exec_stmt";

#[derive(Debug)]
pub struct ContractTestFailure {
    scenario: &'static str,
    detail: String,
}

impl ContractTestFailure {
    fn new(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self {
            scenario,
            detail: detail.into(),
        }
    }

    fn store_error(scenario: &'static str, operation: &'static str, error: StoreError) -> Self {
        Self::new(
            scenario,
            format!("{operation} operation returned unexpected error: {error}"),
        )
    }

    fn assertion(scenario: &'static str, detail: impl Into<String>) -> Self {
        Self::new(scenario, detail)
    }
}

impl fmt::Display for ContractTestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.scenario, self.detail)
    }
}

impl std::error::Error for ContractTestFailure {}

pub type ContractTestResult = Result<(), ContractTestFailure>;

/// A backend under test, plus whatever must stay alive while it is used
/// (a database container, a temporary directory).
pub struct ContractBackend {
    backend: Arc<dyn Backend>,
    _guard: Option<Box<dyn Any + Send>>,
}

impl ContractBackend {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            _guard: None,
        }
    }

    pub fn with_guard(backend: impl Backend + 'static, guard: impl Any + Send) -> Self {
        Self {
            backend: Arc::new(backend),
            _guard: Some(Box::new(guard)),
        }
    }

    fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }
}

fn contract_table() -> String {
    // Unique per run so suites can share one database.
    format!("contract_{}", Uuid::now_v7().simple())
}

fn contract_key(scenario: &'static str) -> Result<ProjectionKey, ContractTestFailure> {
    let projection = ProjectionName::try_new(format!("contract.{scenario}.{}", Uuid::now_v7()))
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))?;
    let instance = InstanceId::try_new(INSTANCE.to_string())
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))?;
    Ok(ProjectionKey::new(projection, instance))
}

fn contract_check() -> TableCheck {
    TableCheck::new(
        Table::new(
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("name", ColumnType::Text).nullable(),
                ColumnDef::new("state", ColumnType::Enum).default_value(Value::Enum(1)),
                ColumnDef::new("roles", ColumnType::TextArray).nullable(),
                ColumnDef::new("creation_date", ColumnType::Timestamp).nullable(),
                ColumnDef::new("sequence", ColumnType::Int64).nullable(),
            ],
            ["instance_id", "id"],
        )
        .with_index(Index::new("name", ["name"]).including(["state"])),
    )
    .with_suffix(SuffixTable::new(
        "members",
        Table::new(
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("user_id", ColumnType::Text),
            ],
            ["instance_id", "id", "user_id"],
        )
        .with_foreign_key(ForeignKey::of_public_keys()),
    ))
}

async fn bootstrap(
    scenario: &'static str,
    backend: &dyn Backend,
    table: &str,
) -> Result<Vec<TableDefinition>, ContractTestFailure> {
    let definitions = contract_check()
        .resolve(table)
        .map_err(|error| ContractTestFailure::assertion(scenario, error.to_string()))?;
    for definition in &definitions {
        backend
            .create_table(definition)
            .await
            .map_err(|error| ContractTestFailure::store_error(scenario, "create_table", error))?;
        for index in &definition.indexes {
            backend
                .ensure_index(definition, index)
                .await
                .map_err(|error| {
                    ContractTestFailure::store_error(scenario, "ensure_index", error)
                })?;
        }
    }
    Ok(definitions)
}

async fn begin(
    scenario: &'static str,
    backend: &dyn Backend,
) -> Result<Box<dyn Transaction>, ContractTestFailure> {
    backend
        .begin()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "begin", error))
}

async fn execute(
    scenario: &'static str,
    tx: &mut dyn Transaction,
    table: &str,
    mutation: Mutation,
) -> Result<u64, ContractTestFailure> {
    tx.execute(table, &mutation)
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "execute", error))
}

async fn commit(scenario: &'static str, tx: Box<dyn Transaction>) -> ContractTestResult {
    tx.commit()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "commit", error))
}

async fn rollback(scenario: &'static str, tx: Box<dyn Transaction>) -> ContractTestResult {
    tx.rollback()
        .await
        .map_err(|error| ContractTestFailure::store_error(scenario, "rollback", error))
}

/// Rows of `table` matching `conditions`, counted by a delete that is
/// rolled back.
async fn count_rows(
    scenario: &'static str,
    backend: &dyn Backend,
    table: &str,
    mut conditions: Vec<Condition>,
) -> Result<u64, ContractTestFailure> {
    conditions.push(Condition::eq("instance_id", INSTANCE));
    let mut tx = begin(scenario, backend).await?;
    let rows = execute(scenario, tx.as_mut(), table, Mutation::Delete { conditions }).await?;
    rollback(scenario, tx).await?;
    Ok(rows)
}

fn expect_rows(scenario: &'static str, what: &str, expected: u64, observed: u64) -> ContractTestResult {
    if expected == observed {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            scenario,
            format!("expected {expected} {what} but observed {observed}"),
        ))
    }
}

fn fixed_time(scenario: &'static str, seconds: i64) -> Result<DateTime<Utc>, ContractTestFailure> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| ContractTestFailure::assertion(scenario, "timestamp out of range"))
}

fn org(id: &str) -> Mutation {
    Mutation::Create {
        columns: vec![Column::new("instance_id", INSTANCE), Column::new("id", id)],
    }
}

fn member(id: &str, user_id: &str) -> Mutation {
    Mutation::Create {
        columns: vec![
            Column::new("instance_id", INSTANCE),
            Column::new("id", id),
            Column::new("user_id", user_id),
        ],
    }
}

pub async fn test_schema_bootstrap<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "schema_bootstrap";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();

    let definitions = bootstrap(SCENARIO, backend, &table).await?;
    // Creating an existing table and its indexes again is a no-op.
    bootstrap(SCENARIO, backend, &table).await?;

    for definition in &definitions {
        let existing = backend
            .inspect_table(&definition.name)
            .await
            .map_err(|error| ContractTestFailure::store_error(SCENARIO, "inspect_table", error))?
            .ok_or_else(|| {
                ContractTestFailure::assertion(
                    SCENARIO,
                    format!("table {} was not created", definition.name),
                )
            })?;
        for column in &definition.columns {
            let found = existing.iter().find(|existing| existing.name == column.name);
            match found {
                Some(existing) if existing.column_type == Some(column.column_type) => {}
                Some(existing) => {
                    return Err(ContractTestFailure::assertion(
                        SCENARIO,
                        format!(
                            "column {} reported as {:?}, declared {}",
                            column.name, existing.column_type, column.column_type
                        ),
                    ));
                }
                None => {
                    return Err(ContractTestFailure::assertion(
                        SCENARIO,
                        format!("column {} missing from {}", column.name, definition.name),
                    ));
                }
            }
        }
    }

    backend
        .add_column(&table, &ColumnDef::new("nickname", ColumnType::Text).nullable())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "add_column", error))?;
    let existing = backend
        .inspect_table(&table)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "inspect_table", error))?
        .unwrap_or_default();
    if !existing.iter().any(|column| column.name == "nickname") {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "added column is not reported by inspect_table",
        ));
    }

    let missing = backend
        .inspect_table(&contract_table())
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "inspect_table", error))?;
    if missing.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "inspect_table reported columns for a table that does not exist",
        ));
    }

    Ok(())
}

pub async fn test_create_update_delete<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "create_update_delete";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();
    bootstrap(SCENARIO, backend, &table).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    execute(SCENARIO, tx.as_mut(), &table, org("o1")).await?;
    let updated = execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Update {
            columns: vec![Column::new("name", "acme"), Column::new("sequence", 2_i64)],
            conditions: vec![Condition::eq("instance_id", INSTANCE), Condition::eq("id", "o1")],
        },
    )
    .await?;
    expect_rows(SCENARIO, "updated rows", 1, updated)?;
    let missed = execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Update {
            columns: vec![Column::new("name", "ghost")],
            conditions: vec![Condition::eq("id", "missing")],
        },
    )
    .await?;
    expect_rows(SCENARIO, "rows updated by a non matching update", 0, missed)?;
    commit(SCENARIO, tx).await?;

    let named = count_rows(SCENARIO, backend, &table, vec![Condition::eq("name", "acme")]).await?;
    expect_rows(SCENARIO, "renamed rows", 1, named)?;
    let defaulted = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::eq("state", Value::Enum(1))],
    )
    .await?;
    expect_rows(SCENARIO, "rows with the default state", 1, defaulted)?;
    let later = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::compare("sequence", Comparison::Greater, 1_i64)],
    )
    .await?;
    expect_rows(SCENARIO, "rows with sequence > 1", 1, later)?;

    let mut tx = begin(SCENARIO, backend).await?;
    let deleted = execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Delete {
            conditions: vec![Condition::eq("instance_id", INSTANCE), Condition::eq("id", "o1")],
        },
    )
    .await?;
    expect_rows(SCENARIO, "deleted rows", 1, deleted)?;
    commit(SCENARIO, tx).await?;

    let remaining = count_rows(SCENARIO, backend, &table, Vec::new()).await?;
    expect_rows(SCENARIO, "remaining rows", 0, remaining)
}

pub async fn test_upsert_keeps_insert_only_columns<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "upsert_keeps_insert_only_columns";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();
    bootstrap(SCENARIO, backend, &table).await?;
    let first = fixed_time(SCENARIO, 1_700_000_000)?;
    let second = fixed_time(SCENARIO, 1_700_000_600)?;

    let upsert = |name: &str, created: DateTime<Utc>| Mutation::Upsert {
        columns: vec![
            Column::new("instance_id", INSTANCE),
            Column::new("id", "feature"),
            Column::new("name", name),
            Column::insert_only("creation_date", created),
        ],
        conflict: vec!["instance_id".to_string(), "id".to_string()],
    };

    let mut tx = begin(SCENARIO, backend).await?;
    execute(SCENARIO, tx.as_mut(), &table, upsert("first", first)).await?;
    execute(SCENARIO, tx.as_mut(), &table, upsert("second", second)).await?;
    commit(SCENARIO, tx).await?;

    let rows = count_rows(SCENARIO, backend, &table, Vec::new()).await?;
    expect_rows(SCENARIO, "rows after two upserts", 1, rows)?;
    let renamed = count_rows(SCENARIO, backend, &table, vec![Condition::eq("name", "second")]).await?;
    expect_rows(SCENARIO, "rows updated by the conflict branch", 1, renamed)?;
    let created = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::eq("creation_date", first)],
    )
    .await?;
    expect_rows(SCENARIO, "rows keeping the first creation date", 1, created)
}

pub async fn test_null_and_array_semantics<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "null_and_array_semantics";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();
    bootstrap(SCENARIO, backend, &table).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Create {
            columns: vec![
                Column::new("instance_id", INSTANCE),
                Column::new("id", "o1"),
                Column::array_append("roles", "ORG_OWNER"),
            ],
        },
    )
    .await?;
    execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Update {
            columns: vec![
                Column::array_append("roles", "ORG_VIEWER"),
                Column::array_remove("roles", "ORG_OWNER"),
            ],
            conditions: vec![Condition::eq("id", "o1")],
        },
    )
    .await?;
    commit(SCENARIO, tx).await?;

    let viewers = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::contains("roles", "ORG_VIEWER")],
    )
    .await?;
    expect_rows(SCENARIO, "rows with the appended role", 1, viewers)?;
    let owners = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::contains("roles", "ORG_OWNER")],
    )
    .await?;
    expect_rows(SCENARIO, "rows with the removed role", 0, owners)?;

    let unnamed = count_rows(SCENARIO, backend, &table, vec![Condition::eq("name", Value::Null)]).await?;
    expect_rows(SCENARIO, "rows matched by name = NULL", 1, unnamed)?;
    let unknown = count_rows(
        SCENARIO,
        backend,
        &table,
        vec![Condition::eq("name", "acme").negate()],
    )
    .await?;
    expect_rows(SCENARIO, "rows matched by NOT (NULL = 'acme')", 0, unknown)
}

pub async fn test_savepoint_rollback<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "savepoint_rollback";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();
    bootstrap(SCENARIO, backend, &table).await?;

    let savepoint_step = |result: Result<(), StoreError>, operation: &'static str| {
        result.map_err(|error| ContractTestFailure::store_error(SCENARIO, operation, error))
    };

    let mut tx = begin(SCENARIO, backend).await?;
    execute(SCENARIO, tx.as_mut(), &table, org("o1")).await?;

    savepoint_step(tx.savepoint(SAVEPOINT).await, "savepoint")?;
    execute(SCENARIO, tx.as_mut(), &table, org("o2")).await?;
    savepoint_step(tx.rollback_to_savepoint(SAVEPOINT).await, "rollback_to_savepoint")?;
    savepoint_step(tx.release_savepoint(SAVEPOINT).await, "release_savepoint")?;

    // A failing statement inside a savepoint leaves the transaction usable.
    savepoint_step(tx.savepoint(SAVEPOINT).await, "savepoint")?;
    match tx.execute(&table, &org("o1")).await {
        Err(StoreError::ConstraintViolation { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "execute", error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected a duplicate primary key to be rejected",
            ))
        }
    }
    savepoint_step(tx.rollback_to_savepoint(SAVEPOINT).await, "rollback_to_savepoint")?;
    savepoint_step(tx.release_savepoint(SAVEPOINT).await, "release_savepoint")?;

    execute(SCENARIO, tx.as_mut(), &table, org("o3")).await?;
    commit(SCENARIO, tx).await?;

    let rows = count_rows(SCENARIO, backend, &table, Vec::new()).await?;
    expect_rows(SCENARIO, "committed rows", 2, rows)?;
    let rolled_back = count_rows(SCENARIO, backend, &table, vec![Condition::eq("id", "o2")]).await?;
    expect_rows(SCENARIO, "rows written after the savepoint", 0, rolled_back)
}

pub async fn test_cascading_foreign_keys<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "cascading_foreign_keys";

    let contract = make_backend().await;
    let backend = contract.backend();
    let table = contract_table();
    let definitions = bootstrap(SCENARIO, backend, &table).await?;
    let suffix = definitions
        .get(1)
        .ok_or_else(|| ContractTestFailure::assertion(SCENARIO, "suffix table not resolved"))?;
    let members = suffix.name.clone();

    let foreign_keys = backend
        .foreign_keys(&members)
        .await
        .map_err(|error| ContractTestFailure::store_error(SCENARIO, "foreign_keys", error))?;
    for declared in &suffix.foreign_keys {
        if !foreign_keys.contains(&declared.name) {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                format!("foreign key {} not reported for {members}", declared.name),
            ));
        }
    }

    let mut tx = begin(SCENARIO, backend).await?;
    execute(SCENARIO, tx.as_mut(), &table, org("o1")).await?;
    execute(SCENARIO, tx.as_mut(), &members, member("o1", "u1")).await?;
    execute(SCENARIO, tx.as_mut(), &members, member("o1", "u2")).await?;
    commit(SCENARIO, tx).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    match tx.execute(&members, &member("missing", "u1")).await {
        Err(StoreError::ConstraintViolation { .. }) => {}
        Err(error) => return Err(ContractTestFailure::store_error(SCENARIO, "execute", error)),
        Ok(_) => {
            return Err(ContractTestFailure::assertion(
                SCENARIO,
                "expected a member without its org to be rejected",
            ))
        }
    }
    rollback(SCENARIO, tx).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    let deleted = execute(
        SCENARIO,
        tx.as_mut(),
        &table,
        Mutation::Delete {
            conditions: vec![Condition::eq("instance_id", INSTANCE), Condition::eq("id", "o1")],
        },
    )
    .await?;
    expect_rows(SCENARIO, "deleted orgs", 1, deleted)?;
    commit(SCENARIO, tx).await?;

    let remaining = count_rows(SCENARIO, backend, &members, Vec::new()).await?;
    expect_rows(SCENARIO, "members left after their org was deleted", 0, remaining)
}

pub async fn test_exclusive_locks<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "exclusive_locks";

    let contract = make_backend().await;
    let backend = contract.backend();
    let key = contract_key(SCENARIO)?;
    let lock = |result: Result<bool, StoreError>| {
        result.map_err(|error| ContractTestFailure::store_error(SCENARIO, "try_lock", error))
    };

    let mut first = begin(SCENARIO, backend).await?;
    let mut second = begin(SCENARIO, backend).await?;

    if !lock(first.try_lock(&key).await)? {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "first transaction could not take a free lock",
        ));
    }
    if lock(second.try_lock(&key).await)? {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "second transaction took a lock that is held",
        ));
    }

    commit(SCENARIO, first).await?;
    rollback(SCENARIO, second).await?;

    let mut third = begin(SCENARIO, backend).await?;
    let acquired = lock(third.try_lock(&key).await)?;
    rollback(SCENARIO, third).await?;
    if acquired {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            "lock was not released by commit",
        ))
    }
}

pub async fn test_state_round_trip<F, Fut>(make_backend: F) -> ContractTestResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ContractBackend>,
{
    const SCENARIO: &str = "state_round_trip";

    let contract = make_backend().await;
    let backend = contract.backend();
    let key = contract_key(SCENARIO)?;
    let state_error = |operation: &'static str| {
        move |error: StoreError| ContractTestFailure::store_error(SCENARIO, operation, error)
    };

    let aggregate_id = AggregateId::try_new("org-1".to_string())
        .map_err(|error| ContractTestFailure::assertion(SCENARIO, error.to_string()))?;
    let state = ProjectionState {
        position: Position::new(7),
        last_event: Some(AppliedEvent {
            aggregate_type: AggregateType::new("org".to_string()),
            aggregate_id,
            sequence: 3,
        }),
        failure: Some(FailureRecord {
            count: 2,
            last_failed_at: fixed_time(SCENARIO, 1_700_000_000)?,
            position: Position::new(8),
            error: "constraint violated".to_string(),
        }),
    };

    let mut tx = begin(SCENARIO, backend).await?;
    let before = tx.load_state(&key).await.map_err(state_error("load_state"))?;
    if before.is_some() {
        return Err(ContractTestFailure::assertion(
            SCENARIO,
            "fresh projection already has a checkpoint",
        ));
    }
    tx.save_state(&key, &state)
        .await
        .map_err(state_error("save_state"))?;
    commit(SCENARIO, tx).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    tx.save_state(&key, &ProjectionState::default())
        .await
        .map_err(state_error("save_state"))?;
    rollback(SCENARIO, tx).await?;

    let mut tx = begin(SCENARIO, backend).await?;
    let loaded = tx.load_state(&key).await.map_err(state_error("load_state"))?;
    rollback(SCENARIO, tx).await?;

    if loaded.as_ref() == Some(&state) {
        Ok(())
    } else {
        Err(ContractTestFailure::assertion(
            SCENARIO,
            format!("expected {state:?} after commit and rollback, loaded {loaded:?}"),
        ))
    }
}

#[macro_export]
macro_rules! backend_contract_tests {
    ($(#[$attr:meta])* suite = $suite:ident, make_backend = $make_backend:expr $(,)?) => {
        #[allow(non_snake_case)]
        mod $suite {
            use $crate::contract::{
                test_cascading_foreign_keys, test_create_update_delete, test_exclusive_locks,
                test_null_and_array_semantics, test_savepoint_rollback, test_schema_bootstrap,
                test_state_round_trip, test_upsert_keeps_insert_only_columns,
            };

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn schema_bootstrap_contract() {
                test_schema_bootstrap($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn create_update_delete_contract() {
                test_create_update_delete($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn upsert_keeps_insert_only_columns_contract() {
                test_upsert_keeps_insert_only_columns($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn null_and_array_semantics_contract() {
                test_null_and_array_semantics($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn savepoint_rollback_contract() {
                test_savepoint_rollback($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn cascading_foreign_keys_contract() {
                test_cascading_foreign_keys($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn exclusive_locks_contract() {
                test_exclusive_locks($make_backend)
                    .await
                    .expect("backend contract failed");
            }

            $(#[$attr])*
            #[tokio::test(flavor = "multi_thread")]
            async fn state_round_trip_contract() {
                test_state_round_trip($make_backend)
                    .await
                    .expect("backend contract failed");
            }
        }
    };
}

pub use crate::backend_contract_tests;
