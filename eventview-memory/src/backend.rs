//! Transactional in-memory tables.
//!
//! Transactions write straight into the shared tables and keep an undo
//! journal, so they read uncommitted data of each other. Savepoints mark a
//! position in the journal; rolling back replays the journal backwards.
//! Projection locks make sure no two transactions touch the same checkpoint.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use eventview_types::{
    Backend, Column, ColumnDef, Condition, ExistingColumn, Index, Mutation, PositionStore,
    ProjectionKey, ProjectionState, StoreError, TableDefinition, Transaction, Value,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::eval::{self, Row};

#[derive(Debug, Clone)]
struct MemTable {
    definition: TableDefinition,
    rows: BTreeMap<u64, Row>,
    next_row: u64,
    indexes: BTreeSet<String>,
}

#[derive(Debug)]
enum Undo {
    Inserted {
        table: String,
        id: u64,
    },
    Restore {
        table: String,
        id: u64,
        before: Row,
    },
    State {
        key: ProjectionKey,
        before: Option<ProjectionState>,
    },
}

#[derive(Debug, Default)]
struct Database {
    tables: HashMap<String, MemTable>,
    states: HashMap<ProjectionKey, ProjectionState>,
    locks: HashMap<ProjectionKey, u64>,
    next_tx: u64,
}

fn violation(table: &str, detail: impl Into<String>) -> StoreError {
    StoreError::ConstraintViolation {
        table: table.to_string(),
        detail: detail.into(),
    }
}

fn condition_columns<'a>(condition: &'a Condition, names: &mut Vec<&'a str>) {
    match condition {
        Condition::Compare { column, .. }
        | Condition::IsNull(column)
        | Condition::Contains { column, .. } => names.push(column),
        Condition::Not(inner) => condition_columns(inner, names),
        Condition::And(conditions) | Condition::Or(conditions) => {
            for inner in conditions {
                condition_columns(inner, names);
            }
        }
    }
}

impl Database {
    fn table(&self, name: &str) -> Result<&MemTable, StoreError> {
        self.tables.get(name).ok_or_else(|| StoreError::UnknownTable {
            table: name.to_string(),
        })
    }

    fn table_mut(&mut self, name: &str) -> Result<&mut MemTable, StoreError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownTable {
                table: name.to_string(),
            })
    }

    fn undo(&mut self, entry: Undo) {
        match entry {
            Undo::Inserted { table, id } => {
                if let Some(table) = self.tables.get_mut(&table) {
                    table.rows.remove(&id);
                }
            }
            Undo::Restore { table, id, before } => {
                if let Some(table) = self.tables.get_mut(&table) {
                    table.rows.insert(id, before);
                }
            }
            Undo::State { key, before } => match before {
                Some(state) => {
                    self.states.insert(key, state);
                }
                None => {
                    self.states.remove(&key);
                }
            },
        }
    }

    fn undo_to(&mut self, journal: &mut Vec<Undo>, mark: usize) {
        for entry in journal.drain(mark..).rev() {
            self.undo(entry);
        }
    }

    fn execute(
        &mut self,
        table: &str,
        mutation: &Mutation,
        journal: &mut Vec<Undo>,
    ) -> Result<u64, StoreError> {
        let definition = self.table(table)?.definition.clone();
        match mutation {
            Mutation::Create { columns } => {
                check_columns(&definition, columns.iter().map(Column::name))?;
                self.insert(&definition, columns, journal)?;
                Ok(1)
            }
            Mutation::Upsert { columns, conflict } => {
                check_columns(&definition, columns.iter().map(Column::name))?;
                check_columns(&definition, conflict.iter().map(String::as_str))?;
                match self.conflicting_row(&definition, columns, conflict)? {
                    Some(id) => self.update_row(&definition, id, columns, true, journal)?,
                    None => self.insert(&definition, columns, journal)?,
                }
                Ok(1)
            }
            Mutation::Update {
                columns,
                conditions,
            } => {
                check_columns(&definition, columns.iter().map(Column::name))?;
                check_conditions(&definition, conditions)?;
                let ids = self.matching(table, conditions)?;
                for id in &ids {
                    self.update_row(&definition, *id, columns, false, journal)?;
                }
                Ok(ids.len() as u64)
            }
            Mutation::Delete { conditions } => {
                check_conditions(&definition, conditions)?;
                let ids = self.matching(table, conditions)?;
                for id in &ids {
                    self.delete_row(table, *id, journal)?;
                }
                Ok(ids.len() as u64)
            }
        }
    }

    fn matching(&self, table: &str, conditions: &[Condition]) -> Result<Vec<u64>, StoreError> {
        Ok(self
            .table(table)?
            .rows
            .iter()
            .filter(|(_, row)| eval::matches_all(row, conditions))
            .map(|(id, _)| *id)
            .collect())
    }

    /// Row an upsert lands on. `NULL` conflict values never conflict.
    fn conflicting_row(
        &self,
        definition: &TableDefinition,
        columns: &[Column],
        conflict: &[String],
    ) -> Result<Option<u64>, StoreError> {
        let wanted: Row = columns
            .iter()
            .map(|column| (column.name().to_string(), column.value().clone()))
            .collect();
        let Some(key) = eval::key_of(&wanted, conflict) else {
            return Ok(None);
        };
        Ok(self
            .table(&definition.name)?
            .rows
            .iter()
            .find(|(_, row)| eval::key_of(row, conflict).as_ref() == Some(&key))
            .map(|(id, _)| *id))
    }

    fn insert(
        &mut self,
        definition: &TableDefinition,
        columns: &[Column],
        journal: &mut Vec<Undo>,
    ) -> Result<(), StoreError> {
        let mut row = Row::new();
        for column in &definition.columns {
            let value = match columns.iter().rfind(|written| written.name() == column.name) {
                Some(written) => eval::assign(&Value::Null, written, false)
                    .map_err(|detail| violation(&definition.name, detail))?,
                None => column.default.clone().unwrap_or(Value::Null),
            };
            row.insert(column.name.clone(), value);
        }
        self.admit(definition, &row, None)?;

        let table = self.table_mut(&definition.name)?;
        let id = table.next_row;
        table.next_row += 1;
        table.rows.insert(id, row);
        journal.push(Undo::Inserted {
            table: definition.name.clone(),
            id,
        });
        Ok(())
    }

    fn update_row(
        &mut self,
        definition: &TableDefinition,
        id: u64,
        columns: &[Column],
        keep_insert_only: bool,
        journal: &mut Vec<Undo>,
    ) -> Result<(), StoreError> {
        let Some(before) = self.table(&definition.name)?.rows.get(&id).cloned() else {
            return Ok(());
        };
        let mut after = before.clone();
        for column in columns {
            let current = after.get(column.name()).cloned().unwrap_or(Value::Null);
            let value = eval::assign(&current, column, keep_insert_only)
                .map_err(|detail| violation(&definition.name, detail))?;
            after.insert(column.name().to_string(), value);
        }
        self.admit(definition, &after, Some(id))?;

        self.table_mut(&definition.name)?.rows.insert(id, after);
        journal.push(Undo::Restore {
            table: definition.name.clone(),
            id,
            before,
        });
        Ok(())
    }

    fn delete_row(
        &mut self,
        table: &str,
        id: u64,
        journal: &mut Vec<Undo>,
    ) -> Result<(), StoreError> {
        let Some(before) = self.table_mut(table)?.rows.remove(&id) else {
            return Ok(());
        };
        journal.push(Undo::Restore {
            table: table.to_string(),
            id,
            before: before.clone(),
        });

        let referencing: Vec<_> = self
            .tables
            .values()
            .flat_map(|child| {
                child
                    .definition
                    .foreign_keys
                    .iter()
                    .filter(|foreign_key| foreign_key.table == table)
                    .map(|foreign_key| (child.definition.name.clone(), foreign_key.clone()))
            })
            .collect();

        for (child, foreign_key) in referencing {
            let Some(key) = eval::key_of(&before, &foreign_key.target_columns) else {
                continue;
            };
            let children: Vec<u64> = self
                .table(&child)?
                .rows
                .iter()
                .filter(|(_, row)| {
                    eval::key_of(row, &foreign_key.columns).as_ref() == Some(&key)
                })
                .map(|(child_id, _)| *child_id)
                .collect();
            if children.is_empty() {
                continue;
            }
            if !foreign_key.on_delete_cascade {
                return Err(violation(
                    &child,
                    format!("{} still references {table}", foreign_key.name),
                ));
            }
            for child_id in children {
                self.delete_row(&child, child_id, journal)?;
            }
        }
        Ok(())
    }

    /// Enforce types, `NOT NULL`, the primary key and foreign keys.
    fn admit(
        &self,
        definition: &TableDefinition,
        row: &Row,
        replacing: Option<u64>,
    ) -> Result<(), StoreError> {
        eval::check_row(definition, row).map_err(|detail| violation(&definition.name, detail))?;

        let table = self.table(&definition.name)?;
        if let Some(key) = eval::key_of(row, &definition.primary_key) {
            let duplicate = table.rows.iter().any(|(id, existing)| {
                Some(*id) != replacing
                    && eval::key_of(existing, &definition.primary_key).as_ref() == Some(&key)
            });
            if duplicate {
                return Err(violation(
                    &definition.name,
                    "duplicate key value violates primary key",
                ));
            }
        }

        for foreign_key in &definition.foreign_keys {
            let Some(key) = eval::key_of(row, &foreign_key.columns) else {
                continue;
            };
            let target = self.table(&foreign_key.table)?;
            let found = target.rows.values().any(|candidate| {
                eval::key_of(candidate, &foreign_key.target_columns).as_ref() == Some(&key)
            });
            if !found {
                return Err(violation(
                    &definition.name,
                    format!("{} has no matching row in {}", foreign_key.name, foreign_key.table),
                ));
            }
        }
        Ok(())
    }
}

fn check_columns<'a>(
    definition: &TableDefinition,
    mut names: impl Iterator<Item = &'a str>,
) -> Result<(), StoreError> {
    match names.find(|name| definition.column(name).is_none()) {
        Some(name) => Err(StoreError::UnknownColumn {
            table: definition.name.clone(),
            column: name.to_string(),
        }),
        None => Ok(()),
    }
}

fn check_conditions(
    definition: &TableDefinition,
    conditions: &[Condition],
) -> Result<(), StoreError> {
    let mut names = Vec::new();
    for condition in conditions {
        condition_columns(condition, &mut names);
    }
    check_columns(definition, names.into_iter())
}

/// In-memory [`Backend`] for tests and development.
///
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    db: Arc<Mutex<Database>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `table` exists.
    pub fn has_table(&self, table: &str) -> bool {
        self.db.lock().tables.contains_key(table)
    }

    /// Definition `table` was created with, including added columns.
    pub fn definition(&self, table: &str) -> Option<TableDefinition> {
        self.db
            .lock()
            .tables
            .get(table)
            .map(|table| table.definition.clone())
    }

    /// Every row of `table` in insertion order, uncommitted writes included.
    /// Empty when the table does not exist.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.db
            .lock()
            .tables
            .get(table)
            .map(|table| table.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Names of the indexes created on `table`.
    pub fn indexes(&self, table: &str) -> Vec<String> {
        self.db
            .lock()
            .tables
            .get(table)
            .map(|table| table.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        let id = {
            let mut db = self.db.lock();
            db.next_tx += 1;
            db.next_tx
        };
        Ok(Box::new(InMemoryTransaction {
            db: Arc::clone(&self.db),
            id,
            journal: Vec::new(),
            savepoints: Vec::new(),
            locks: Vec::new(),
            finished: false,
        }))
    }

    async fn inspect_table(&self, table: &str) -> Result<Option<Vec<ExistingColumn>>, StoreError> {
        Ok(self.db.lock().tables.get(table).map(|table| {
            table
                .definition
                .columns
                .iter()
                .map(|column| ExistingColumn {
                    name: column.name.clone(),
                    column_type: Some(column.column_type),
                })
                .collect()
        }))
    }

    async fn foreign_keys(&self, table: &str) -> Result<Vec<String>, StoreError> {
        let db = self.db.lock();
        let target = db.tables.get(table).ok_or_else(|| StoreError::UnknownTable {
            table: table.to_string(),
        })?;
        Ok(target
            .definition
            .foreign_keys
            .iter()
            .map(|foreign_key| foreign_key.name.clone())
            .collect())
    }

    async fn create_table(&self, table: &TableDefinition) -> Result<(), StoreError> {
        let mut db = self.db.lock();
        if db.tables.contains_key(&table.name) {
            return Ok(());
        }
        if let Some(missing) = table
            .foreign_keys
            .iter()
            .find(|foreign_key| {
                foreign_key.table != table.name && !db.tables.contains_key(&foreign_key.table)
            })
        {
            return Err(StoreError::UnknownTable {
                table: missing.table.clone(),
            });
        }
        debug!(table = %table.name, "[memory.create_table] table created");
        db.tables.insert(
            table.name.clone(),
            MemTable {
                definition: table.clone(),
                rows: BTreeMap::new(),
                next_row: 0,
                indexes: BTreeSet::new(),
            },
        );
        Ok(())
    }

    async fn add_column(&self, table: &str, column: &ColumnDef) -> Result<(), StoreError> {
        let mut db = self.db.lock();
        let target = db.table_mut(table)?;
        if target.definition.column(&column.name).is_some() {
            return Ok(());
        }
        let fill = column.default.clone().unwrap_or(Value::Null);
        if !column.nullable && fill == Value::Null && !target.rows.is_empty() {
            return Err(violation(
                table,
                format!("column {} contains null values", column.name),
            ));
        }
        for row in target.rows.values_mut() {
            row.insert(column.name.clone(), fill.clone());
        }
        target.definition.columns.push(column.clone());
        Ok(())
    }

    async fn ensure_index(&self, table: &TableDefinition, index: &Index) -> Result<(), StoreError> {
        let mut db = self.db.lock();
        let target = db.table_mut(&table.name)?;
        if let Some(column) = index
            .columns
            .iter()
            .chain(&index.include)
            .find(|column| target.definition.column(column).is_none())
        {
            return Err(StoreError::UnknownColumn {
                table: table.name.clone(),
                column: column.clone(),
            });
        }
        target.indexes.insert(table.index_name(index));
        Ok(())
    }
}

/// Transaction of an [`InMemoryBackend`].
#[derive(Debug)]
pub struct InMemoryTransaction {
    db: Arc<Mutex<Database>>,
    id: u64,
    journal: Vec<Undo>,
    savepoints: Vec<(String, usize)>,
    locks: Vec<ProjectionKey>,
    finished: bool,
}

impl InMemoryTransaction {
    fn finish(&mut self, keep: bool) {
        let mut db = self.db.lock();
        if !keep {
            db.undo_to(&mut self.journal, 0);
        }
        self.journal.clear();
        self.savepoints.clear();
        for key in self.locks.drain(..) {
            if db.locks.get(&key) == Some(&self.id) {
                db.locks.remove(&key);
            }
        }
        self.finished = true;
    }

    fn savepoint_position(&self, name: &str) -> Result<usize, StoreError> {
        self.savepoints
            .iter()
            .rposition(|(savepoint, _)| savepoint == name)
            .ok_or_else(|| StoreError::UnknownSavepoint {
                name: name.to_string(),
            })
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            debug!(tx = self.id, "[memory.rollback_on_drop] transaction dropped");
            self.finish(false);
        }
    }
}

#[async_trait]
impl PositionStore for InMemoryTransaction {
    async fn try_lock(&mut self, key: &ProjectionKey) -> Result<bool, StoreError> {
        let mut db = self.db.lock();
        match db.locks.get(key) {
            Some(holder) => Ok(*holder == self.id),
            None => {
                db.locks.insert(key.clone(), self.id);
                self.locks.push(key.clone());
                Ok(true)
            }
        }
    }

    async fn load_state(
        &mut self,
        key: &ProjectionKey,
    ) -> Result<Option<ProjectionState>, StoreError> {
        Ok(self.db.lock().states.get(key).cloned())
    }

    async fn save_state(
        &mut self,
        key: &ProjectionKey,
        state: &ProjectionState,
    ) -> Result<(), StoreError> {
        let mut db = self.db.lock();
        let before = db.states.insert(key.clone(), state.clone());
        self.journal.push(Undo::State {
            key: key.clone(),
            before,
        });
        Ok(())
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn execute(&mut self, table: &str, mutation: &Mutation) -> Result<u64, StoreError> {
        mutation
            .validate()
            .map_err(|source| StoreError::InvalidStatement {
                table: table.to_string(),
                source,
            })?;

        let mut db = self.db.lock();
        let mark = self.journal.len();
        let result = db.execute(table, mutation, &mut self.journal);
        if result.is_err() {
            // Statements are atomic: undo the rows touched before the failure.
            db.undo_to(&mut self.journal, mark);
        }
        result
    }

    async fn savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        self.savepoints.push((name.to_string(), self.journal.len()));
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let position = self.savepoint_position(name)?;
        let mark = self.savepoints[position].1;
        self.savepoints.truncate(position + 1);
        self.db.lock().undo_to(&mut self.journal, mark);
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> Result<(), StoreError> {
        let position = self.savepoint_position(name)?;
        self.savepoints.truncate(position);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.finish(true);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let mut tx = self;
        tx.finish(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventview_types::{
        ColumnType, ForeignKey, InstanceId, ProjectionName, SuffixTable, Table, TableCheck,
    };

    fn check() -> TableCheck {
        TableCheck::new(Table::new(
            vec![
                ColumnDef::new("instance_id", ColumnType::Text),
                ColumnDef::new("id", ColumnType::Text),
                ColumnDef::new("name", ColumnType::Text).nullable(),
            ],
            ["instance_id", "id"],
        ))
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

    async fn backend_with_tables() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        for table in check().resolve("orgs").expect("valid check") {
            backend.create_table(&table).await.expect("table created");
        }
        backend
    }

    fn org(id: &str) -> Mutation {
        Mutation::Create {
            columns: vec![Column::new("instance_id", "i1"), Column::new("id", id)],
        }
    }

    fn member(id: &str, user: &str) -> Mutation {
        Mutation::Create {
            columns: vec![
                Column::new("instance_id", "i1"),
                Column::new("id", id),
                Column::new("user_id", user),
            ],
        }
    }

    fn key() -> ProjectionKey {
        ProjectionKey::new(
            ProjectionName::try_new("orgs".to_string()).expect("valid name"),
            InstanceId::try_new("i1".to_string()).expect("valid instance"),
        )
    }

    #[tokio::test]
    async fn rollback_discards_writes_and_state() {
        // Given: A transaction that wrote a row and a checkpoint
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");
        tx.execute("orgs", &org("o1")).await.expect("insert");
        tx.save_state(&key(), &ProjectionState::default())
            .await
            .expect("save state");

        // When: It rolls back
        tx.rollback().await.expect("rollback");

        // Then: Nothing remains
        assert!(backend.rows("orgs").is_empty());
        let mut tx = backend.begin().await.expect("begin");
        assert_eq!(tx.load_state(&key()).await.expect("load"), None);
    }

    #[tokio::test]
    async fn rollback_to_savepoint_keeps_earlier_writes() {
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");
        tx.execute("orgs", &org("o1")).await.expect("insert");

        tx.savepoint("exec_stmt").await.expect("savepoint");
        tx.execute("orgs", &org("o2")).await.expect("insert");
        tx.rollback_to_savepoint("exec_stmt")
            .await
            .expect("rollback to savepoint");
        tx.release_savepoint("exec_stmt").await.expect("release");
        tx.commit().await.expect("commit");

        assert_eq!(backend.rows("orgs").len(), 1);
    }

    #[tokio::test]
    async fn duplicate_primary_key_is_rejected_atomically() {
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");
        tx.execute("orgs", &org("o1")).await.expect("insert");

        let result = tx.execute("orgs", &org("o1")).await;

        assert!(matches!(
            result,
            Err(StoreError::ConstraintViolation { .. })
        ));
        assert_eq!(backend.rows("orgs").len(), 1);
    }

    #[tokio::test]
    async fn deleting_a_parent_cascades_to_suffix_rows() {
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");
        tx.execute("orgs", &org("o1")).await.expect("insert org");
        tx.execute("orgs_members", &member("o1", "u1"))
            .await
            .expect("insert member");

        let deleted = tx
            .execute(
                "orgs",
                &Mutation::Delete {
                    conditions: vec![Condition::eq("id", "o1")],
                },
            )
            .await
            .expect("delete");
        tx.commit().await.expect("commit");

        assert_eq!(deleted, 1);
        assert!(backend.rows("orgs_members").is_empty());
    }

    #[tokio::test]
    async fn suffix_row_without_parent_violates_foreign_key() {
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");

        let result = tx.execute("orgs_members", &member("missing", "u1")).await;

        assert!(matches!(
            result,
            Err(StoreError::ConstraintViolation { .. })
        ));
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_commit() {
        let backend = backend_with_tables().await;
        let mut first = backend.begin().await.expect("begin");
        let mut second = backend.begin().await.expect("begin");

        assert!(first.try_lock(&key()).await.expect("lock"));
        assert!(!second.try_lock(&key()).await.expect("lock"));

        first.commit().await.expect("commit");
        assert!(second.try_lock(&key()).await.expect("lock"));
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_and_unlocks() {
        let backend = backend_with_tables().await;
        {
            let mut tx = backend.begin().await.expect("begin");
            tx.try_lock(&key()).await.expect("lock");
            tx.execute("orgs", &org("o1")).await.expect("insert");
        }

        let mut tx = backend.begin().await.expect("begin");
        assert!(tx.try_lock(&key()).await.expect("lock"));
        assert!(backend.rows("orgs").is_empty());
    }

    #[tokio::test]
    async fn added_column_is_filled_with_its_default() {
        let backend = backend_with_tables().await;
        let mut tx = backend.begin().await.expect("begin");
        tx.execute("orgs", &org("o1")).await.expect("insert");
        tx.commit().await.expect("commit");

        backend
            .add_column(
                "orgs",
                &ColumnDef::new("state", ColumnType::Enum).default_value(Value::Enum(1)),
            )
            .await
            .expect("column added");

        assert_eq!(backend.rows("orgs")[0].get("state"), Some(&Value::Enum(1)));
    }
}
