//! Creates and extends projection tables before any worker runs.

use eventview_types::{plan_changes, Backend, SchemaError, TableCheck, TableDefinition};
use tracing::{debug, info, instrument};

/// Bring the tables of `check` up to date under the base name `base_table`.
///
/// Creates missing tables and indexes and adds missing columns. Anything
/// that would need a destructive change fails instead, before any worker
/// writes a row.
#[instrument(name = "schema.ensure", skip(backend, check))]
pub async fn ensure_schema(
    backend: &dyn Backend,
    base_table: &str,
    check: &TableCheck,
) -> Result<(), SchemaError> {
    for table in check.resolve(base_table)? {
        let existing = backend.inspect_table(&table.name).await?;
        let changes = plan_changes(&table, existing.as_deref())?;

        if changes.create_table {
            info!(table = %table.name, "[schema.create_table] creating table");
            backend.create_table(&table).await?;
        } else {
            require_foreign_keys(backend, &table).await?;
        }
        for column in &changes.add_columns {
            info!(
                table = %table.name,
                column = %column.name,
                "[schema.add_column] adding column"
            );
            backend.add_column(&table.name, column).await?;
        }
        if changes.is_empty() {
            debug!(table = %table.name, "[schema.up_to_date] table matches declaration");
        }
        for index in &table.indexes {
            backend.ensure_index(&table, index).await?;
        }
    }
    Ok(())
}

async fn require_foreign_keys(
    backend: &dyn Backend,
    table: &TableDefinition,
) -> Result<(), SchemaError> {
    if table.foreign_keys.is_empty() {
        return Ok(());
    }
    let existing = backend.foreign_keys(&table.name).await?;
    match table
        .foreign_keys
        .iter()
        .find(|foreign_key| !existing.contains(&foreign_key.name))
    {
        Some(missing) => Err(SchemaError::MissingForeignKey {
            table: table.name.clone(),
            foreign_key: missing.name.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventview_memory::InMemoryBackend;
    use eventview_types::{ColumnDef, ColumnType, ForeignKey, Index, SuffixTable, Table};
    use tracing_test::traced_test;

    fn check(columns: Vec<ColumnDef>) -> TableCheck {
        TableCheck::new(
            Table::new(columns, ["instance_id", "id"])
                .with_index(Index::new("name", ["name"])),
        )
    }

    fn base_columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("instance_id", ColumnType::Text),
            ColumnDef::new("id", ColumnType::Text),
            ColumnDef::new("name", ColumnType::Text),
        ]
    }

    #[tokio::test]
    #[traced_test]
    async fn second_run_finds_everything_in_place() {
        let backend = InMemoryBackend::new();
        let declared = check(base_columns());

        ensure_schema(&backend, "projections.users", &declared)
            .await
            .expect("tables created");
        ensure_schema(&backend, "projections.users", &declared)
            .await
            .expect("second run succeeds");

        assert!(backend.has_table("projections.users"));
        assert_eq!(backend.indexes("projections.users").len(), 1);
        assert!(logs_contain("[schema.create_table]"));
        assert!(logs_contain("[schema.up_to_date]"));
    }

    #[tokio::test]
    #[traced_test]
    async fn defaulted_columns_are_added_to_existing_tables() {
        let backend = InMemoryBackend::new();
        ensure_schema(&backend, "projections.users", &check(base_columns()))
            .await
            .expect("tables created");

        let mut columns = base_columns();
        columns.push(ColumnDef::new("active", ColumnType::Bool).default_value(true));
        ensure_schema(&backend, "projections.users", &check(columns))
            .await
            .expect("column added");

        let definition = backend
            .definition("projections.users")
            .expect("table exists");
        assert!(definition.column("active").is_some());
        assert!(logs_contain("[schema.add_column]"));
    }

    #[tokio::test]
    async fn required_columns_cannot_be_added_later() {
        let backend = InMemoryBackend::new();
        ensure_schema(&backend, "projections.users", &check(base_columns()))
            .await
            .expect("tables created");

        let mut columns = base_columns();
        columns.push(ColumnDef::new("email", ColumnType::Text));
        let error = ensure_schema(&backend, "projections.users", &check(columns))
            .await
            .expect_err("a required column cannot be filled for existing rows");

        assert!(matches!(error, SchemaError::CannotAddColumn { column, .. } if column == "email"));
    }

    #[tokio::test]
    async fn existing_suffix_table_without_cascade_is_rejected() {
        let backend = InMemoryBackend::new();
        let declared = check(base_columns()).with_suffix(SuffixTable::new(
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
        ));
        let mut tables = declared
            .resolve("projections.users")
            .expect("valid declaration");
        for table in &mut tables {
            table.foreign_keys.clear();
            backend.create_table(table).await.expect("table created");
        }

        let error = ensure_schema(&backend, "projections.users", &declared)
            .await
            .expect_err("missing cascade must fail startup");

        assert_eq!(
            error,
            SchemaError::MissingForeignKey {
                table: "projections.users_members".to_string(),
                foreign_key: "fk_base".to_string(),
            }
        );
    }
}
