//! DDL for projection tables.

use eventview_types::{ColumnDef, ColumnType, Index, TableDefinition, Value};

use crate::compiler::{quote_ident, quote_table};

/// PostgreSQL type used for `column_type`.
pub const fn sql_type(column_type: ColumnType) -> &'static str {
    match column_type {
        ColumnType::Text => "TEXT",
        ColumnType::Int64 => "BIGINT",
        ColumnType::Bool => "BOOLEAN",
        ColumnType::Timestamp => "TIMESTAMPTZ",
        ColumnType::Enum => "SMALLINT",
        ColumnType::EnumArray => "SMALLINT[]",
        ColumnType::TextArray => "TEXT[]",
        ColumnType::Jsonb => "JSONB",
    }
}

/// Semantic type of a column as reported by `information_schema.columns.udt_name`.
///
/// `None` for types no declaration can produce.
pub fn column_type_of(udt_name: &str) -> Option<ColumnType> {
    match udt_name {
        "text" | "varchar" => Some(ColumnType::Text),
        "int8" => Some(ColumnType::Int64),
        "bool" => Some(ColumnType::Bool),
        "timestamptz" => Some(ColumnType::Timestamp),
        "int2" => Some(ColumnType::Enum),
        "_int2" => Some(ColumnType::EnumArray),
        "_text" | "_varchar" => Some(ColumnType::TextArray),
        "jsonb" => Some(ColumnType::Jsonb),
        _ => None,
    }
}

/// Schema and table parts of a possibly qualified name.
pub fn split_table_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('.') {
        Some((schema, table)) => (Some(schema), table),
        None => (None, name),
    }
}

/// Statements creating `table` with its keys. The schema is created first
/// when the name is qualified.
pub fn create_table(table: &TableDefinition) -> Vec<String> {
    let mut statements = Vec::new();
    if let (Some(schema), _) = split_table_name(&table.name) {
        statements.push(format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(schema)
        ));
    }

    let mut elements: Vec<String> = table.columns.iter().map(column_definition).collect();
    elements.push(format!("PRIMARY KEY ({})", ident_list(&table.primary_key)));
    for foreign_key in &table.foreign_keys {
        let mut constraint = format!(
            "CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
            quote_ident(&foreign_key.name),
            ident_list(&foreign_key.columns),
            quote_table(&foreign_key.table),
            ident_list(&foreign_key.target_columns),
        );
        if foreign_key.on_delete_cascade {
            constraint.push_str(" ON DELETE CASCADE");
        }
        elements.push(constraint);
    }

    statements.push(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_table(&table.name),
        elements.join(", ")
    ));
    statements
}

/// Statement adding `column` to `table`.
pub fn add_column(table: &str, column: &ColumnDef) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {}",
        quote_table(table),
        column_definition(column)
    )
}

/// Statement creating `index` on `table` unless it exists.
pub fn create_index(table: &TableDefinition, index: &Index) -> String {
    let mut statement = format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_ident(&table.index_name(index)),
        quote_table(&table.name),
        ident_list(&index.columns)
    );
    if !index.include.is_empty() {
        statement.push_str(&format!(" INCLUDE ({})", ident_list(&index.include)));
    }
    statement
}

fn ident_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn column_definition(column: &ColumnDef) -> String {
    let mut definition = format!(
        "{} {}",
        quote_ident(&column.name),
        sql_type(column.column_type)
    );
    if !column.nullable {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        definition.push_str(" DEFAULT ");
        definition.push_str(&literal(default, column.column_type));
    }
    definition
}

fn text_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Inline SQL literal for a column default.
fn literal(value: &Value, column_type: ColumnType) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Text(text) => text_literal(text),
        Value::Int(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string().to_uppercase(),
        Value::Timestamp(at) => format!("{}::timestamptz", text_literal(&at.to_rfc3339())),
        Value::Enum(number) => number.to_string(),
        Value::EnumArray(numbers) => format!(
            "ARRAY[{}]::{}",
            numbers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            sql_type(column_type)
        ),
        Value::TextArray(texts) => format!(
            "ARRAY[{}]::{}",
            texts
                .iter()
                .map(|text| text_literal(text))
                .collect::<Vec<_>>()
                .join(", "),
            sql_type(column_type)
        ),
        Value::Json(json) => format!("{}::jsonb", text_literal(&json.to_string())),
    }
}
