//! Translation of [`Mutation`]s into parameterized PostgreSQL.
//!
//! The compiler is pure: it never touches a connection, so every statement
//! shape can be checked without a database.
//!
//! `NULL` values are inlined instead of bound because a bound `NULL` carries
//! the type of the Rust value and would clash with non-text columns.

use eventview_types::{Column, ColumnMode, Comparison, Condition, Mutation, Value};

/// SQL text and the values for its `$n` placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Statement text.
    pub sql: String,
    /// Bound values.
    pub params: Vec<Value>,
}

/// Quote a single identifier.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name, `projections.orgs` becoming
/// `"projections"."orgs"`.
pub fn quote_table(name: &str) -> String {
    name.split('.').map(quote_ident).collect::<Vec<_>>().join(".")
}

const UPSERT_ALIAS: &str = "\"target\"";

#[derive(Default)]
struct Params(Vec<Value>);

impl Params {
    fn placeholder(&mut self, value: &Value) -> String {
        if matches!(value, Value::Null) {
            return "NULL".to_string();
        }
        self.0.push(value.clone());
        format!("${}", self.0.len())
    }
}

/// Compile `mutation` against `table`.
pub fn compile(table: &str, mutation: &Mutation) -> CompiledQuery {
    let table = quote_table(table);
    let mut params = Params::default();

    let sql = match mutation {
        Mutation::Create { columns } => insert(&mut params, &table, columns),
        Mutation::Upsert { columns, conflict } => {
            upsert(&mut params, &table, columns, conflict)
        }
        Mutation::Update {
            columns,
            conditions,
        } => {
            let assignments = columns
                .iter()
                .map(|column| update_assignment(&mut params, column))
                .collect::<Vec<_>>()
                .join(", ");
            let filter = where_clause(&mut params, conditions);
            format!("UPDATE {table} SET {assignments} WHERE {filter}")
        }
        Mutation::Delete { conditions } => {
            let filter = where_clause(&mut params, conditions);
            format!("DELETE FROM {table} WHERE {filter}")
        }
    };

    CompiledQuery {
        sql,
        params: params.0,
    }
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|column| quote_ident(column.name()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_values(params: &mut Params, columns: &[Column]) -> String {
    columns
        .iter()
        .map(|column| match column.mode() {
            ColumnMode::Set | ColumnMode::InsertOnly => params.placeholder(column.value()),
            ColumnMode::ArrayAppend if matches!(column.value(), Value::Null) => "NULL".to_string(),
            ColumnMode::ArrayAppend => format!("ARRAY[{}]", params.placeholder(column.value())),
            // Removing from a row that does not exist yet leaves nothing.
            ColumnMode::ArrayRemove => "NULL".to_string(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert(params: &mut Params, table: &str, columns: &[Column]) -> String {
    let names = column_list(columns);
    let values = insert_values(params, columns);
    format!("INSERT INTO {table} ({names}) VALUES ({values})")
}

fn upsert(params: &mut Params, table: &str, columns: &[Column], conflict: &[String]) -> String {
    let names = column_list(columns);
    let values = insert_values(params, columns);
    let conflict_columns = conflict
        .iter()
        .map(|name| quote_ident(name))
        .collect::<Vec<_>>()
        .join(", ");

    let assignments = columns
        .iter()
        .filter(|column| !conflict.iter().any(|name| name == column.name()))
        .filter_map(|column| conflict_assignment(params, column))
        .collect::<Vec<_>>();

    let action = if assignments.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", assignments.join(", "))
    };

    format!(
        "INSERT INTO {table} AS {UPSERT_ALIAS} ({names}) VALUES ({values}) \
         ON CONFLICT ({conflict_columns}) {action}"
    )
}

fn update_assignment(params: &mut Params, column: &Column) -> String {
    let name = quote_ident(column.name());
    match column.mode() {
        ColumnMode::Set | ColumnMode::InsertOnly => {
            format!("{name} = {}", params.placeholder(column.value()))
        }
        ColumnMode::ArrayAppend => format!(
            "{name} = array_append({name}, {})",
            params.placeholder(column.value())
        ),
        ColumnMode::ArrayRemove => format!(
            "{name} = array_remove({name}, {})",
            params.placeholder(column.value())
        ),
    }
}

/// Assignment on the conflict branch of an upsert; insert-only columns keep
/// their stored value.
fn conflict_assignment(params: &mut Params, column: &Column) -> Option<String> {
    let name = quote_ident(column.name());
    match column.mode() {
        ColumnMode::Set => Some(format!("{name} = EXCLUDED.{name}")),
        ColumnMode::InsertOnly => None,
        ColumnMode::ArrayAppend => Some(format!(
            "{name} = array_append({UPSERT_ALIAS}.{name}, {})",
            params.placeholder(column.value())
        )),
        ColumnMode::ArrayRemove => Some(format!(
            "{name} = array_remove({UPSERT_ALIAS}.{name}, {})",
            params.placeholder(column.value())
        )),
    }
}

fn where_clause(params: &mut Params, conditions: &[Condition]) -> String {
    conditions
        .iter()
        .map(|condition| predicate(params, condition))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn predicate(params: &mut Params, condition: &Condition) -> String {
    match condition {
        Condition::Compare { column, op, value } => {
            let column = quote_ident(column);
            match (op, value) {
                (Comparison::Equal, Value::Null) => format!("{column} IS NULL"),
                (Comparison::NotEqual, Value::Null) => format!("{column} IS NOT NULL"),
                _ => format!("{column} {} {}", op.as_sql(), params.placeholder(value)),
            }
        }
        Condition::IsNull(column) => format!("{} IS NULL", quote_ident(column)),
        Condition::Contains { column, value } => {
            let column = quote_ident(column);
            match value {
                Value::TextArray(_) | Value::EnumArray(_) => {
                    format!("{column} @> {}", params.placeholder(value))
                }
                _ => format!("{} = ANY({column})", params.placeholder(value)),
            }
        }
        Condition::Not(inner) => format!("NOT ({})", predicate(params, inner)),
        Condition::And(conditions) => group(params, conditions, " AND ", "TRUE"),
        Condition::Or(conditions) => group(params, conditions, " OR ", "FALSE"),
    }
}

fn group(params: &mut Params, conditions: &[Condition], separator: &str, empty: &str) -> String {
    if conditions.is_empty() {
        return empty.to_string();
    }
    let parts = conditions
        .iter()
        .map(|condition| predicate(params, condition))
        .collect::<Vec<_>>();
    format!("({})", parts.join(separator))
}
