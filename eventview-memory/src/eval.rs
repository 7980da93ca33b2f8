//! Row level evaluation of mutations, following SQL semantics.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use eventview_types::{Column, ColumnMode, ColumnType, Comparison, Condition, TableDefinition, Value};

/// A stored row by column name.
pub type Row = BTreeMap<String, Value>;

/// Evaluate `conditions` joined by `AND` with three-valued logic.
/// Only `Some(true)` selects a row.
pub(crate) fn matches_all(row: &Row, conditions: &[Condition]) -> bool {
    and(conditions.iter().map(|condition| evaluate(row, condition))) == Some(true)
}

fn evaluate(row: &Row, condition: &Condition) -> Option<bool> {
    match condition {
        Condition::Compare { column, op, value } => {
            let current = row.get(column).unwrap_or(&Value::Null);
            compare(current, *op, value)
        }
        Condition::IsNull(column) => Some(is_null(row.get(column).unwrap_or(&Value::Null))),
        Condition::Contains { column, value } => {
            contains(row.get(column).unwrap_or(&Value::Null), value)
        }
        Condition::Not(inner) => evaluate(row, inner).map(|result| !result),
        Condition::And(conditions) => and(conditions.iter().map(|inner| evaluate(row, inner))),
        Condition::Or(conditions) => or(conditions.iter().map(|inner| evaluate(row, inner))),
    }
}

fn and(results: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for result in results {
        match result {
            Some(false) => return Some(false),
            None => unknown = true,
            Some(true) => {}
        }
    }
    (!unknown).then_some(true)
}

fn or(results: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for result in results {
        match result {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    (!unknown).then_some(false)
}

const fn is_null(value: &Value) -> bool {
    matches!(value, Value::Null)
}

fn compare(current: &Value, op: Comparison, value: &Value) -> Option<bool> {
    // `= NULL` and `<> NULL` are compiled to `IS [NOT] NULL`.
    if is_null(value) {
        return match op {
            Comparison::Equal => Some(is_null(current)),
            Comparison::NotEqual => Some(!is_null(current)),
            _ => None,
        };
    }
    if is_null(current) {
        return None;
    }
    let ordering = order(current, value)?;
    Some(match op {
        Comparison::Equal => ordering == Ordering::Equal,
        Comparison::NotEqual => ordering != Ordering::Equal,
        Comparison::Less => ordering == Ordering::Less,
        Comparison::LessOrEqual => ordering != Ordering::Greater,
        Comparison::Greater => ordering == Ordering::Greater,
        Comparison::GreaterOrEqual => ordering != Ordering::Less,
    })
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Text(left), Value::Text(right)) => Some(left.cmp(right)),
        (Value::Int(left), Value::Int(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        (Value::Timestamp(left), Value::Timestamp(right)) => Some(left.cmp(right)),
        (Value::Enum(left), Value::Enum(right)) => Some(left.cmp(right)),
        (Value::EnumArray(left), Value::EnumArray(right)) => Some(left.cmp(right)),
        (Value::TextArray(left), Value::TextArray(right)) => Some(left.cmp(right)),
        (Value::Json(left), Value::Json(right)) => (left == right).then_some(Ordering::Equal),
        _ => None,
    }
}

/// `value = ANY(array)` for elements, `array @> value` for arrays.
fn contains(current: &Value, value: &Value) -> Option<bool> {
    match (current, value) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::TextArray(items), Value::Text(item)) => Some(items.contains(item)),
        (Value::EnumArray(items), Value::Enum(item)) => Some(items.contains(item)),
        (Value::TextArray(items), Value::TextArray(wanted)) => {
            Some(wanted.iter().all(|item| items.contains(item)))
        }
        (Value::EnumArray(items), Value::EnumArray(wanted)) => {
            Some(wanted.iter().all(|item| items.contains(item)))
        }
        _ => None,
    }
}

/// Whether `value` can be stored in a column of `column_type`.
pub(crate) const fn fits(column_type: ColumnType, value: &Value) -> bool {
    matches!(
        (column_type, value),
        (_, Value::Null)
            | (ColumnType::Text, Value::Text(_))
            | (ColumnType::Int64, Value::Int(_))
            | (ColumnType::Bool, Value::Bool(_))
            | (ColumnType::Timestamp, Value::Timestamp(_))
            | (ColumnType::Enum, Value::Enum(_))
            | (ColumnType::EnumArray, Value::EnumArray(_))
            | (ColumnType::TextArray, Value::TextArray(_))
            | (ColumnType::Jsonb, Value::Json(_))
    )
}

/// New value of `column` given the value currently stored.
///
/// `insert_only` columns keep `current` when `keep_insert_only` is set,
/// which is how the conflict branch of an upsert treats them.
pub(crate) fn assign(
    current: &Value,
    column: &Column,
    keep_insert_only: bool,
) -> Result<Value, String> {
    match column.mode() {
        ColumnMode::Set => Ok(column.value().clone()),
        ColumnMode::InsertOnly if keep_insert_only => Ok(current.clone()),
        ColumnMode::InsertOnly => Ok(column.value().clone()),
        ColumnMode::ArrayAppend => append(current, column.value())
            .ok_or_else(|| format!("cannot append to column {}", column.name())),
        ColumnMode::ArrayRemove => remove(current, column.value())
            .ok_or_else(|| format!("cannot remove from column {}", column.name())),
    }
}

/// `array_append`: appending to `NULL` yields a one element array.
fn append(current: &Value, element: &Value) -> Option<Value> {
    match (current, element) {
        (Value::Null, Value::Text(item)) => Some(Value::TextArray(vec![item.clone()])),
        (Value::Null, Value::Enum(item)) => Some(Value::EnumArray(vec![*item])),
        (Value::TextArray(items), Value::Text(item)) => {
            let mut items = items.clone();
            items.push(item.clone());
            Some(Value::TextArray(items))
        }
        (Value::EnumArray(items), Value::Enum(item)) => {
            let mut items = items.clone();
            items.push(*item);
            Some(Value::EnumArray(items))
        }
        _ => None,
    }
}

/// `array_remove`: removes every occurrence, `NULL` stays `NULL`.
fn remove(current: &Value, element: &Value) -> Option<Value> {
    match (current, element) {
        (Value::Null, Value::Text(_) | Value::Enum(_)) => Some(Value::Null),
        (Value::TextArray(items), Value::Text(item)) => Some(Value::TextArray(
            items.iter().filter(|existing| *existing != item).cloned().collect(),
        )),
        (Value::EnumArray(items), Value::Enum(item)) => Some(Value::EnumArray(
            items.iter().copied().filter(|existing| existing != item).collect(),
        )),
        _ => None,
    }
}

/// Reject rows breaking `NOT NULL` or column types.
pub(crate) fn check_row(definition: &TableDefinition, row: &Row) -> Result<(), String> {
    for column in &definition.columns {
        let value = row.get(&column.name).unwrap_or(&Value::Null);
        if !column.nullable && is_null(value) {
            return Err(format!("null value in column {}", column.name));
        }
        if !fits(column.column_type, value) {
            return Err(format!(
                "column {} is of type {}",
                column.name, column.column_type
            ));
        }
    }
    Ok(())
}

/// Values of `columns` in `row`, `None` when any of them is `NULL`.
pub(crate) fn key_of(row: &Row, columns: &[String]) -> Option<Vec<Value>> {
    columns
        .iter()
        .map(|column| row.get(column).filter(|value| !is_null(value)).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn null_comparisons_are_unknown() {
        let row = row(&[("name", Value::Null)]);

        assert!(!matches_all(&row, &[Condition::eq("name", "acme")]));
        assert!(!matches_all(&row, &[Condition::eq("name", "acme").negate()]));
    }

    #[test]
    fn equal_to_null_means_is_null() {
        let row = row(&[("name", Value::Null)]);

        assert!(matches_all(&row, &[Condition::eq("name", Value::Null)]));
    }

    #[test]
    fn or_is_true_when_any_branch_is_true() {
        let row = row(&[("name", Value::Null), ("state", Value::Enum(1))]);

        assert!(matches_all(
            &row,
            &[Condition::or(vec![
                Condition::eq("name", "acme"),
                Condition::eq("state", Value::Enum(1)),
            ])]
        ));
    }

    #[test]
    fn contains_matches_elements_and_subsets() {
        let row = row(&[(
            "roles",
            Value::TextArray(vec!["ORG_OWNER".to_string(), "ORG_VIEWER".to_string()]),
        )]);

        assert!(matches_all(&row, &[Condition::contains("roles", "ORG_OWNER")]));
        assert!(!matches_all(&row, &[Condition::contains("roles", "IAM_OWNER")]));
        assert!(matches_all(
            &row,
            &[Condition::contains("roles", vec!["ORG_VIEWER".to_string()])]
        ));
    }

    #[test]
    fn append_and_remove_follow_array_functions() {
        let appended = assign(&Value::Null, &Column::array_append("roles", "A"), false)
            .expect("appends to null");
        assert_eq!(appended, Value::TextArray(vec!["A".to_string()]));

        let removed = assign(
            &Value::TextArray(vec!["A".to_string(), "B".to_string(), "A".to_string()]),
            &Column::array_remove("roles", "A"),
            false,
        )
        .expect("removes");
        assert_eq!(removed, Value::TextArray(vec!["B".to_string()]));
    }

    #[test]
    fn insert_only_is_kept_on_conflict() {
        let current = Value::Text("first".to_string());

        let kept = assign(&current, &Column::insert_only("created", "second"), true)
            .expect("assigns");

        assert_eq!(kept, current);
    }
}
