//! Declarative table schemas and reconciliation against an existing store.

use std::collections::HashSet;
use std::fmt;

use crate::error::SchemaError;
use crate::statement::{suffixed_table_name, Value};

/// Default name of the tenant scoping column.
pub const DEFAULT_INSTANCE_COLUMN: &str = "instance_id";

/// Semantic column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    /// Text.
    Text,
    /// 64 bit integer.
    Int64,
    /// Boolean.
    Bool,
    /// Timestamp with time zone.
    Timestamp,
    /// Small integer enumeration.
    Enum,
    /// Array of small integer enumerations.
    EnumArray,
    /// Array of text.
    TextArray,
    /// JSON document.
    Jsonb,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Int64 => "int64",
            Self::Bool => "bool",
            Self::Timestamp => "timestamp",
            Self::Enum => "enum",
            Self::EnumArray => "enum_array",
            Self::TextArray => "text_array",
            Self::Jsonb => "jsonb",
        };
        f.write_str(name)
    }
}

/// Declaration of one column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Semantic type.
    pub column_type: ColumnType,
    /// Whether `NULL` is allowed.
    pub nullable: bool,
    /// Default applied when an insert omits the column.
    pub default: Option<Value>,
}

impl ColumnDef {
    /// A non-null column without default.
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: false,
            default: None,
        }
    }

    /// Allow `NULL`.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the default value.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Secondary index, optionally covering extra columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    /// Name, unique per table. The full index name is `<table>_<name>_idx`.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Columns carried in the index without being part of the key.
    pub include: Vec<String>,
}

impl Index {
    /// Index over `columns`.
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            include: Vec::new(),
        }
    }

    /// Also cover `columns`.
    #[must_use]
    pub fn including<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = columns.into_iter().map(Into::into).collect();
        self
    }
}

/// Target of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForeignKeyTarget {
    /// The base table of the same projection, by its primary key.
    BaseTable,
    /// Another table by name.
    Table {
        /// Referenced table.
        name: String,
        /// Referenced columns.
        columns: Vec<String>,
    },
}

/// Foreign key from a projection table to another table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    /// Name, unique per table.
    pub name: String,
    /// Referencing columns. Empty means "the referenced key's columns".
    pub columns: Vec<String>,
    /// Referenced table.
    pub target: ForeignKeyTarget,
    /// Delete referencing rows along with the referenced row.
    pub on_delete_cascade: bool,
}

impl ForeignKey {
    /// Suffix table rows reference their base row by the base primary key
    /// and are deleted with it.
    pub fn of_public_keys() -> Self {
        Self {
            name: "fk_base".to_string(),
            columns: Vec::new(),
            target: ForeignKeyTarget::BaseTable,
            on_delete_cascade: true,
        }
    }

    /// Reference `target_columns` of `table` from `columns`.
    pub fn references<I, S>(
        name: impl Into<String>,
        columns: I,
        table: impl Into<String>,
        target_columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            target: ForeignKeyTarget::Table {
                name: table.into(),
                columns: target_columns.into_iter().map(Into::into).collect(),
            },
            on_delete_cascade: false,
        }
    }

    /// Cascade deletes from the referenced row.
    #[must_use]
    pub const fn cascade(mut self) -> Self {
        self.on_delete_cascade = true;
        self
    }
}

/// Foreign key with every name resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedForeignKey {
    /// Name, unique per table.
    pub name: String,
    /// Referencing columns.
    pub columns: Vec<String>,
    /// Referenced table.
    pub table: String,
    /// Referenced columns.
    pub target_columns: Vec<String>,
    /// Delete referencing rows along with the referenced row.
    pub on_delete_cascade: bool,
}

/// Declared shape of one table, without its final name.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<ColumnDef>,
    primary_key: Vec<String>,
    indexes: Vec<Index>,
    foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Table with `columns` keyed by `primary_key`.
    pub fn new<I, S>(columns: Vec<ColumnDef>, primary_key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns,
            primary_key: primary_key.into_iter().map(Into::into).collect(),
            indexes: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Add a secondary index.
    #[must_use]
    pub fn with_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a foreign key.
    #[must_use]
    pub fn with_foreign_key(mut self, foreign_key: ForeignKey) -> Self {
        self.foreign_keys.push(foreign_key);
        self
    }
}

/// Suffix table sharing the projection's reducers.
#[derive(Debug, Clone, PartialEq)]
pub struct SuffixTable {
    suffix: String,
    table: Table,
}

impl SuffixTable {
    /// Table named `<base>_<suffix>`.
    pub fn new(suffix: impl Into<String>, table: Table) -> Self {
        Self {
            suffix: suffix.into(),
            table,
        }
    }
}

/// Everything a projection needs to exist before its worker runs.
#[derive(Debug, Clone, PartialEq)]
pub struct TableCheck {
    base: Table,
    suffixes: Vec<SuffixTable>,
    instance_column: String,
}

impl TableCheck {
    /// Check for the projection's base table.
    pub fn new(base: Table) -> Self {
        Self {
            base,
            suffixes: Vec::new(),
            instance_column: DEFAULT_INSTANCE_COLUMN.to_string(),
        }
    }

    /// Add a suffix table.
    #[must_use]
    pub fn with_suffix(mut self, suffix: SuffixTable) -> Self {
        self.suffixes.push(suffix);
        self
    }

    /// Use a tenant column other than `instance_id`.
    #[must_use]
    pub fn with_instance_column(mut self, column: impl Into<String>) -> Self {
        self.instance_column = column.into();
        self
    }

    /// Validate the declaration and name every table under `base_name`.
    ///
    /// The base table comes first, followed by the suffix tables in
    /// declaration order, so creating them in order satisfies every foreign
    /// key to the base table.
    pub fn resolve(&self, base_name: &str) -> Result<Vec<TableDefinition>, SchemaError> {
        let base = self.resolve_table(base_name.to_string(), &self.base, base_name)?;
        let mut suffixes_seen = HashSet::new();
        let mut tables = Vec::with_capacity(self.suffixes.len() + 1);

        for suffix in &self.suffixes {
            if !suffixes_seen.insert(suffix.suffix.as_str()) {
                return Err(SchemaError::DuplicateSuffix {
                    table: base_name.to_string(),
                    suffix: suffix.suffix.clone(),
                });
            }
            let name = suffixed_table_name(base_name, &suffix.suffix);
            tables.push(self.resolve_suffix(name, &suffix.table, &base)?);
        }

        tables.insert(0, base);
        Ok(tables)
    }

    fn resolve_suffix(
        &self,
        name: String,
        table: &Table,
        base: &TableDefinition,
    ) -> Result<TableDefinition, SchemaError> {
        let mut definition = self.resolve_table(name, table, &base.name)?;
        for foreign_key in &mut definition.foreign_keys {
            if foreign_key.table == base.name && foreign_key.target_columns.is_empty() {
                foreign_key.target_columns.clone_from(&base.primary_key);
            }
            if foreign_key.columns.is_empty() {
                foreign_key.columns.clone_from(&foreign_key.target_columns);
            }
        }
        for foreign_key in &definition.foreign_keys {
            for column in &foreign_key.columns {
                definition.require_column(column)?;
            }
        }
        Ok(definition)
    }

    fn resolve_table(
        &self,
        name: String,
        table: &Table,
        base_name: &str,
    ) -> Result<TableDefinition, SchemaError> {
        if table.columns.is_empty() {
            return Err(SchemaError::NoColumns { table: name });
        }

        let mut seen = HashSet::new();
        for column in &table.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn {
                    table: name,
                    column: column.name.clone(),
                });
            }
        }

        let Some(leading) = table.primary_key.first() else {
            return Err(SchemaError::MissingPrimaryKey { table: name });
        };
        if *leading != self.instance_column {
            return Err(SchemaError::PrimaryKeyNotTenantScoped {
                table: name,
                expected: self.instance_column.clone(),
                found: leading.clone(),
            });
        }

        let definition = TableDefinition {
            name,
            columns: table.columns.clone(),
            primary_key: table.primary_key.clone(),
            indexes: table.indexes.clone(),
            foreign_keys: table
                .foreign_keys
                .iter()
                .map(|foreign_key| resolve_foreign_key(foreign_key, base_name))
                .collect(),
        };

        for column in &definition.primary_key {
            definition.require_column(column)?;
        }
        for index in &definition.indexes {
            for column in index.columns.iter().chain(&index.include) {
                definition.require_column(column)?;
            }
        }
        // Base table keys are only known once the suffix is attached, so
        // empty key lists are checked by `resolve_suffix`.
        for foreign_key in &definition.foreign_keys {
            for column in &foreign_key.columns {
                definition.require_column(column)?;
            }
        }

        Ok(definition)
    }
}

fn resolve_foreign_key(foreign_key: &ForeignKey, base_name: &str) -> ResolvedForeignKey {
    let (table, target_columns) = match &foreign_key.target {
        ForeignKeyTarget::BaseTable => (base_name.to_string(), Vec::new()),
        ForeignKeyTarget::Table { name, columns } => (name.clone(), columns.clone()),
    };
    ResolvedForeignKey {
        name: foreign_key.name.clone(),
        columns: foreign_key.columns.clone(),
        table,
        target_columns,
        on_delete_cascade: foreign_key.on_delete_cascade,
    }
}

/// A validated table with its final name. This is what backends create.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDefinition {
    /// Table name.
    pub name: String,
    /// Ordered columns.
    pub columns: Vec<ColumnDef>,
    /// Primary key columns, led by the instance column.
    pub primary_key: Vec<String>,
    /// Secondary indexes.
    pub indexes: Vec<Index>,
    /// Foreign keys.
    pub foreign_keys: Vec<ResolvedForeignKey>,
}

impl TableDefinition {
    /// Column declaration by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|column| column.name == name)
    }

    fn require_column(&self, name: &str) -> Result<(), SchemaError> {
        if self.column(name).is_some() {
            Ok(())
        } else {
            Err(SchemaError::UnknownColumn {
                table: self.name.clone(),
                column: name.to_string(),
            })
        }
    }

    /// Full name of `index` on this table.
    pub fn index_name(&self, index: &Index) -> String {
        format!("{}_{}_idx", self.name.replace('.', "_"), index.name)
    }
}

/// A column as found in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    /// Column name.
    pub name: String,
    /// Semantic type, `None` when the store type maps to none of ours.
    pub column_type: Option<ColumnType>,
}

/// Changes needed to bring an existing table up to its declaration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SchemaChanges {
    /// The table does not exist yet.
    pub create_table: bool,
    /// Columns to add.
    pub add_columns: Vec<ColumnDef>,
}

impl SchemaChanges {
    /// `true` when the table and every column already exist.
    pub fn is_empty(&self) -> bool {
        !self.create_table && self.add_columns.is_empty()
    }
}

/// Work out how to reconcile `existing` with `desired`.
///
/// Missing tables are created whole. Missing columns are added when nullable
/// or defaulted. A type mismatch, or a missing column that could not be
/// filled for existing rows, is an error: nothing is ever dropped or
/// narrowed. Columns the declaration does not know about are left alone.
pub fn plan_changes(
    desired: &TableDefinition,
    existing: Option<&[ExistingColumn]>,
) -> Result<SchemaChanges, SchemaError> {
    let Some(existing) = existing else {
        return Ok(SchemaChanges {
            create_table: true,
            add_columns: Vec::new(),
        });
    };

    let mut changes = SchemaChanges::default();
    for column in &desired.columns {
        match existing.iter().find(|found| found.name == column.name) {
            Some(found) if found.column_type == Some(column.column_type) => {}
            Some(found) => {
                return Err(SchemaError::TypeMismatch {
                    table: desired.name.clone(),
                    column: column.name.clone(),
                    existing: found
                        .column_type
                        .map_or_else(|| "unknown".to_string(), |ty| ty.to_string()),
                    declared: column.column_type.to_string(),
                });
            }
            None if column.nullable || column.default.is_some() => {
                changes.add_columns.push(column.clone());
            }
            None => {
                return Err(SchemaError::CannotAddColumn {
                    table: desired.name.clone(),
                    column: column.name.clone(),
                });
            }
        }
    }
    Ok(changes)
}
