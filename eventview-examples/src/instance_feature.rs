//! Feature flags configured per instance.

use eventview::{
    AggregateReducer, Column, ColumnDef, ColumnType, DomainEvent, Event, Projection, ReduceError,
    Statement, Table, TableCheck, TableRef,
};
use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::columns::{instance, sequence, CHANGE_DATE, CREATION_DATE, INSTANCE_ID, SEQUENCE};

/// Table name.
pub const INSTANCE_FEATURES: &str = "projections.instance_features";

const KEY: &str = "key";
const VALUE: &str = "value";

/// Feature identifier such as `login_default_org`.
#[nutype(
    validate(
        not_empty,
        predicate = |key| key.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    ),
    derive(Debug, Clone, PartialEq, Eq, Display, AsRef, Into)
)]
pub struct FeatureKey(String);

/// A feature was set to `value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// Feature identifier.
    pub key: String,
    /// New value.
    pub value: serde_json::Value,
}

impl DomainEvent for FeatureSet {
    const AGGREGATE_TYPE: &'static str = "feature";
    const EVENT_TYPE: &'static str = "feature.instance.set";
}

/// Every feature of the instance went back to its default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeaturesReset {}

impl DomainEvent for FeaturesReset {
    const AGGREGATE_TYPE: &'static str = "feature";
    const EVENT_TYPE: &'static str = "feature.instance.reset";
}

/// Read model of instance features, one row per feature key.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstanceFeatureProjection;

/// Insert the feature, or update it keeping the first `creation_date`.
fn reduce_set(event: &Event, set: FeatureSet) -> Result<Statement, ReduceError> {
    let key = FeatureKey::try_new(set.key).map_err(|error| ReduceError::Rejected(error.to_string()))?;
    Ok(Statement::upsert(
        event,
        TableRef::Base,
        vec![
            Column::new(INSTANCE_ID, event.instance_id.as_str()),
            Column::new(KEY, key.into_inner()),
            Column::insert_only(CREATION_DATE, event.created_at),
            Column::new(CHANGE_DATE, event.created_at),
            Column::new(SEQUENCE, sequence(event)?),
            Column::new(VALUE, set.value),
        ],
        vec![INSTANCE_ID.to_string(), KEY.to_string()],
    ))
}

impl Projection for InstanceFeatureProjection {
    fn name(&self) -> &str {
        INSTANCE_FEATURES
    }

    fn init(&self) -> Option<TableCheck> {
        Some(TableCheck::new(Table::new(
            vec![
                ColumnDef::new(INSTANCE_ID, ColumnType::Text),
                ColumnDef::new(KEY, ColumnType::Text),
                ColumnDef::new(CREATION_DATE, ColumnType::Timestamp),
                ColumnDef::new(CHANGE_DATE, ColumnType::Timestamp),
                ColumnDef::new(SEQUENCE, ColumnType::Int64),
                ColumnDef::new(VALUE, ColumnType::Jsonb),
            ],
            [INSTANCE_ID, KEY],
        )))
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new("feature")
                .on::<FeatureSet, _>(reduce_set)
                .on::<FeaturesReset, _>(|event, _| {
                    Ok(Statement::delete(event, TableRef::Base, vec![instance(event)]))
                }),
            AggregateReducer::instance_removal(INSTANCE_ID),
        ]
    }
}
