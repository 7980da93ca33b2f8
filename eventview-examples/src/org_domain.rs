//! Domains registered by organizations.
//!
//! At most one domain per organization is primary. Setting a new primary
//! domain clears the flag on the previous one in the same statement.

use eventview::{
    owner_removed, AggregateReducer, Column, ColumnDef, ColumnType, Comparison, Condition,
    DomainEvent, Event, Index, Projection, ReduceError, Statement, StatementKind, Table,
    TableCheck, TableRef, Value,
};
use nutype::nutype;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::columns::{
    changed, created, instance, key, CHANGE_DATE, CREATION_DATE, INSTANCE_ID, RESOURCE_OWNER, SEQUENCE,
};
use crate::org::OrgRemoved;

/// Table name.
pub const ORG_DOMAINS: &str = "projections.org_domains";

const ORG_ID: &str = "org_id";
const DOMAIN: &str = "domain";
const IS_VERIFIED: &str = "is_verified";
const IS_PRIMARY: &str = "is_primary";
const VALIDATION_TYPE: &str = "validation_type";

/// A domain name, trimmed and lowercased.
#[nutype(
    sanitize(trim, lowercase),
    validate(not_empty, len_char_max = 253),
    derive(Debug, Clone, PartialEq, Eq, Display, AsRef, Into)
)]
pub struct DomainName(String);

/// How ownership of a domain is proven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainValidationType {
    /// Not validated yet.
    #[default]
    Unspecified,
    /// Token served over HTTP.
    Http,
    /// Token in a DNS TXT record.
    Dns,
}

impl From<DomainValidationType> for Value {
    fn from(validation: DomainValidationType) -> Self {
        Self::Enum(match validation {
            DomainValidationType::Unspecified => 0,
            DomainValidationType::Http => 1,
            DomainValidationType::Dns => 2,
        })
    }
}

/// A domain was added to the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAdded {
    /// The domain.
    pub domain: String,
}

impl DomainEvent for DomainAdded {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.domain.added";
}

/// Validation of a domain was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainVerificationAdded {
    /// The domain.
    pub domain: String,
    /// Chosen validation method.
    pub validation_type: DomainValidationType,
}

impl DomainEvent for DomainVerificationAdded {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.domain.verification.added";
}

/// Ownership of the domain was proven.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainVerified {
    /// The domain.
    pub domain: String,
}

impl DomainEvent for DomainVerified {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.domain.verified";
}

/// The domain became the organization's primary domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryDomainSet {
    /// The new primary domain.
    pub domain: String,
}

impl DomainEvent for PrimaryDomainSet {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.domain.primary.set";
}

/// The domain was removed from the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRemoved {
    /// The domain.
    pub domain: String,
}

impl DomainEvent for DomainRemoved {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.domain.removed";
}

/// Read model of organization domains.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrgDomainProjection;

fn domain_name(raw: String) -> Result<DomainName, ReduceError> {
    DomainName::try_new(raw).map_err(|error| ReduceError::Rejected(error.to_string()))
}

fn org_domains(event: &Event) -> Vec<Condition> {
    vec![instance(event), Condition::eq(ORG_ID, event.aggregate_id.as_str())]
}

fn domain(event: &Event, domain: &DomainName) -> Vec<Condition> {
    let mut conditions = org_domains(event);
    conditions.push(Condition::eq(DOMAIN, domain.to_string()));
    conditions
}

fn update_domain(event: &Event, raw: String, column: Column) -> Result<Statement, ReduceError> {
    let name = domain_name(raw)?;
    let mut columns = changed(event)?;
    columns.push(column);
    Ok(Statement::update(
        event,
        TableRef::Base,
        columns,
        domain(event, &name),
    ))
}

/// Clear the previous primary domain, then flag the new one.
fn reduce_primary_set(event: &Event, set: PrimaryDomainSet) -> Result<Statement, ReduceError> {
    let name = domain_name(set.domain)?;
    debug!(domain = %name, org = %event.aggregate_id, "[org_domain.primary] switching primary domain");

    let mut previous = org_domains(event);
    previous.extend([
        Condition::eq(IS_PRIMARY, true),
        Condition::compare(DOMAIN, Comparison::NotEqual, name.to_string()),
    ]);
    let mut unset = changed(event)?;
    unset.push(Column::new(IS_PRIMARY, false));
    let mut flag = changed(event)?;
    flag.push(Column::new(IS_PRIMARY, true));

    Ok(Statement::multi(
        event,
        vec![
            StatementKind::update(TableRef::Base, unset, previous),
            StatementKind::update(TableRef::Base, flag, domain(event, &name)),
        ],
    ))
}

impl Projection for OrgDomainProjection {
    fn name(&self) -> &str {
        ORG_DOMAINS
    }

    fn init(&self) -> Option<TableCheck> {
        Some(TableCheck::new(
            Table::new(
                vec![
                    ColumnDef::new(INSTANCE_ID, ColumnType::Text),
                    ColumnDef::new(ORG_ID, ColumnType::Text),
                    ColumnDef::new(DOMAIN, ColumnType::Text),
                    ColumnDef::new(CREATION_DATE, ColumnType::Timestamp),
                    ColumnDef::new(CHANGE_DATE, ColumnType::Timestamp),
                    ColumnDef::new(SEQUENCE, ColumnType::Int64),
                    ColumnDef::new(RESOURCE_OWNER, ColumnType::Text),
                    ColumnDef::new(IS_VERIFIED, ColumnType::Bool).default_value(false),
                    ColumnDef::new(IS_PRIMARY, ColumnType::Bool).default_value(false),
                    ColumnDef::new(VALIDATION_TYPE, ColumnType::Enum)
                        .default_value(DomainValidationType::Unspecified),
                ],
                [INSTANCE_ID, ORG_ID, DOMAIN],
            )
            .with_index(Index::new("domain", [DOMAIN]).including([IS_VERIFIED])),
        ))
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new("org")
                .on::<DomainAdded, _>(|event, added| {
                    let mut columns = created(event)?;
                    columns.extend([
                        Column::new(ORG_ID, event.aggregate_id.as_str()),
                        Column::new(DOMAIN, domain_name(added.domain)?.into_inner()),
                    ]);
                    Ok(Statement::upsert(
                        event,
                        TableRef::Base,
                        columns,
                        key(&[INSTANCE_ID, ORG_ID, DOMAIN]),
                    ))
                })
                .on::<DomainVerificationAdded, _>(|event, verification| {
                    update_domain(
                        event,
                        verification.domain,
                        Column::new(VALIDATION_TYPE, verification.validation_type),
                    )
                })
                .on::<DomainVerified, _>(|event, verified| {
                    update_domain(event, verified.domain, Column::new(IS_VERIFIED, true))
                })
                .on::<PrimaryDomainSet, _>(reduce_primary_set)
                .on::<DomainRemoved, _>(|event, removed| {
                    let name = domain_name(removed.domain)?;
                    Ok(Statement::delete(event, TableRef::Base, domain(event, &name)))
                })
                .on_event(
                    OrgRemoved::EVENT_TYPE,
                    owner_removed(INSTANCE_ID, RESOURCE_OWNER),
                ),
            AggregateReducer::instance_removal(INSTANCE_ID),
        ]
    }
}
