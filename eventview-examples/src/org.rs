//! Organizations and their members.
//!
//! `projections.orgs` holds one row per organization. Members live in the
//! `projections.orgs_members` suffix table, keyed by the organization's
//! primary key and removed with it.

use eventview::{
    AggregateReducer, Column, ColumnDef, ColumnType, Condition, DomainEvent, Event, ForeignKey,
    Index, Projection, ReduceError, Statement, SuffixTable, Table, TableCheck, TableRef, Value,
};
use nutype::nutype;
use serde::{Deserialize, Serialize};

use crate::columns::{
    changed, created, instance, key, CHANGE_DATE, CREATION_DATE, INSTANCE_ID, RESOURCE_OWNER, SEQUENCE,
};
use crate::org_domain::PrimaryDomainSet;

/// Base table name.
pub const ORGS: &str = "projections.orgs";
/// Suffix of the members table.
pub const MEMBERS: &str = "members";

const ID: &str = "id";
const NAME: &str = "name";
const STATE: &str = "state";
const PRIMARY_DOMAIN: &str = "primary_domain";
const USER_ID: &str = "user_id";
const ROLES: &str = "roles";

/// Display name of an organization, trimmed and never blank.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 200),
    derive(Debug, Clone, PartialEq, Eq, Display, AsRef, Into)
)]
pub struct OrgName(String);

/// Lifecycle state stored in the `state` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum OrgState {
    /// Usable.
    Active = 1,
    /// Deactivated by an administrator.
    Inactive = 2,
}

impl From<OrgState> for Value {
    fn from(state: OrgState) -> Self {
        Self::Enum(state as i16)
    }
}

/// An organization was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgAdded {
    /// Display name.
    pub name: String,
}

impl DomainEvent for OrgAdded {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.added";
}

/// Some organization attributes changed. Absent fields are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgChanged {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
}

impl DomainEvent for OrgChanged {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.changed";
}

/// The organization was deactivated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgDeactivated {}

impl DomainEvent for OrgDeactivated {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.deactivated";
}

/// The organization was reactivated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgReactivated {}

impl DomainEvent for OrgReactivated {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.reactivated";
}

/// The organization was removed along with everything it owns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgRemoved {}

impl DomainEvent for OrgRemoved {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.removed";
}

/// A user became a member of the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberAdded {
    /// The member.
    pub user_id: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl DomainEvent for MemberAdded {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.member.added";
}

/// The member's roles were replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberChanged {
    /// The member.
    pub user_id: String,
    /// Roles after the change.
    pub roles: Vec<String>,
}

impl DomainEvent for MemberChanged {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.member.changed";
}

/// One role was granted to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRoleGranted {
    /// The member.
    pub user_id: String,
    /// Granted role.
    pub role: String,
}

impl DomainEvent for MemberRoleGranted {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.member.role.granted";
}

/// One role was revoked from a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRoleRevoked {
    /// The member.
    pub user_id: String,
    /// Revoked role.
    pub role: String,
}

impl DomainEvent for MemberRoleRevoked {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.member.role.revoked";
}

/// A user stopped being a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRemoved {
    /// The former member.
    pub user_id: String,
}

impl DomainEvent for MemberRemoved {
    const AGGREGATE_TYPE: &'static str = "org";
    const EVENT_TYPE: &'static str = "org.member.removed";
}

/// Read model of organizations and their members.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrgProjection;

fn org(event: &Event) -> Vec<Condition> {
    vec![instance(event), Condition::eq(ID, event.aggregate_id.as_str())]
}

fn member(event: &Event, user_id: &str) -> Vec<Condition> {
    let mut conditions = org(event);
    conditions.push(Condition::eq(USER_ID, user_id));
    conditions
}

fn name(raw: String) -> Result<OrgName, ReduceError> {
    OrgName::try_new(raw).map_err(|error| ReduceError::Rejected(error.to_string()))
}

fn reduce_added(event: &Event, added: OrgAdded) -> Result<Statement, ReduceError> {
    let mut columns = created(event)?;
    columns.extend([
        Column::new(ID, event.aggregate_id.as_str()),
        Column::new(NAME, name(added.name)?.into_inner()),
        Column::new(STATE, OrgState::Active),
    ]);
    Ok(Statement::upsert(
        event,
        TableRef::Base,
        columns,
        key(&[INSTANCE_ID, ID]),
    ))
}

fn reduce_changed(event: &Event, changed_org: OrgChanged) -> Result<Statement, ReduceError> {
    let Some(new_name) = changed_org.name.and_then(|raw| OrgName::try_new(raw).ok()) else {
        return Ok(Statement::no_op(event));
    };
    let mut columns = changed(event)?;
    columns.push(Column::new(NAME, new_name.into_inner()));
    Ok(Statement::update(event, TableRef::Base, columns, org(event)))
}

fn reduce_state(event: &Event, state: OrgState) -> Result<Statement, ReduceError> {
    let mut columns = changed(event)?;
    columns.push(Column::new(STATE, state));
    Ok(Statement::update(event, TableRef::Base, columns, org(event)))
}

fn reduce_member_update(
    event: &Event,
    user_id: &str,
    roles: Column,
) -> Result<Statement, ReduceError> {
    let mut columns = changed(event)?;
    columns.push(roles);
    Ok(Statement::update(
        event,
        TableRef::suffix(MEMBERS),
        columns,
        member(event, user_id),
    ))
}

impl Projection for OrgProjection {
    fn name(&self) -> &str {
        ORGS
    }

    fn init(&self) -> Option<TableCheck> {
        Some(
            TableCheck::new(
                Table::new(
                    vec![
                        ColumnDef::new(ID, ColumnType::Text),
                        ColumnDef::new(INSTANCE_ID, ColumnType::Text),
                        ColumnDef::new(CREATION_DATE, ColumnType::Timestamp),
                        ColumnDef::new(CHANGE_DATE, ColumnType::Timestamp),
                        ColumnDef::new(RESOURCE_OWNER, ColumnType::Text),
                        ColumnDef::new(SEQUENCE, ColumnType::Int64),
                        ColumnDef::new(STATE, ColumnType::Enum)
                            .default_value(OrgState::Active),
                        ColumnDef::new(NAME, ColumnType::Text),
                        ColumnDef::new(PRIMARY_DOMAIN, ColumnType::Text).default_value(""),
                    ],
                    [INSTANCE_ID, ID],
                )
                .with_index(Index::new("name", [NAME])),
            )
            .with_suffix(SuffixTable::new(
                MEMBERS,
                Table::new(
                    vec![
                        ColumnDef::new(INSTANCE_ID, ColumnType::Text),
                        ColumnDef::new(ID, ColumnType::Text),
                        ColumnDef::new(USER_ID, ColumnType::Text),
                        ColumnDef::new(ROLES, ColumnType::TextArray)
                            .default_value(Vec::<String>::new()),
                        ColumnDef::new(CREATION_DATE, ColumnType::Timestamp),
                        ColumnDef::new(CHANGE_DATE, ColumnType::Timestamp),
                        ColumnDef::new(RESOURCE_OWNER, ColumnType::Text),
                        ColumnDef::new(SEQUENCE, ColumnType::Int64),
                    ],
                    [INSTANCE_ID, ID, USER_ID],
                )
                .with_index(Index::new("user", [USER_ID]))
                .with_foreign_key(ForeignKey::of_public_keys()),
            )),
        )
    }

    fn reducers(&self) -> Vec<AggregateReducer> {
        vec![
            AggregateReducer::new("org")
                .on::<OrgAdded, _>(reduce_added)
                .on::<OrgChanged, _>(reduce_changed)
                .on::<OrgDeactivated, _>(|event, _| reduce_state(event, OrgState::Inactive))
                .on::<OrgReactivated, _>(|event, _| reduce_state(event, OrgState::Active))
                .on::<OrgRemoved, _>(|event, _| {
                    Ok(Statement::delete(event, TableRef::Base, org(event)))
                })
                .on::<PrimaryDomainSet, _>(|event, set| {
                    let mut columns = changed(event)?;
                    columns.push(Column::new(PRIMARY_DOMAIN, set.domain));
                    Ok(Statement::update(event, TableRef::Base, columns, org(event)))
                })
                .on::<MemberAdded, _>(|event, added| {
                    let mut columns = created(event)?;
                    columns.extend([
                        Column::new(ID, event.aggregate_id.as_str()),
                        Column::new(USER_ID, added.user_id),
                        Column::new(ROLES, added.roles),
                    ]);
                    Ok(Statement::upsert(
                        event,
                        TableRef::suffix(MEMBERS),
                        columns,
                        key(&[INSTANCE_ID, ID, USER_ID]),
                    ))
                })
                .on::<MemberChanged, _>(|event, changed_member| {
                    reduce_member_update(
                        event,
                        &changed_member.user_id,
                        Column::new(ROLES, changed_member.roles),
                    )
                })
                .on::<MemberRoleGranted, _>(|event, granted| {
                    reduce_member_update(
                        event,
                        &granted.user_id,
                        Column::array_append(ROLES, granted.role),
                    )
                })
                .on::<MemberRoleRevoked, _>(|event, revoked| {
                    reduce_member_update(
                        event,
                        &revoked.user_id,
                        Column::array_remove(ROLES, revoked.role),
                    )
                })
                .on::<MemberRemoved, _>(|event, removed| {
                    Ok(Statement::delete(
                        event,
                        TableRef::suffix(MEMBERS),
                        member(event, &removed.user_id),
                    ))
                }),
            AggregateReducer::instance_removal(INSTANCE_ID),
        ]
    }
}
