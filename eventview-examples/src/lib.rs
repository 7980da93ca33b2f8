//! Example IAM projections built on `eventview`.
//!
//! Each module pairs the events of one aggregate with the projection that
//! keeps a read model of them:
//!
//! - [`org`]: organizations and their members, with a `members` suffix table
//! - [`org_domain`]: domains of an organization, with a single primary domain
//! - [`instance_feature`]: feature flags of an instance, written by upsert

#![forbid(unsafe_code)]
#![warn(missing_docs)]
// Examples, so not as pedantic
#![allow(clippy::missing_const_for_fn)]

use std::sync::Arc;

use eventview::Registry;

mod columns;
pub mod instance_feature;
pub mod org;
pub mod org_domain;

pub use instance_feature::InstanceFeatureProjection;
pub use org::OrgProjection;
pub use org_domain::OrgDomainProjection;

/// Register every example projection with `registry`.
pub fn register_all(registry: &mut Registry) -> &mut Registry {
    registry
        .register(Arc::new(OrgProjection))
        .register(Arc::new(OrgDomainProjection))
        .register(Arc::new(InstanceFeatureProjection))
}
