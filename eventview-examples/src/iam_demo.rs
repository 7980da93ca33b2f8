//! IAM projections example
//!
//! Runs the organization, domain and feature projections against the
//! in-memory backend:
//! - Appends a short history for one instance
//! - Starts the registry and triggers every projection
//! - Prints the resulting read models

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use eventview::{suffixed_table_name, AggregateId, InstanceId, ProjectionConfig, Registry};
use eventview_examples::instance_feature::{FeatureSet, INSTANCE_FEATURES};
use eventview_examples::org::{MemberAdded, OrgAdded, ORGS};
use eventview_examples::org_domain::{DomainAdded, DomainVerified, PrimaryDomainSet, ORG_DOMAINS};
use eventview_memory::{InMemoryBackend, InMemoryEventSource, PendingEvent};
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let backend = InMemoryBackend::new();
    let source = InMemoryEventSource::new();
    let instance = InstanceId::try_new("demo-instance".to_string())?;
    let org = AggregateId::try_new("acme".to_string())?;

    info!("Appending the history of ACME");
    source.append_all([
        PendingEvent::typed(
            org.clone(),
            instance.clone(),
            &OrgAdded {
                name: "ACME".to_string(),
            },
        )?,
        PendingEvent::typed(
            org.clone(),
            instance.clone(),
            &MemberAdded {
                user_id: "alice".to_string(),
                roles: vec!["ORG_OWNER".to_string()],
            },
        )?,
        PendingEvent::typed(
            org.clone(),
            instance.clone(),
            &DomainAdded {
                domain: "acme.example".to_string(),
            },
        )?,
        PendingEvent::typed(
            org.clone(),
            instance.clone(),
            &DomainVerified {
                domain: "acme.example".to_string(),
            },
        )?,
        PendingEvent::typed(
            org.clone(),
            instance.clone(),
            &PrimaryDomainSet {
                domain: "acme.example".to_string(),
            },
        )?,
        PendingEvent::typed(
            AggregateId::try_new(instance.to_string())?,
            instance.clone(),
            &FeatureSet {
                key: "login_default_org".to_string(),
                value: json!(true),
            },
        )?,
    ]);

    let mut registry = Registry::new(
        Arc::new(backend.clone()),
        Arc::new(source),
        ProjectionConfig::from_json(r#"{ "requeue_every": 60000 }"#)?,
    );
    eventview_examples::register_all(&mut registry);

    let running = registry.start().await?;
    for name in running.names() {
        running.trigger(name)?;
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.stop().await;

    for table in [
        ORGS.to_string(),
        suffixed_table_name(ORGS, "members"),
        ORG_DOMAINS.to_string(),
        INSTANCE_FEATURES.to_string(),
    ] {
        for row in backend.rows(&table) {
            info!(table = %table, row = ?row, "projected row");
        }
    }

    Ok(())
}
