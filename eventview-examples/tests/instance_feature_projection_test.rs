//! Instance features written through upserts.

mod common;

use chrono::{TimeZone, Utc};
use common::{aggregate, instance, text, Harness};
use eventview::Value;
use eventview_examples::instance_feature::{FeatureSet, FeaturesReset, INSTANCE_FEATURES};
use eventview_examples::InstanceFeatureProjection;
use eventview_memory::PendingEvent;
use serde_json::json;

fn feature_set(key: &str, value: serde_json::Value) -> FeatureSet {
    FeatureSet {
        key: key.to_string(),
        value,
    }
}

fn at(payload: &FeatureSet, hour: u32) -> PendingEvent {
    PendingEvent::typed(aggregate("i1"), instance("i1"), payload)
        .expect("payload serializes")
        .created_at(
            Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0)
                .single()
                .expect("valid time"),
        )
}

#[tokio::test]
async fn setting_a_feature_again_keeps_its_creation_date() {
    // Given: a feature set at 08:00
    let harness = Harness::new(InstanceFeatureProjection).await;
    harness.append_pending(at(&feature_set("login_default_org", json!(false)), 8));

    // When: it is set again at 09:00
    harness.append_pending(at(&feature_set("login_default_org", json!(true)), 9));
    harness.catch_up().await;

    // Then: the value and change date move, the creation date stays
    let rows = harness.rows(INSTANCE_FEATURES);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("value"), Some(&Value::Json(json!(true))));
    let eight = Utc
        .with_ymd_and_hms(2025, 6, 1, 8, 0, 0)
        .single()
        .expect("valid time");
    let nine = Utc
        .with_ymd_and_hms(2025, 6, 1, 9, 0, 0)
        .single()
        .expect("valid time");
    assert_eq!(rows[0].get("creation_date"), Some(&Value::Timestamp(eight)));
    assert_eq!(rows[0].get("change_date"), Some(&Value::Timestamp(nine)));
}

#[tokio::test]
async fn a_reset_removes_every_feature_of_the_instance() {
    let harness = Harness::new(InstanceFeatureProjection).await;
    harness.append("i1", "i1", &feature_set("login_default_org", json!(true)));
    harness.append("i1", "i1", &feature_set("token_exchange", json!(true)));
    harness.append("i2", "i2", &feature_set("token_exchange", json!(false)));
    harness.append("i1", "i1", &FeaturesReset {});
    harness.catch_up().await;

    let rows = harness.rows(INSTANCE_FEATURES);
    assert_eq!(rows.len(), 1);
    assert_eq!(text(&rows[0], "instance_id"), "i2");
}

#[tokio::test]
async fn invalid_feature_keys_fail_the_event() {
    // Given: a feature key that is not snake case
    let harness = Harness::new(InstanceFeatureProjection).await;
    harness.append("i1", "i1", &feature_set("Token-Exchange", json!(true)));

    // When: the worker runs
    let report = harness.worker.run_once().await.expect("tick should succeed");

    // Then: the event fails and nothing is written
    assert_eq!(report.failed, 1);
    assert!(harness.rows(INSTANCE_FEATURES).is_empty());
    let state = harness
        .worker
        .state(&instance("i1"))
        .await
        .expect("state readable")
        .expect("failure recorded");
    assert_eq!(state.failure_count(), 1);
    let failure = state.failure.expect("failure recorded");
    assert_eq!(failure.position.into_inner(), 1);
}

#[tokio::test]
async fn replaying_the_log_after_a_rewind_gives_the_same_rows() {
    // Given: features projected once
    let harness = Harness::new(InstanceFeatureProjection).await;
    harness.append("i1", "i1", &feature_set("login_default_org", json!(true)));
    harness.append("i1", "i1", &feature_set("token_exchange", json!({"enabled": true})));
    harness.append("i1", "i1", &feature_set("login_default_org", json!(false)));
    harness.catch_up().await;
    let projected = harness.rows(INSTANCE_FEATURES);

    // When: the checkpoint is lost and the whole log is applied again
    harness.rewind("i1").await;
    harness.catch_up().await;

    // Then: the read model is unchanged and the checkpoint is back at the end
    assert_eq!(harness.rows(INSTANCE_FEATURES), projected);
    assert_eq!(harness.position("i1").await, 3);
}
