//! Worker tuning with per-projection overrides.
//!
//! [`ProjectionConfig`] holds the global defaults plus a customization map
//! keyed by projection name. Workers never read it directly: each one gets a
//! resolved [`HandlerConfig`] from [`ProjectionConfig::for_projection`].

use std::collections::HashMap;
use std::time::Duration;

use nutype::nutype;
use serde::{Deserialize, Serialize};

/// Interval between scheduled ticks, in milliseconds.
///
/// Validated to be at least 10ms so an idle worker never spins.
#[nutype(
    validate(greater_or_equal = 10),
    default = 5_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RequeueEveryMs(u64);

impl RequeueEveryMs {
    /// Convert to Duration for use with tokio::time::sleep.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Time a stalled projection waits before probing the failed event again,
/// in milliseconds.
#[nutype(
    default = 30_000,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct RetryFailedAfterMs(u64);

impl RetryFailedAfterMs {
    /// Convert to Duration.
    pub fn as_duration(self) -> Duration {
        Duration::from_millis(self.into())
    }
}

/// Consecutive failures on one event before the projection stalls.
#[nutype(
    validate(greater_or_equal = 1),
    default = 5,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxFailureCount(u32);

/// Maximum number of events fetched per batch.
#[nutype(
    validate(greater_or_equal = 1),
    default = 200,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct BulkLimit(u64);

/// Maximum number of batches one tick runs while a backlog remains.
#[nutype(
    validate(greater_or_equal = 1),
    default = 1,
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Into,
        Default,
        Serialize,
        Deserialize
    )
)]
pub struct MaxIterators(u32);

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The document is not valid configuration.
    #[error("invalid projection configuration: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Partial override of the global defaults for one projection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CustomConfig {
    /// Overrides [`ProjectionConfig::requeue_every`].
    pub requeue_every: Option<RequeueEveryMs>,
    /// Overrides [`ProjectionConfig::retry_failed_after`].
    pub retry_failed_after: Option<RetryFailedAfterMs>,
    /// Overrides [`ProjectionConfig::max_failure_count`].
    pub max_failure_count: Option<MaxFailureCount>,
    /// Overrides [`ProjectionConfig::bulk_limit`].
    pub bulk_limit: Option<BulkLimit>,
    /// Overrides [`ProjectionConfig::max_iterators`].
    pub max_iterators: Option<MaxIterators>,
}

/// Global worker configuration.
///
/// Deserializes from a document such as:
///
/// ```json
/// {
///   "requeue_every": 5000,
///   "bulk_limit": 200,
///   "customizations": { "projections.orgs": { "bulk_limit": 2000 } }
/// }
/// ```
///
/// Missing fields take their defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProjectionConfig {
    /// Interval between scheduled ticks.
    pub requeue_every: RequeueEveryMs,
    /// Wait before retrying a stalled projection.
    pub retry_failed_after: RetryFailedAfterMs,
    /// Consecutive failures before a projection stalls.
    pub max_failure_count: MaxFailureCount,
    /// Events fetched per batch.
    pub bulk_limit: BulkLimit,
    /// Batches per tick while a backlog remains.
    pub max_iterators: MaxIterators,
    /// Overrides by projection name.
    pub customizations: HashMap<String, CustomConfig>,
}

impl ProjectionConfig {
    /// Parse configuration from JSON.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Add an override for `projection`.
    #[must_use]
    pub fn customize(mut self, projection: impl Into<String>, custom: CustomConfig) -> Self {
        self.customizations.insert(projection.into(), custom);
        self
    }

    /// Effective configuration of `projection`.
    pub fn for_projection(&self, projection: &str) -> HandlerConfig {
        let custom = self.customizations.get(projection).cloned().unwrap_or_default();
        HandlerConfig {
            requeue_every: custom
                .requeue_every
                .unwrap_or(self.requeue_every)
                .as_duration(),
            retry_failed_after: custom
                .retry_failed_after
                .unwrap_or(self.retry_failed_after)
                .as_duration(),
            max_failure_count: custom
                .max_failure_count
                .unwrap_or(self.max_failure_count)
                .into(),
            bulk_limit: custom.bulk_limit.unwrap_or(self.bulk_limit).into(),
            max_iterators: custom.max_iterators.unwrap_or(self.max_iterators).into(),
        }
    }
}

/// Resolved configuration of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    /// Interval between scheduled ticks.
    pub requeue_every: Duration,
    /// Wait before retrying a stalled projection.
    pub retry_failed_after: Duration,
    /// Consecutive failures before a projection stalls.
    pub max_failure_count: u32,
    /// Events fetched per batch.
    pub bulk_limit: u64,
    /// Batches per tick while a backlog remains.
    pub max_iterators: u32,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        ProjectionConfig::default().for_projection("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_customization() {
        let config = ProjectionConfig::default().for_projection("projections.orgs");

        assert_eq!(config.requeue_every, Duration::from_secs(5));
        assert_eq!(config.retry_failed_after, Duration::from_secs(30));
        assert_eq!(config.max_failure_count, 5);
        assert_eq!(config.bulk_limit, 200);
        assert_eq!(config.max_iterators, 1);
    }

    #[test]
    fn customization_overrides_only_the_fields_it_sets() {
        let config = ProjectionConfig::default().customize(
            "projections.orgs",
            CustomConfig {
                bulk_limit: Some(BulkLimit::try_new(2_000).expect("valid bulk limit")),
                ..CustomConfig::default()
            },
        );

        let orgs = config.for_projection("projections.orgs");
        let users = config.for_projection("projections.users");

        assert_eq!(orgs.bulk_limit, 2_000);
        assert_eq!(orgs.requeue_every, Duration::from_secs(5));
        assert_eq!(users.bulk_limit, 200);
    }

    #[test]
    fn parses_partial_json_documents() {
        let config = ProjectionConfig::from_json(
            r#"{
                "max_failure_count": 3,
                "customizations": {
                    "projections.instance_features": { "requeue_every": 60000 }
                }
            }"#,
        )
        .expect("valid configuration");

        let features = config.for_projection("projections.instance_features");
        assert_eq!(features.max_failure_count, 3);
        assert_eq!(features.requeue_every, Duration::from_secs(60));
    }

    #[test]
    fn rejects_zero_bulk_limit() {
        let result = ProjectionConfig::from_json(r#"{ "bulk_limit": 0 }"#);

        assert!(result.is_err());
    }
}
