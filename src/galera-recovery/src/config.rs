// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use galera_cloud_resources::crd::mariadb::v1alpha1::GaleraRecoverySpec;

pub const DEFAULT_CLUSTER_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CLUSTER_HEALTHY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CLUSTER_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_POD_RECOVERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POD_SYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid duration {value:?} for {field}: {source}")]
    InvalidDuration {
        field: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
}

/// Timing and override knobs for recovering one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecoveryConfig {
    pub cluster_monitor_interval: Duration,
    /// How long the cluster must be unhealthy before recovery starts.
    pub cluster_healthy_timeout: Duration,
    /// Bound on the whole bootstrap phase, from choosing a founder until every
    /// member has been restarted.
    pub cluster_bootstrap_timeout: Duration,
    /// Bound on a single member's local log recovery.
    pub pod_recovery_timeout: Duration,
    /// Bound on each wait for a restarted member to come back and sync.
    pub pod_sync_timeout: Duration,
    /// Interval between attempts of any polled operation.
    pub poll_interval: Duration,
    /// Bootstrap from this member without running source selection.
    pub force_bootstrap_member: Option<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            cluster_monitor_interval: DEFAULT_CLUSTER_MONITOR_INTERVAL,
            cluster_healthy_timeout: DEFAULT_CLUSTER_HEALTHY_TIMEOUT,
            cluster_bootstrap_timeout: DEFAULT_CLUSTER_BOOTSTRAP_TIMEOUT,
            pod_recovery_timeout: DEFAULT_POD_RECOVERY_TIMEOUT,
            pod_sync_timeout: DEFAULT_POD_SYNC_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            force_bootstrap_member: None,
        }
    }
}

impl RecoveryConfig {
    /// Builds the configuration from the recovery section of a `MariaDB`
    /// spec, filling in defaults for anything unset.
    pub fn from_spec(spec: &GaleraRecoverySpec, poll_interval: Duration) -> Result<Self, ConfigError> {
        let defaults = RecoveryConfig::default();
        Ok(RecoveryConfig {
            cluster_monitor_interval: parse_duration(
                "clusterMonitorInterval",
                spec.cluster_monitor_interval.as_deref(),
                defaults.cluster_monitor_interval,
            )?,
            cluster_healthy_timeout: parse_duration(
                "clusterHealthyTimeout",
                spec.cluster_healthy_timeout.as_deref(),
                defaults.cluster_healthy_timeout,
            )?,
            cluster_bootstrap_timeout: parse_duration(
                "clusterBootstrapTimeout",
                spec.cluster_bootstrap_timeout.as_deref(),
                defaults.cluster_bootstrap_timeout,
            )?,
            pod_recovery_timeout: parse_duration(
                "podRecoveryTimeout",
                spec.pod_recovery_timeout.as_deref(),
                defaults.pod_recovery_timeout,
            )?,
            pod_sync_timeout: parse_duration(
                "podSyncTimeout",
                spec.pod_sync_timeout.as_deref(),
                defaults.pod_sync_timeout,
            )?,
            poll_interval,
            force_bootstrap_member: spec.force_cluster_bootstrap_in_pod.clone(),
        })
    }
}

fn parse_duration(
    field: &'static str,
    value: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => {
            humantime::parse_duration(value).map_err(|source| ConfigError::InvalidDuration {
                field,
                value: value.to_owned(),
                source,
            })
        }
    }
}
