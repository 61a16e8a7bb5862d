// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use futures::future::join_all;
use galera_recovery::{ClusterStatus, SqlProbe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

pub const DEFAULT_MIN_CLUSTER_SIZE: i32 = 1;

/// Resolves `minClusterSize` against the declared replica count. Percentages
/// round up, so "50%" of 3 replicas is 2.
pub fn min_cluster_size(value: Option<&IntOrString>, replicas: i32) -> Result<i32, String> {
    let size = match value {
        None => DEFAULT_MIN_CLUSTER_SIZE,
        Some(IntOrString::Int(size)) => *size,
        Some(IntOrString::String(value)) => {
            let percent: i64 = value
                .strip_suffix('%')
                .and_then(|percent| percent.trim().parse().ok())
                .filter(|percent| (0..=100).contains(percent))
                .ok_or_else(|| format!("invalid minClusterSize {value:?}"))?;
            let size = (i64::from(replicas) * percent + 99) / 100;
            i32::try_from(size).map_err(|_| format!("invalid minClusterSize {value:?}"))?
        }
    };
    if size < 1 || size > replicas {
        return Err(format!(
            "minClusterSize resolves to {size}, must be between 1 and {replicas}"
        ));
    }
    Ok(size)
}

/// A cluster is healthy if any member sees a primary component of at least
/// `min_size` members.
pub fn is_healthy(statuses: &[ClusterStatus], min_size: i32) -> bool {
    statuses
        .iter()
        .any(|status| status.primary && status.size >= min_size)
}

/// Probes every member concurrently. Members that cannot be reached are left
/// out.
pub async fn probe_cluster(probe: &dyn SqlProbe, members: &[String]) -> Vec<ClusterStatus> {
    let results = join_all(
        members
            .iter()
            .map(|member| async move { (member, probe.cluster_status(member).await) }),
    )
    .await;
    results
        .into_iter()
        .filter_map(|(member, result)| match result {
            Ok(status) => {
                debug!(%member, ?status, "cluster status");
                Some(status)
            }
            Err(err) => {
                debug!(%member, "failed to probe cluster status: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_cluster_size_resolution() {
        assert_eq!(min_cluster_size(None, 3), Ok(1));
        assert_eq!(min_cluster_size(Some(&IntOrString::Int(2)), 3), Ok(2));
        assert_eq!(
            min_cluster_size(Some(&IntOrString::String("50%".into())), 3),
            Ok(2)
        );
        assert_eq!(
            min_cluster_size(Some(&IntOrString::String("100%".into())), 5),
            Ok(5)
        );
        assert_eq!(
            min_cluster_size(Some(&IntOrString::String("34%".into())), 3),
            Ok(2)
        );
    }

    #[test]
    fn invalid_min_cluster_size() {
        assert!(min_cluster_size(Some(&IntOrString::Int(4)), 3).is_err());
        assert!(min_cluster_size(Some(&IntOrString::Int(0)), 3).is_err());
        assert!(min_cluster_size(Some(&IntOrString::String("half".into())), 3).is_err());
        assert!(min_cluster_size(Some(&IntOrString::String("150%".into())), 3).is_err());
    }

    #[test]
    fn health_requires_a_large_enough_primary() {
        let primary = |size| ClusterStatus {
            primary: true,
            size,
        };
        let non_primary = ClusterStatus {
            primary: false,
            size: 3,
        };
        assert!(is_healthy(&[non_primary, primary(2)], 2));
        assert!(!is_healthy(&[non_primary, primary(1)], 2));
        assert!(!is_healthy(&[non_primary], 1));
        assert!(!is_healthy(&[], 1));
    }
}
