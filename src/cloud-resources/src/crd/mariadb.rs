// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use k8s_openapi::api::core::v1::SecretKeySelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::galera::GaleraRecoveryStatus;

pub const DEFAULT_SQL_PORT: i32 = 3306;
pub const DEFAULT_AGENT_PORT: i32 = 5555;

pub mod v1alpha1 {
    use super::*;

    #[derive(
        CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
    )]
    #[serde(rename_all = "camelCase")]
    #[kube(
        namespaced,
        group = "k8s.mariadb.com",
        version = "v1alpha1",
        kind = "MariaDB",
        singular = "mariadb",
        plural = "mariadbs",
        shortname = "mdb",
        status = "MariaDBStatus",
        printcolumn = r#"{"name": "Replicas", "type": "integer", "description": "Number of cluster members.", "jsonPath": ".spec.replicas"}"#,
        printcolumn = r#"{"name": "Ready", "type": "string", "description": "Galera cluster readiness.", "jsonPath": ".status.conditions[?(@.type==\"GaleraReady\")].status"}"#
    )]
    pub struct MariaDBSpec {
        /// Number of cluster members. Members are named `<name>-<index>`.
        pub replicas: i32,
        /// SQL port each member listens on. Defaults to 3306.
        pub port: Option<i32>,
        /// Reference to the root password, used by the controller's
        /// health probes.
        pub root_password_secret_key_ref: SecretKeySelector,
        #[serde(default)]
        pub galera: GaleraSpec,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct GaleraSpec {
        #[serde(default)]
        pub agent: AgentSpec,
        #[serde(default)]
        pub recovery: GaleraRecoverySpec,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct AgentSpec {
        /// Port of the agent sidecar's HTTP API. Defaults to 5555.
        pub port: Option<i32>,
    }

    /// Controls automatic recovery after the cluster loses its primary
    /// component.
    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct GaleraRecoverySpec {
        /// Whether the controller may recover the cluster. Defaults to true.
        pub enabled: Option<bool>,
        /// Smallest primary component considered healthy, as a member count
        /// or a percentage of replicas. Defaults to 1.
        pub min_cluster_size: Option<IntOrString>,
        /// How often a healthy cluster is checked. Defaults to "10s".
        pub cluster_monitor_interval: Option<String>,
        /// How long the cluster must be unhealthy before recovery starts.
        /// Defaults to "30s".
        pub cluster_healthy_timeout: Option<String>,
        /// How long the bootstrap phase may take before evidence is discarded
        /// and recovery starts over. Defaults to "10m".
        pub cluster_bootstrap_timeout: Option<String>,
        /// Bound on a single member's local log recovery. Defaults to "5m".
        pub pod_recovery_timeout: Option<String>,
        /// Bound on a member being recreated and reporting synced after a
        /// restart. Defaults to "5m".
        pub pod_sync_timeout: Option<String>,
        /// Bootstrap the cluster from this member, skipping source selection.
        /// Committed transactions on other members may be lost.
        pub force_cluster_bootstrap_in_pod: Option<String>,
    }

    #[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    pub struct MariaDBStatus {
        #[serde(default)]
        pub conditions: Vec<Condition>,
        pub galera_recovery: Option<GaleraRecoveryStatus>,
    }

    impl MariaDB {
        /// Names of the members the cluster is declared to have, in index
        /// order.
        pub fn members(&self) -> Vec<String> {
            let name = self.name_unchecked();
            (0..self.spec.replicas.max(0))
                .map(|index| format!("{name}-{index}"))
                .collect()
        }

        pub fn internal_service_name(&self) -> String {
            format!("{}-internal", self.name_unchecked())
        }

        /// Stable DNS name of a member behind the headless internal service.
        pub fn member_fqdn(&self, member: &str) -> String {
            format!(
                "{}.{}.{}.svc.cluster.local",
                member,
                self.internal_service_name(),
                self.namespace().unwrap_or_default(),
            )
        }

        pub fn sql_port(&self) -> i32 {
            self.spec.port.unwrap_or(DEFAULT_SQL_PORT)
        }

        pub fn agent_port(&self) -> i32 {
            self.spec.galera.agent.port.unwrap_or(DEFAULT_AGENT_PORT)
        }

        pub fn agent_endpoint(&self, member: &str) -> String {
            format!("http://{}:{}", self.member_fqdn(member), self.agent_port())
        }

        pub fn recovery_enabled(&self) -> bool {
            self.spec.galera.recovery.enabled.unwrap_or(true)
        }

        pub fn status(&self) -> MariaDBStatus {
            self.status.clone().unwrap_or_default()
        }

        pub fn galera_recovery_status(&self) -> Option<&GaleraRecoveryStatus> {
            self.status
                .as_ref()
                .and_then(|status| status.galera_recovery.as_ref())
        }

        pub fn condition(&self, type_: &str) -> Option<&Condition> {
            self.status
                .as_ref()?
                .conditions
                .iter()
                .find(|condition| condition.type_ == type_)
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;
    use serde_json::json;

    use super::v1alpha1::*;

    fn mariadb(replicas: i32) -> MariaDB {
        let mut mdb = MariaDB::new(
            "mariadb-galera",
            MariaDBSpec {
                replicas,
                ..Default::default()
            },
        );
        mdb.metadata = ObjectMeta {
            name: Some("mariadb-galera".into()),
            namespace: Some("databases".into()),
            ..Default::default()
        };
        mdb
    }

    #[test]
    fn members_follow_naming_convention() {
        assert_eq!(
            mariadb(3).members(),
            vec!["mariadb-galera-0", "mariadb-galera-1", "mariadb-galera-2"]
        );
        assert!(mariadb(0).members().is_empty());
        assert!(mariadb(-2).members().is_empty());
    }

    #[test]
    fn member_addresses() {
        let mdb = mariadb(3);
        assert_eq!(
            mdb.member_fqdn("mariadb-galera-1"),
            "mariadb-galera-1.mariadb-galera-internal.databases.svc.cluster.local"
        );
        assert_eq!(
            mdb.agent_endpoint("mariadb-galera-1"),
            "http://mariadb-galera-1.mariadb-galera-internal.databases.svc.cluster.local:5555"
        );
        assert_eq!(mdb.sql_port(), 3306);
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: MariaDBSpec = serde_json::from_value(json!({
            "replicas": 3,
            "rootPasswordSecretKeyRef": {"name": "mariadb", "key": "root-password"},
            "galera": {
                "recovery": {
                    "minClusterSize": "50%",
                    "clusterBootstrapTimeout": "15m",
                    "forceClusterBootstrapInPod": "mariadb-galera-2",
                },
            },
        }))
        .unwrap();
        assert_eq!(spec.galera.agent.port, None);
        assert_eq!(
            spec.galera.recovery.force_cluster_bootstrap_in_pod.as_deref(),
            Some("mariadb-galera-2")
        );
        let mdb = MariaDB::new("mariadb-galera", spec);
        assert!(mdb.recovery_enabled());
        assert_eq!(mdb.agent_port(), 5555);
    }

    #[test]
    fn crd_exposes_status_subresource() {
        let crd = MariaDB::crd();
        assert_eq!(crd.spec.group, "k8s.mariadb.com");
        assert_eq!(crd.spec.names.kind, "MariaDB");
        let version = &crd.spec.versions[0];
        assert_eq!(version.name, "v1alpha1");
        assert!(
            version
                .subresources
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .is_some()
        );
    }
}
