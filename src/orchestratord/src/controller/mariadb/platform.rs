// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;
use galera_cloud_resources::crd::mariadb::v1alpha1::MariaDB;
use galera_recovery::{Platform, PlatformError};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::debug;

use crate::k8s::{delete_resource, get_resource};

/// Pods and status of one `MariaDB` resource.
pub struct KubePlatform {
    pod_api: Api<Pod>,
    mariadb_api: Api<MariaDB>,
    name: String,
}

impl KubePlatform {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        KubePlatform {
            pod_api: Api::namespaced(client.clone(), namespace),
            mariadb_api: Api::namespaced(client, namespace),
            name: name.to_owned(),
        }
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn pod_uid(&self, member: &str) -> Result<Option<String>, PlatformError> {
        let Some(pod) = get_resource(&self.pod_api, member).await? else {
            return Ok(None);
        };
        if pod.metadata.deletion_timestamp.is_some() {
            debug!(%member, "pod is terminating");
            return Ok(None);
        }
        Ok(pod.metadata.uid)
    }

    async fn delete_pod(&self, member: &str) -> Result<(), PlatformError> {
        delete_resource(&self.pod_api, member).await?;
        Ok(())
    }

    async fn patch_recovery_status(&self, patch: serde_json::Value) -> Result<(), PlatformError> {
        self.mariadb_api
            .patch_status(
                &self.name,
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": { "galeraRecovery": patch } })),
            )
            .await?;
        Ok(())
    }
}
