// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("failed to encode status: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pod lifecycle and status persistence for one cluster.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Returns the UID of the member's pod, or `None` if the pod does not
    /// exist or is being deleted.
    async fn pod_uid(&self, member: &str) -> Result<Option<String>, PlatformError>;

    /// Deletes the member's pod so that it is recreated. Deleting a pod that
    /// is already gone succeeds.
    async fn delete_pod(&self, member: &str) -> Result<(), PlatformError>;

    /// Applies a JSON merge patch to the persisted recovery status.
    async fn patch_recovery_status(&self, patch: serde_json::Value) -> Result<(), PlatformError>;
}
