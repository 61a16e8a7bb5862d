// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use crate::agent::AgentError;
use crate::platform::PlatformError;
use crate::probe::ProbeError;

#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// No live member has evidence that makes it eligible. Expected while
    /// members are still reporting.
    #[error("bootstrap source not found")]
    BootstrapSourceNotFound,
    #[error("no member is safe to bootstrap")]
    SafeToBootstrapNotFound,
    #[error("cluster has no members")]
    NoMembers,
    #[error("member {0} named for forced bootstrap is not a cluster member")]
    UnknownForcedMember(String),
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl RecoveryError {
    /// Errors that stem from the cluster's configuration. Retrying cannot
    /// resolve them; a human has to edit the resource.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            RecoveryError::NoMembers | RecoveryError::UnknownForcedMember(_)
        )
    }
}
