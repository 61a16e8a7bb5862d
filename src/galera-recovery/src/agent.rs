// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Client for the per-member Galera agent sidecar.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use galera_cloud_resources::crd::galera::{GaleraState, RecoveredBootstrap};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::select::BootstrapSource;

const STATE_PATH: &str = "/api/galera/state";
const RECOVERY_PATH: &str = "/api/galera/recovery";
const BOOTSTRAP_PATH: &str = "/api/galera/bootstrap";

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no agent endpoint for member {0}")]
    UnknownMember(String),
    #[error("agent transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent returned {status}: {message}")]
    Status { status: StatusCode, message: String },
}

/// The position a founder bootstraps from. Sent only when the position came
/// from log recovery, since the agent cannot otherwise know it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FounderPosition {
    pub uuid: String,
    pub seqno: i64,
}

impl From<&BootstrapSource> for FounderPosition {
    fn from(source: &BootstrapSource) -> Self {
        FounderPosition {
            uuid: source.uuid.clone(),
            seqno: source.seqno,
        }
    }
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Reads the member's on-disk `grastate.dat`.
    async fn galera_state(&self, member: &str) -> Result<GaleraState, AgentError>;

    /// Runs `mysqld --wsrep-recover` on the member and returns the recovered
    /// position.
    async fn recover(&self, member: &str) -> Result<RecoveredBootstrap, AgentError>;

    /// Configures the member to start as the founder of a new cluster on its
    /// next start.
    async fn enable_founder_mode(
        &self,
        member: &str,
        position: Option<&FounderPosition>,
    ) -> Result<(), AgentError>;
}

/// An [`AgentClient`] that speaks HTTP to the agent listening next to each
/// member.
#[derive(Clone, Debug)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    endpoints: BTreeMap<String, String>,
}

impl HttpAgentClient {
    /// Creates a client for the given members, keyed by member name and
    /// valued by the agent base URL.
    pub fn new(
        endpoints: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpAgentClient { client, endpoints })
    }

    fn url(&self, member: &str, path: &str) -> Result<String, AgentError> {
        let base = self
            .endpoints
            .get(member)
            .ok_or_else(|| AgentError::UnknownMember(member.to_owned()))?;
        Ok(format!("{}{}", base.trim_end_matches('/'), path))
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(AgentError::Status { status, message })
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AgentError> {
        let response = Self::check(response).await?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn galera_state(&self, member: &str) -> Result<GaleraState, AgentError> {
        let url = self.url(member, STATE_PATH)?;
        debug!(%member, %url, "fetching galera state");
        let response = self.client.get(url).send().await?;
        Self::decode(response).await
    }

    async fn recover(&self, member: &str) -> Result<RecoveredBootstrap, AgentError> {
        let url = self.url(member, RECOVERY_PATH)?;
        debug!(%member, %url, "requesting galera recovery");
        let response = self.client.post(url).send().await?;
        Self::decode(response).await
    }

    async fn enable_founder_mode(
        &self,
        member: &str,
        position: Option<&FounderPosition>,
    ) -> Result<(), AgentError> {
        let url = self.url(member, BOOTSTRAP_PATH)?;
        debug!(%member, %url, ?position, "enabling bootstrap");
        let mut request = self.client.put(url);
        if let Some(position) = position {
            request = request.json(position);
        }
        Self::check(request.send().await?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_join_base_and_path() {
        let client = HttpAgentClient::new(
            BTreeMap::from([(
                "mariadb-galera-0".to_owned(),
                "http://mariadb-galera-0.mariadb-galera-internal.default.svc.cluster.local:5555/"
                    .to_owned(),
            )]),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.url("mariadb-galera-0", STATE_PATH).unwrap(),
            "http://mariadb-galera-0.mariadb-galera-internal.default.svc.cluster.local:5555/api/galera/state"
        );
        assert!(matches!(
            client.url("mariadb-galera-7", STATE_PATH),
            Err(AgentError::UnknownMember(member)) if member == "mariadb-galera-7"
        ));
    }

    #[test]
    fn founder_position_wire_format() {
        let position = FounderPosition::from(&BootstrapSource {
            uuid: "6ad33a8d-5c5b-11ee-a3a4-2a2ad2a6d51a".into(),
            seqno: 42,
            member: "mariadb-galera-1".into(),
        });
        assert_eq!(
            serde_json::to_value(&position).unwrap(),
            serde_json::json!({"uuid": "6ad33a8d-5c5b-11ee-a3a4-2a2ad2a6d51a", "seqno": 42}),
        );
    }
}
