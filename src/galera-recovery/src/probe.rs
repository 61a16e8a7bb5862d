// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! SQL-level observation of Galera members.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder};
use tracing::debug;

const SYNCED: &str = "Synced";
const PRIMARY: &str = "Primary";

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
    #[error("timed out after {0:?} connecting")]
    ConnectionTimeout(Duration),
    #[error("no connection options for member {0}")]
    UnknownMember(String),
    #[error("unexpected value {value:?} for status variable {variable}")]
    UnexpectedValue { variable: &'static str, value: String },
}

/// A member's view of the cluster it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClusterStatus {
    /// Whether the member is part of the primary component.
    pub primary: bool,
    /// Number of members in the member's component.
    pub size: i32,
}

#[async_trait]
pub trait SqlProbe: Send + Sync {
    /// Reports whether the member has caught up with the cluster and is
    /// serving queries.
    async fn is_synced(&self, member: &str) -> Result<bool, ProbeError>;

    async fn cluster_status(&self, member: &str) -> Result<ClusterStatus, ProbeError>;
}

/// A [`SqlProbe`] that opens a short-lived connection for every observation.
///
/// Members are expected to be crashing or restarting while they are probed,
/// so connections are never pooled.
#[derive(Clone, Debug)]
pub struct MySqlProbe {
    opts: BTreeMap<String, Opts>,
    connect_timeout: Duration,
}

impl MySqlProbe {
    /// Creates a probe for `members`, resolving each to a host with
    /// `host_of`.
    pub fn new<F>(
        members: &[String],
        host_of: F,
        port: u16,
        user: &str,
        password: &str,
        connect_timeout: Duration,
    ) -> Self
    where
        F: Fn(&str) -> String,
    {
        let opts = members
            .iter()
            .map(|member| {
                let opts = OptsBuilder::default()
                    .ip_or_hostname(host_of(member))
                    .tcp_port(port)
                    .user(Some(user))
                    .pass(Some(password))
                    .prefer_socket(false);
                (member.clone(), Opts::from(opts))
            })
            .collect();
        MySqlProbe {
            opts,
            connect_timeout,
        }
    }

    async fn connect(&self, member: &str) -> Result<Conn, ProbeError> {
        let opts = self
            .opts
            .get(member)
            .ok_or_else(|| ProbeError::UnknownMember(member.to_owned()))?;
        match tokio::time::timeout(self.connect_timeout, Conn::new(opts.clone())).await {
            Ok(conn) => Ok(conn?),
            Err(_) => Err(ProbeError::ConnectionTimeout(self.connect_timeout)),
        }
    }

    /// Reads a single `wsrep` status variable. A missing variable reads as
    /// empty, which is what a member without the Galera provider loaded
    /// reports.
    async fn status_variable(&self, member: &str, variable: &str) -> Result<String, ProbeError> {
        let mut conn = self.connect(member).await?;
        let row: Option<(String, String)> = conn
            .query_first(format!("SHOW STATUS LIKE '{}'", variable))
            .await?;
        if let Err(err) = conn.disconnect().await {
            debug!(%member, "error disconnecting: {err}");
        }
        Ok(row.map(|(_, value)| value).unwrap_or_default())
    }
}

#[async_trait]
impl SqlProbe for MySqlProbe {
    async fn is_synced(&self, member: &str) -> Result<bool, ProbeError> {
        let state = self
            .status_variable(member, "wsrep_local_state_comment")
            .await?;
        debug!(%member, %state, "local state");
        Ok(state == SYNCED)
    }

    async fn cluster_status(&self, member: &str) -> Result<ClusterStatus, ProbeError> {
        let status = self.status_variable(member, "wsrep_cluster_status").await?;
        let size = self.status_variable(member, "wsrep_cluster_size").await?;
        let size = parse_cluster_size(&size)?;
        Ok(ClusterStatus {
            primary: status == PRIMARY,
            size,
        })
    }
}

fn parse_cluster_size(value: &str) -> Result<i32, ProbeError> {
    if value.is_empty() {
        return Ok(0);
    }
    value.parse().map_err(|_| ProbeError::UnexpectedValue {
        variable: "wsrep_cluster_size",
        value: value.to_owned(),
    })
}
