// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Crash recovery for Galera clusters.
//!
//! When a Galera cluster loses its primary component, no member can tell on
//! its own whether it holds the most advanced copy of the data. This crate
//! collects recovery evidence from every member's agent into a
//! [`RecoveryStatus`], picks the member that is allowed to bootstrap a new
//! cluster, and restarts the members one at a time, founder first, so that the
//! others rejoin as followers.
//!
//! The outside world is reached through three seams, each with a production
//! implementation:
//!
//! * [`AgentClient`]: the per-member sidecar, over HTTP ([`HttpAgentClient`]).
//! * [`SqlProbe`]: lightweight SQL connections used to observe `wsrep` status
//!   ([`MySqlProbe`]).
//! * [`Platform`]: pod lifecycle and status persistence, implemented by the
//!   controller on top of the Kubernetes API.

mod agent;
mod config;
mod error;
mod orchestrator;
mod platform;
mod poll;
mod probe;
mod select;
mod status;

pub use agent::{AgentClient, AgentError, FounderPosition, HttpAgentClient};
pub use config::{ConfigError, RecoveryConfig};
pub use error::RecoveryError;
pub use orchestrator::{RecoveryOrchestrator, RecoveryOutcome};
pub use platform::{Platform, PlatformError};
pub use poll::poll_until;
pub use probe::{ClusterStatus, MySqlProbe, ProbeError, SqlProbe};
pub use select::BootstrapSource;
pub use status::{Evidence, MemberEvidence, RecoveryStatus};

pub use galera_cloud_resources::crd::galera::{
    GaleraRecoveryStatus, GaleraState, RecoveredBootstrap, UNKNOWN_SEQNO,
};
