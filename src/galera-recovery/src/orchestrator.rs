// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Drives a cluster from "no primary component" back to "all members synced".
//!
//! Each call to [`RecoveryOrchestrator::reconcile`] makes as much progress as
//! it can and reports where it stopped. All progress is written back through
//! [`Platform::patch_recovery_status`] as it is made, so a controller that
//! restarts mid-recovery resumes where the previous one left off.

use std::iter;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use galera_cloud_resources::crd::galera::GaleraRecoveryStatus;
use tracing::{debug, info, instrument, warn};

use crate::agent::{AgentClient, FounderPosition};
use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::platform::{Platform, PlatformError};
use crate::poll::poll_until;
use crate::probe::{ProbeError, SqlProbe};
use crate::status::RecoveryStatus;

/// Where a reconciliation pass left the recovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Not enough evidence to choose a founder yet.
    CollectingEvidence,
    /// A founder was chosen but the cluster has not been brought back yet.
    Bootstrapping,
    /// Every member was restarted and synced.
    Recovered,
    /// Bootstrapping took too long. All evidence was discarded so the next
    /// pass starts over.
    TimedOut,
}

pub struct RecoveryOrchestrator<'a> {
    config: &'a RecoveryConfig,
    agents: &'a dyn AgentClient,
    probe: &'a dyn SqlProbe,
    platform: &'a dyn Platform,
    status: RecoveryStatus,
    /// The status as last written, the baseline for the next merge patch.
    persisted: GaleraRecoveryStatus,
}

impl<'a> RecoveryOrchestrator<'a> {
    pub fn new(
        config: &'a RecoveryConfig,
        agents: &'a dyn AgentClient,
        probe: &'a dyn SqlProbe,
        platform: &'a dyn Platform,
        persisted: Option<&GaleraRecoveryStatus>,
    ) -> Self {
        let persisted = persisted.cloned().unwrap_or_default();
        RecoveryOrchestrator {
            config,
            agents,
            probe,
            platform,
            status: RecoveryStatus::from(&persisted),
            persisted,
        }
    }

    pub fn status(&self) -> &RecoveryStatus {
        &self.status
    }

    /// Runs one recovery pass over the live `members`, in ordinal order.
    #[instrument(skip_all, fields(members = members.len()))]
    pub async fn reconcile(&mut self, members: &[String]) -> Result<RecoveryOutcome, RecoveryError> {
        if members.is_empty() {
            return Err(RecoveryError::NoMembers);
        }
        if let Some(forced) = &self.config.force_bootstrap_member {
            if !members.contains(forced) {
                return Err(RecoveryError::UnknownForcedMember(forced.clone()));
            }
        }

        if self.status.is_bootstrapping() {
            if self
                .status
                .bootstrap_timeout(self.config.cluster_bootstrap_timeout)
            {
                warn!(
                    since = ?self.status.bootstrapping_since(),
                    timeout = ?self.config.cluster_bootstrap_timeout,
                    "cluster bootstrap timed out, discarding recovery evidence"
                );
                return self.abandon().await;
            }
            if self.status.pods_restarted() {
                return Ok(RecoveryOutcome::Recovered);
            }
            match self.status.bootstrap_member() {
                Some(founder) if members.iter().any(|member| member == founder) => {
                    let founder = founder.to_owned();
                    info!(%founder, "resuming bootstrap");
                    return self.bootstrap(&founder, members).await;
                }
                founder => {
                    warn!(?founder, "bootstrap member is gone, starting over");
                    self.status.reset();
                    self.persist().await;
                }
            }
        }

        self.collect_evidence(members).await;

        let Some(founder) = self.choose_founder(members) else {
            return Ok(RecoveryOutcome::CollectingEvidence);
        };
        self.status.set_bootstrapping(&founder);
        self.persist().await;
        self.bootstrap(&founder, members).await
    }

    async fn collect_evidence(&mut self, members: &[String]) {
        let agents = self.agents;

        let states = join_all(
            members
                .iter()
                .map(|member| async move { (member, agents.galera_state(member).await) }),
        )
        .await;
        for (member, result) in states {
            match result {
                Ok(state) => {
                    debug!(%member, ?state, "galera state");
                    self.status.set_state(member, state);
                }
                Err(err) => warn!(%member, "failed to get galera state: {err}"),
            }
        }
        self.persist().await;

        if self.config.force_bootstrap_member.is_some() {
            return;
        }
        let missing = if !self.status.is_complete(members) {
            self.status.missing_evidence(members)
        } else if self.status.bootstrap_source(members).is_err() {
            // Complete, but every recovered position had an unknown seqno.
            self.status.unpositioned(members)
        } else {
            return;
        };

        let timeout = self.config.pod_recovery_timeout;
        info!(?missing, "recovering galera positions");
        let recovered = join_all(missing.into_iter().map(|member| async move {
            let result = tokio::time::timeout(timeout, agents.recover(member)).await;
            (member, result)
        }))
        .await;
        for (member, result) in recovered {
            match result {
                Ok(Ok(recovered)) => {
                    debug!(%member, ?recovered, "recovered galera position");
                    self.status.set_recovered(member, recovered);
                }
                Ok(Err(err)) => warn!(%member, "failed to recover galera position: {err}"),
                Err(_) => warn!(%member, ?timeout, "timed out recovering galera position"),
            }
        }
        self.persist().await;
    }

    fn choose_founder(&self, members: &[String]) -> Option<String> {
        if let Some(forced) = &self.config.force_bootstrap_member {
            info!(member = %forced, "forcing cluster bootstrap");
            return Some(forced.clone());
        }
        if !self.status.is_complete(members) {
            debug!(
                missing = ?self.status.missing_evidence(members),
                "recovery evidence incomplete"
            );
            return None;
        }
        match self.status.bootstrap_source(members) {
            Ok(source) => {
                info!(
                    member = %source.member,
                    uuid = %source.uuid,
                    seqno = source.seqno,
                    "selected bootstrap source"
                );
                Some(source.member)
            }
            Err(err) => {
                debug!("{err}");
                None
            }
        }
    }

    /// The position the founder must bootstrap from: the selected source's if
    /// the founder won selection, else whatever the founder last reported.
    fn founder_position(&self, founder: &str, members: &[String]) -> Option<FounderPosition> {
        if let Ok(source) = self.status.bootstrap_source(members) {
            if source.member == founder {
                return Some(FounderPosition::from(&source));
            }
        }
        let (uuid, seqno) = self.status.evidence(founder)?.candidate().position()?;
        Some(FounderPosition {
            uuid: uuid.to_owned(),
            seqno,
        })
    }

    async fn bootstrap(
        &mut self,
        founder: &str,
        members: &[String],
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let position = self.founder_position(founder, members);
        if let Err(err) = self
            .agents
            .enable_founder_mode(founder, position.as_ref())
            .await
        {
            warn!(%founder, "failed to enable bootstrap: {err}");
            return Ok(RecoveryOutcome::Bootstrapping);
        }

        let remaining = self
            .status
            .bootstrap_deadline(self.config.cluster_bootstrap_timeout)
            .and_then(|deadline| (deadline - Utc::now()).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let restarted = match tokio::time::timeout(remaining, self.restart_members(founder, members))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RecoveryError::Timeout {
                what: "cluster bootstrap".into(),
                after: self.config.cluster_bootstrap_timeout,
            }),
        };
        match restarted {
            Ok(()) => {
                info!(%founder, "cluster recovered");
                self.status.set_pods_restarted(true);
                self.persist().await;
                Ok(RecoveryOutcome::Recovered)
            }
            Err(err) => {
                warn!(%founder, "failed to restart members: {err}");
                self.abandon().await
            }
        }
    }

    /// Restarts the founder and then every other member in list order,
    /// waiting for each to sync before moving on.
    async fn restart_members(&self, founder: &str, members: &[String]) -> Result<(), RecoveryError> {
        let order = iter::once(founder).chain(
            members
                .iter()
                .map(String::as_str)
                .filter(|member| *member != founder),
        );
        for member in order {
            self.restart_member(member).await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart_member(&self, member: &str) -> Result<(), RecoveryError> {
        let platform = self.platform;
        let probe = self.probe;
        let interval = self.config.poll_interval;
        let timeout = self.config.pod_sync_timeout;

        let old_uid = poll_until(&format!("pod {member}"), interval, timeout, || async move {
            platform.pod_uid(member).await
        })
        .await?;

        info!("restarting pod");
        poll_until(
            &format!("deletion of pod {member}"),
            interval,
            timeout,
            || async move { platform.delete_pod(member).await.map(Some) },
        )
        .await?;

        let old_uid = old_uid.as_str();
        poll_until(
            &format!("pod {member} to be recreated"),
            interval,
            timeout,
            || async move {
                let uid = platform.pod_uid(member).await?;
                Ok::<_, PlatformError>(uid.filter(|uid| uid != old_uid))
            },
        )
        .await?;

        poll_until(
            &format!("member {member} to sync"),
            interval,
            timeout,
            || async move {
                let synced = probe.is_synced(member).await?;
                Ok::<_, ProbeError>(synced.then_some(()))
            },
        )
        .await?;
        info!("member synced");
        Ok(())
    }

    async fn abandon(&mut self) -> Result<RecoveryOutcome, RecoveryError> {
        self.status.reset();
        self.persist().await;
        Ok(RecoveryOutcome::TimedOut)
    }

    /// Writes whatever changed since the last successful write. Failures are
    /// logged and left for the next write, which patches against the same
    /// baseline.
    async fn persist(&mut self) {
        let next = self.status.to_persisted();
        let patch = match self.persisted.merge_patch(&next) {
            Ok(Some(patch)) => patch,
            Ok(None) => return,
            Err(err) => {
                warn!("failed to encode recovery status: {err}");
                return;
            }
        };
        debug!(%patch, "patching recovery status");
        match self.platform.patch_recovery_status(patch).await {
            Ok(()) => self.persisted = next,
            Err(err) => warn!("failed to persist recovery status: {err}"),
        }
    }
}
