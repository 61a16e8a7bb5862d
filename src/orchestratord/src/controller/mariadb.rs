// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use galera_cloud_resources::crd::mariadb::v1alpha1::MariaDB;
use galera_cloud_resources::crd::{
    CONDITION_GALERA_READY, CONDITION_READY, new_condition, upsert_condition,
};
use galera_recovery::{
    HttpAgentClient, MySqlProbe, RecoveryConfig, RecoveryError, RecoveryOrchestrator,
    RecoveryOutcome,
};
use k8s_openapi::api::core::v1::{Secret, SecretKeySelector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::Error;
use crate::k8s::get_resource;
use crate::metrics::Metrics;

mod health;
mod platform;

use platform::KubePlatform;

const ROOT_USER: &str = "root";

#[derive(clap::Parser)]
pub struct Args {
    /// Interval between attempts of polled recovery steps.
    #[clap(
        long,
        env = "GALERA_POLL_INTERVAL",
        value_parser = humantime::parse_duration,
        default_value = "1s"
    )]
    poll_interval: Duration,
    /// Timeout for each request to a member's agent.
    #[clap(
        long,
        env = "GALERA_AGENT_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "10s"
    )]
    agent_timeout: Duration,
    /// Timeout for opening a SQL connection to a member.
    #[clap(
        long,
        env = "GALERA_SQL_CONNECT_TIMEOUT",
        value_parser = humantime::parse_duration,
        default_value = "5s"
    )]
    sql_connect_timeout: Duration,
}

/// Per-cluster settings derived from a `MariaDB` spec.
#[derive(Debug, PartialEq)]
struct ClusterSettings {
    recovery: RecoveryConfig,
    min_cluster_size: i32,
    sql_port: u16,
}

impl ClusterSettings {
    fn new(mariadb: &MariaDB, poll_interval: Duration) -> Result<Self, String> {
        let replicas = mariadb.spec.replicas;
        if replicas <= 0 {
            return Err(format!("replicas must be positive, got {replicas}"));
        }
        let spec = &mariadb.spec.galera.recovery;
        let recovery =
            RecoveryConfig::from_spec(spec, poll_interval).map_err(|e| e.to_string())?;
        let min_cluster_size = health::min_cluster_size(spec.min_cluster_size.as_ref(), replicas)?;
        let sql_port = u16::try_from(mariadb.sql_port())
            .map_err(|_| format!("invalid port {}", mariadb.sql_port()))?;
        Ok(ClusterSettings {
            recovery,
            min_cluster_size,
            sql_port,
        })
    }
}

/// Reads the root password out of the secret `selector` points at.
fn root_password(secret: Option<&Secret>, selector: &SecretKeySelector) -> Result<String, String> {
    let secret = secret.ok_or_else(|| format!("secret {} not found", selector.name))?;
    let value = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&selector.key))
        .ok_or_else(|| format!("secret {} has no key {}", selector.name, selector.key))?;
    String::from_utf8(value.0.clone()).map_err(|_| {
        format!(
            "key {} of secret {} is not valid UTF-8",
            selector.key, selector.name
        )
    })
}

pub struct Context {
    config: Args,
    metrics: Arc<Metrics>,
    recovering: Mutex<BTreeSet<String>>,
}

impl Context {
    pub fn new(config: Args, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            recovering: Default::default(),
        }
    }

    fn set_recovering(&self, mariadb: &MariaDB, recovering: bool) {
        let key = format!(
            "{}/{}",
            mariadb.namespace().unwrap_or_default(),
            mariadb.name_unchecked()
        );
        let mut recovering_set = self
            .recovering
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if recovering {
            recovering_set.insert(key);
        } else {
            recovering_set.remove(&key);
        }
        self.metrics
            .clusters_recovering
            .set(i64::try_from(recovering_set.len()).unwrap_or(i64::MAX));
    }

    /// Writes `conditions` and, if set, `galeraRecovery` with a merge patch on
    /// the status subresource.
    async fn patch_status(
        &self,
        mariadb_api: &Api<MariaDB>,
        mariadb: &MariaDB,
        conditions: &[Condition],
        clear_recovery: bool,
    ) -> Result<(), kube::Error> {
        let mut status = json!({ "conditions": conditions });
        if clear_recovery {
            status["galeraRecovery"] = serde_json::Value::Null;
        }
        mariadb_api
            .patch_status(
                &mariadb.name_unchecked(),
                &PatchParams::default(),
                &Patch::Merge(json!({ "status": status })),
            )
            .await?;
        Ok(())
    }

    async fn set_invalid_configuration(
        &self,
        mariadb_api: &Api<MariaDB>,
        mariadb: &MariaDB,
        message: String,
    ) -> Result<Option<Action>, Error> {
        warn!(%message, "invalid configuration");
        self.set_recovering(mariadb, false);
        let mut conditions = mariadb.status().conditions;
        let changed = upsert_condition(
            &mut conditions,
            new_condition(
                CONDITION_READY,
                false,
                "InvalidConfiguration",
                message,
                mariadb.meta().generation,
            ),
        );
        if changed {
            self.patch_status(mariadb_api, mariadb, &conditions, false)
                .await?;
        }
        // Fixing the configuration changes the resource, which triggers
        // another reconciliation.
        Ok(None)
    }
}

#[async_trait::async_trait]
impl k8s_controller::Context for Context {
    type Resource = MariaDB;
    type Error = Error;

    const FINALIZER_NAME: &'static str = "orchestratord.k8s.mariadb.com/galera-recovery";

    #[instrument(skip(self, client, mariadb), fields(mariadb = %mariadb.name_unchecked()))]
    async fn apply(
        &self,
        client: Client,
        mariadb: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        let namespace = mariadb
            .namespace()
            .ok_or_else(|| anyhow!("MariaDB {} has no namespace", mariadb.name_unchecked()))?;
        let mariadb_api: Api<MariaDB> = Api::namespaced(client.clone(), &namespace);
        let generation = mariadb.meta().generation;

        let settings = match ClusterSettings::new(mariadb, self.config.poll_interval) {
            Ok(settings) => settings,
            Err(message) => {
                return self
                    .set_invalid_configuration(&mariadb_api, mariadb, message)
                    .await;
            }
        };
        let monitor_interval = settings.recovery.cluster_monitor_interval;

        let selector = &mariadb.spec.root_password_secret_key_ref;
        let secret_api: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let secret = get_resource(&secret_api, &selector.name).await?;
        let password = match root_password(secret.as_ref(), selector) {
            Ok(password) => password,
            Err(message) => {
                self.set_invalid_configuration(&mariadb_api, mariadb, message)
                    .await?;
                // Secrets are not watched, so check again later.
                return Ok(Some(Action::requeue(monitor_interval)));
            }
        };
        let members = mariadb.members();
        let probe = MySqlProbe::new(
            &members,
            |member| mariadb.member_fqdn(member),
            settings.sql_port,
            ROOT_USER,
            &password,
            self.config.sql_connect_timeout,
        );

        let statuses = health::probe_cluster(&probe, &members).await;
        let mut conditions = mariadb.status().conditions;

        if health::is_healthy(&statuses, settings.min_cluster_size) {
            self.set_recovering(mariadb, false);
            let mut changed = upsert_condition(
                &mut conditions,
                new_condition(
                    CONDITION_GALERA_READY,
                    true,
                    "Healthy",
                    "Galera cluster has a primary component",
                    generation,
                ),
            );
            changed |= upsert_condition(
                &mut conditions,
                new_condition(CONDITION_READY, true, "Healthy", "Running", generation),
            );
            let recovering = mariadb.galera_recovery_status().is_some();
            if recovering {
                info!("galera cluster is healthy again");
            }
            if changed || recovering {
                self.patch_status(&mariadb_api, mariadb, &conditions, recovering)
                    .await?;
            }
            return Ok(Some(Action::requeue(monitor_interval)));
        }

        let message = format!(
            "Galera cluster has no primary component of at least {} members",
            settings.min_cluster_size
        );
        let mut changed = upsert_condition(
            &mut conditions,
            new_condition(
                CONDITION_GALERA_READY,
                false,
                "NotHealthy",
                message.clone(),
                generation,
            ),
        );
        changed |= upsert_condition(
            &mut conditions,
            new_condition(CONDITION_READY, false, "NotHealthy", message, generation),
        );
        if changed {
            self.patch_status(&mariadb_api, mariadb, &conditions, false)
                .await?;
        }

        if !mariadb.recovery_enabled() {
            debug!("galera cluster is unhealthy, recovery is disabled");
            return Ok(Some(Action::requeue(monitor_interval)));
        }

        // A recovery that already started is resumed immediately.
        if mariadb.galera_recovery_status().is_none() {
            let unhealthy_since = conditions
                .iter()
                .find(|condition| condition.type_ == CONDITION_GALERA_READY)
                .map_or_else(Utc::now, |condition| condition.last_transition_time.0);
            let unhealthy_for = (Utc::now() - unhealthy_since)
                .to_std()
                .unwrap_or_default();
            let healthy_timeout = settings.recovery.cluster_healthy_timeout;
            if unhealthy_for < healthy_timeout {
                debug!(?unhealthy_for, "galera cluster is unhealthy, waiting before recovering");
                return Ok(Some(Action::requeue(
                    (healthy_timeout - unhealthy_for).min(monitor_interval),
                )));
            }
        }

        self.set_recovering(mariadb, true);
        let endpoints: BTreeMap<_, _> = members
            .iter()
            .map(|member| (member.clone(), mariadb.agent_endpoint(member)))
            .collect();
        let agents =
            HttpAgentClient::new(endpoints, self.config.agent_timeout).map_err(RecoveryError::from)?;
        let platform = KubePlatform::new(client.clone(), &namespace, &mariadb.name_unchecked());
        let already_recovered = mariadb
            .galera_recovery_status()
            .and_then(|status| status.pods_restarted)
            .unwrap_or(false);

        let mut orchestrator = RecoveryOrchestrator::new(
            &settings.recovery,
            &agents,
            &probe,
            &platform,
            mariadb.galera_recovery_status(),
        );
        match orchestrator.reconcile(&members).await {
            Ok(outcome) => {
                debug!(?outcome, "recovery pass finished");
                match outcome {
                    RecoveryOutcome::Recovered if !already_recovered => {
                        self.metrics.recoveries_completed.inc();
                    }
                    RecoveryOutcome::TimedOut => self.metrics.bootstrap_timeouts.inc(),
                    _ => {}
                }
                Ok(Some(Action::requeue(monitor_interval)))
            }
            Err(err) if err.is_config_error() => {
                self.set_invalid_configuration(&mariadb_api, mariadb, err.to_string())
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    #[instrument(skip(self, _client, mariadb), fields(mariadb = %mariadb.name_unchecked()))]
    async fn cleanup(
        &self,
        _client: Client,
        mariadb: &Self::Resource,
    ) -> Result<Option<Action>, Self::Error> {
        self.set_recovering(mariadb, false);

        Ok(None)
    }
}
