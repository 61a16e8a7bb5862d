// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Operator metrics and the HTTP endpoint that exposes them.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    pub registry: Registry,
    /// Clusters currently unhealthy long enough to be under recovery.
    pub clusters_recovering: IntGauge,
    pub recoveries_completed: IntCounter,
    pub bootstrap_timeouts: IntCounter,
}

impl Metrics {
    pub fn register() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let clusters_recovering = IntGauge::new(
            "galera_clusters_recovering",
            "Number of Galera clusters being recovered",
        )?;
        let recoveries_completed = IntCounter::new(
            "galera_recovery_completed_total",
            "Number of Galera cluster recoveries that restarted every member",
        )?;
        let bootstrap_timeouts = IntCounter::new(
            "galera_recovery_bootstrap_timeouts_total",
            "Number of Galera cluster bootstraps abandoned after timing out",
        )?;
        registry.register(Box::new(clusters_recovering.clone()))?;
        registry.register(Box::new(recoveries_completed.clone()))?;
        registry.register(Box::new(bootstrap_timeouts.clone()))?;
        Ok(Metrics {
            registry,
            clusters_recovering,
            recoveries_completed,
            bootstrap_timeouts,
        })
    }

    fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

async fn handle_metrics(
    State(metrics): State<Arc<Metrics>>,
) -> Result<String, (StatusCode, String)> {
    metrics
        .render()
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// Serves `/metrics` on `addr` until the process exits.
pub async fn serve(addr: SocketAddr, metrics: Arc<Metrics>) -> std::io::Result<()> {
    let router = Router::new()
        .route("/metrics", get(handle_metrics))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("serving metrics on {addr}");
    axum::serve(listener, router).await
}
