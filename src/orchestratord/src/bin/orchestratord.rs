// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use galera_orchestratord::controller;
use galera_orchestratord::metrics::{self, Metrics};
use kube::config::KubeConfigOptions;
use kube::runtime::watcher;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(clap::Parser)]
#[clap(name = "orchestratord", about = "Recovers crashed Galera clusters.")]
pub struct Args {
    /// Kubeconfig context to use. Defaults to the in-cluster configuration
    /// or the current context.
    #[clap(long, env = "KUBERNETES_CONTEXT")]
    kubernetes_context: Option<String>,
    /// Only watch `MariaDB` resources in this namespace. Defaults to all
    /// namespaces.
    #[clap(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,
    #[clap(long, env = "METRICS_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    metrics_listen_addr: SocketAddr,
    #[clap(long, env = "LOG_FILTER", default_value = "info")]
    log_filter: String,

    #[clap(flatten)]
    mariadb: controller::mariadb::Args,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("orchestratord: fatal: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).context("parsing --log-filter")?,
        )
        .init();

    let client = match &args.kubernetes_context {
        Some(context) => {
            let config = kube::Config::from_kubeconfig(&KubeConfigOptions {
                context: Some(context.clone()),
                ..Default::default()
            })
            .await
            .with_context(|| format!("loading kubeconfig context {context}"))?;
            kube::Client::try_from(config)?
        }
        None => kube::Client::try_default().await?,
    };

    let metrics = Arc::new(Metrics::register()?);
    let metrics_listen_addr = args.metrics_listen_addr;
    spawn_metrics_server(metrics_listen_addr, Arc::clone(&metrics));

    let context = controller::mariadb::Context::new(args.mariadb, metrics);
    let controller = match &args.namespace {
        Some(namespace) => {
            info!(%namespace, "watching MariaDB resources");
            k8s_controller::Controller::namespaced(
                client,
                context,
                namespace,
                watcher::Config::default(),
            )
        }
        None => {
            info!("watching MariaDB resources in all namespaces");
            k8s_controller::Controller::namespaced_all(client, context, watcher::Config::default())
        }
    };
    controller.run().await;

    info!("controller stopped");
    Ok(())
}

fn spawn_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>) {
    tokio::spawn(async move {
        if let Err(err) = metrics::serve(addr, metrics).await {
            error!("metrics server failed: {err}");
        }
    });
}
