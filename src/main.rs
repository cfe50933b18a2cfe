use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kanary::config::ControllerConfig;
use kanary::controller::clock::SystemClock;
use kanary::controller::cluster::KubeCluster;
use kanary::controller::config_tracker::NopTracker;
use kanary::controller::{error_policy, reconcile, Context};
use kanary::crd::Canary;
use kanary::server::{
    create_metrics, run_health_server, shutdown_channel, wait_for_signal, ReadinessState,
};
use kube::runtime::{watcher, Controller};
use kube::{Api, Client};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting kanary controller");

    let config = ControllerConfig::from_env();
    info!(
        selector_labels = ?config.selector_labels,
        halt_url = %config.halt_url,
        requeue_secs = config.requeue_interval.as_secs(),
        "Configuration loaded"
    );

    let (shutdown_controller, shutdown_signal) = shutdown_channel();
    let readiness = ReadinessState::new();
    let metrics = create_metrics()?;

    let client = match Client::try_default().await {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };
    info!("Connected to Kubernetes cluster");

    let health_port = config.health_port;
    let health_readiness = readiness.clone();
    let health_metrics = metrics.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) =
            run_health_server(health_port, health_readiness, health_metrics, shutdown_signal).await
        {
            warn!(error = %e, "Health server failed");
        }
    });

    let ctx = Arc::new(Context::new(
        Arc::new(KubeCluster::new(client.clone())),
        Arc::new(NopTracker),
        Arc::new(SystemClock),
        config,
        Some(metrics),
    ));

    // Ready means initialized, not that a reconcile has succeeded
    readiness.set_ready();
    info!("Controller ready, starting reconciliation loop");

    // Primary Deployments and side Services carry the Canary as owner
    let controller = Controller::new(Api::<Canary>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Deployment>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client), watcher::Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Ok(o) = res {
                debug!(object = ?o, "Reconciled");
            }
        });

    tokio::select! {
        _ = controller => {
            info!("Controller stream ended");
        }
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => info!(signal = name, "Initiating graceful shutdown"),
                Err(e) => warn!(error = %e, "Signal handler failed, shutting down"),
            }
            readiness.set_not_ready();
        }
    }

    shutdown_controller.shutdown();
    if let Err(e) = health_handle.await {
        warn!(error = %e, "Health server task did not finish cleanly");
    }

    info!("kanary controller shut down gracefully");
    Ok(())
}
