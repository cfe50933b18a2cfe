use crate::config::ControllerConfig;
use crate::controller::clock::Clock;
use crate::controller::cluster::{namespace_of, ClusterApi, MissingNamespace};
use crate::controller::config_tracker::ConfigTracker;
use crate::controller::deployer::Deployer;
use crate::controller::phase::{is_failed, source_name};
use crate::controller::strategies::{
    select_controller, CanaryController, ControllerError, DeploymentController,
};
use crate::crd::{Canary, Phase};
use crate::router::{router_stack, RouteOutcome, Router, RouterError};
use crate::server::SharedMetrics;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Controller(#[from] ControllerError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error(transparent)]
    MissingNamespace(#[from] MissingNamespace),
}

impl ReconcileError {
    pub fn is_retriable(&self) -> bool {
        match self {
            ReconcileError::Controller(e) => e.is_retriable(),
            ReconcileError::Router(RouterError::ServiceLabel { .. })
            | ReconcileError::Router(RouterError::Weight(_)) => false,
            ReconcileError::Router(_) => true,
            ReconcileError::MissingNamespace(_) => false,
        }
    }
}

pub struct Context {
    pub cluster: Arc<dyn ClusterApi>,
    pub controller: Arc<DeploymentController>,
    pub router: Arc<dyn Router>,
    pub config: ControllerConfig,
    /// When Some, records reconciliation counts, durations and split gauges
    pub metrics: Option<SharedMetrics>,
}

impl Context {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tracker: Arc<dyn ConfigTracker>,
        clock: Arc<dyn Clock>,
        config: ControllerConfig,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        let deployer = Deployer::new(cluster.clone(), tracker, config.selector_labels.clone());
        let controller = Arc::new(DeploymentController::new(Arc::new(deployer), clock));
        let router = router_stack(cluster.clone(), &config);
        Self {
            cluster,
            controller,
            router,
            config,
            metrics,
        }
    }
}

/// Reconcile one Canary
///
/// Each tick re-derives everything from cluster state:
/// 1. initialize the primary (or check the source) and its readiness
/// 2. create the side services and point the apex at the serving workload
/// 3. advance by phase; the Progressing → Promoting/Failed verdict comes from
///    analysis outside this controller and is only read here
///
/// Terminating skips the first two steps and finalizes the router instead.
pub async fn reconcile(canary: Arc<Canary>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let start = Instant::now();
    let result = advance(&canary, &ctx).await;
    let duration_secs = start.elapsed().as_secs_f64();

    if let Some(metrics) = &ctx.metrics {
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics.record_reconciliation(outcome, duration_secs);
        if let Ok(current) = &result {
            record_split(current, &ctx, metrics).await;
        }
    }

    let current = result?;
    debug!(
        canary = %current.name_any(),
        phase = ?current.phase(),
        weight = current.status_weight(),
        duration_secs,
        "Reconciled"
    );
    Ok(Action::requeue(ctx.config.requeue_interval))
}

/// Requeue after the configured interval; the next tick retries from fresh state
pub fn error_policy(canary: Arc<Canary>, error: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        canary = %canary.name_any(),
        namespace = %canary.namespace().unwrap_or_default(),
        retriable = error.is_retriable(),
        error = %error,
        "Reconcile error (will retry)"
    );
    Action::requeue(ctx.config.requeue_interval)
}

async fn advance(canary: &Canary, ctx: &Context) -> Result<Canary, ReconcileError> {
    let controller = select_controller(canary, &ctx.controller);
    let namespace = namespace_of(canary)?;
    debug!(canary = %canary.name_any(), namespace = %namespace, strategy = controller.name(), "Reconciling");

    match canary.phase() {
        Some(Phase::Terminating) => return terminate(controller.as_ref(), ctx, canary).await,
        Some(Phase::Terminated) => return Ok(canary.clone()),
        _ => {}
    }

    let canary = controller.initialize(canary).await?.canary;
    if !canary.skip_analysis() {
        controller.is_primary_ready(&canary).await?;
    }

    ctx.router.initialize(&canary).await?;
    ctx.router.reconcile(&canary).await?;

    match canary.phase().cloned() {
        None | Some(Phase::Initializing) => {
            let updated = controller.sync_status(&canary, Phase::Initialized).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, "Canary initialized");
            Ok(updated)
        }
        Some(Phase::Initialized) | Some(Phase::Succeeded) => {
            start_if_changed(controller.as_ref(), canary).await
        }
        Some(Phase::Progressing) => {
            if is_failed(&canary) {
                let failed = controller.sync_status(&canary, Phase::Failed).await?;
                warn!(canary = %canary.name_any(), namespace = %namespace, "Failed checks reached threshold");
                return roll_back(controller.as_ref(), ctx, failed).await;
            }

            controller.is_canary_ready(&canary).await?;
            let weight = canary.status_weight();
            match ctx.router.set_routes(&canary, 100 - weight, weight, false).await? {
                RouteOutcome::Halted(halted) => Ok(*halted),
                RouteOutcome::Applied | RouteOutcome::Deferred => Ok(canary),
            }
        }
        Some(Phase::Promoting) => {
            let promoted = controller.promote(&canary).await?;
            ctx.router.set_routes(&promoted, 100, 0, false).await?;
            let finalising = controller.sync_status(&promoted, Phase::Finalising).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, "Canary promoted");
            Ok(finalising)
        }
        Some(Phase::Finalising) => {
            controller.scale_to_zero(&canary).await?;
            let succeeded = controller.sync_status(&canary, Phase::Succeeded).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, "Canary succeeded");
            Ok(succeeded)
        }
        Some(Phase::Failed) => {
            let canary = roll_back(controller.as_ref(), ctx, canary).await?;
            start_if_changed(controller.as_ref(), canary).await
        }
        // handled before initialization
        Some(Phase::Terminating) | Some(Phase::Terminated) => Ok(canary),
    }
}

/// A new target revision starts a rollout, also after a failed one
async fn start_if_changed(
    controller: &dyn CanaryController,
    canary: Canary,
) -> Result<Canary, ReconcileError> {
    if !controller.has_target_changed(&canary).await? {
        return Ok(canary);
    }
    controller.scale_from_zero(&canary).await?;
    let progressing = controller.sync_status(&canary, Phase::Progressing).await?;
    info!(canary = %canary.name_any(), "New revision detected, starting rollout");
    Ok(progressing)
}

async fn roll_back(
    controller: &dyn CanaryController,
    ctx: &Context,
    canary: Canary,
) -> Result<Canary, ReconcileError> {
    ctx.router.set_routes(&canary, 100, 0, false).await?;
    controller.scale_to_zero(&canary).await?;
    Ok(canary)
}

/// Hand routing back to the target once deletion has been requested
///
/// Nothing is initialized or reconciled here, so the primary and the apex
/// service are left as `finalize` arranged them.
async fn terminate(
    controller: &dyn CanaryController,
    ctx: &Context,
    canary: &Canary,
) -> Result<Canary, ReconcileError> {
    ctx.router.finalize(canary).await?;
    let terminated = controller.sync_status(canary, Phase::Terminated).await?;
    info!(canary = %canary.name_any(), "Routing handed back to target");
    Ok(terminated)
}

/// Gauges for the recorded weight and both sides' desired replicas
async fn record_split(canary: &Canary, ctx: &Context, metrics: &SharedMetrics) {
    let Some(namespace) = canary.namespace() else {
        return;
    };
    let name = canary.name_any();
    metrics.set_canary_weight(&namespace, &name, canary.status_weight());

    for (side, workload) in [
        ("primary", source_name(canary)),
        ("canary", canary.spec.target_ref.name.clone()),
    ] {
        match ctx.cluster.get_deployment(&namespace, &workload).await {
            Ok(deployment) => {
                let replicas = deployment.spec.and_then(|s| s.replicas).unwrap_or(0);
                metrics.set_desired_replicas(&namespace, &name, side, replicas);
            }
            Err(e) => debug!(deployment = %workload, error = %e, "Skipping replica gauge"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "reconcile_test.rs"]
mod tests;
