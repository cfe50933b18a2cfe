//! Weight as a ready-replica ratio for the rolling-update strategy
//!
//! There is no traffic-splitting layer: the share of `maxReplicas` running
//! the canary version is the canary weight. Replica counts are written
//! directly, and the rollout is halted behind a confirm-rollout hook until
//! the canary holds all of the capacity.

use super::{RouteOutcome, Router, RouterError, Routes};
use crate::controller::cluster::{namespace_of, ApiError, ClusterApi};
use crate::controller::deployer::set_replicas;
use crate::controller::phase::{is_rolling_update, source_name};
use crate::controller::weight::{replicas_for_weight, weight_for_replicas, HUNDRED};
use crate::crd::{Canary, CanaryWebhook, HookType, Phase};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the injected manual-confirmation hook
pub const HALT_HOOK_NAME: &str = "kanary-default-halt";

pub struct ReadyRatioRouter {
    cluster: Arc<dyn ClusterApi>,
    inner: Arc<dyn Router>,
    halt_url: String,
}

impl ReadyRatioRouter {
    pub fn new(cluster: Arc<dyn ClusterApi>, inner: Arc<dyn Router>, halt_url: String) -> Self {
        Self {
            cluster,
            inner,
            halt_url,
        }
    }

    async fn route(
        &self,
        side: &'static str,
        namespace: &str,
        name: &str,
        replicas: i32,
        weight: i32,
    ) -> Result<(), RouterError> {
        set_replicas(self.cluster.as_ref(), namespace, name, replicas)
            .await
            .map_err(|source: ApiError| RouterError::Route {
                side,
                name: name.to_string(),
                namespace: namespace.to_string(),
                weight,
                source,
            })
    }

    /// Put the halt hook first and persist the Canary
    async fn halt(&self, canary: &Canary, namespace: &str) -> Result<Canary, RouterError> {
        let halted = with_halt_hook(canary, &self.halt_url);
        self.cluster
            .update_canary(namespace, &halted)
            .await
            .map_err(|source| RouterError::Halt {
                name: canary.name_any(),
                namespace: namespace.to_string(),
                source,
            })
    }
}

/// Copy of `canary` with the halt hook as its first webhook
///
/// An existing halt hook is replaced, so repeated halts never stack up.
pub fn with_halt_hook(canary: &Canary, halt_url: &str) -> Canary {
    let mut halted = canary.clone();
    let hooks = &mut halted.spec.analysis.webhooks;
    hooks.retain(|hook| hook.name != HALT_HOOK_NAME);
    hooks.insert(
        0,
        CanaryWebhook {
            name: HALT_HOOK_NAME.to_string(),
            hook_type: HookType::ConfirmRollout,
            url: halt_url.to_string(),
            timeout: None,
            metadata: None,
        },
    );
    halted
}

#[async_trait]
impl Router for ReadyRatioRouter {
    async fn initialize(&self, canary: &Canary) -> Result<(), RouterError> {
        self.inner.initialize(canary).await
    }

    /// The source stays the serving workload, there is no apex to manage
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        if is_rolling_update(canary) {
            return Ok(());
        }
        self.inner.reconcile(canary).await
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<RouteOutcome, RouterError> {
        if !is_rolling_update(canary) {
            return self
                .inner
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await;
        }

        // promotion already left every replica on the target
        if canary.phase() == Some(&Phase::Promoting) && canary_weight == 0 && primary_weight == HUNDRED
        {
            debug!(canary = %canary.name_any(), "Promotion complete, routes unchanged");
            return Ok(RouteOutcome::Applied);
        }

        let namespace = namespace_of(canary)?;
        let max = canary.spec.analysis.max_replicas;
        let canary_replicas = replicas_for_weight(canary_weight, max)?;
        let primary_replicas = max - canary_replicas;

        self.route(
            "canary",
            &namespace,
            &canary.spec.target_ref.name,
            canary_replicas,
            canary_weight,
        )
        .await?;
        self.route(
            "primary",
            &namespace,
            &source_name(canary),
            primary_replicas,
            primary_weight,
        )
        .await?;

        if canary_replicas == max {
            return Ok(RouteOutcome::Applied);
        }

        let halted = self.halt(canary, &namespace).await?;
        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            canary_replicas,
            max_replicas = max,
            "Rollout halted until confirmed"
        );
        Ok(RouteOutcome::Halted(Box::new(halted)))
    }

    async fn get_routes(&self, canary: &Canary) -> Result<Routes, RouterError> {
        if !is_rolling_update(canary) {
            return self.inner.get_routes(canary).await;
        }

        let namespace = namespace_of(canary)?;
        let target = &canary.spec.target_ref.name;
        let deployment = self
            .cluster
            .get_deployment(&namespace, target)
            .await
            .map_err(|source| RouterError::Availability {
                name: target.clone(),
                namespace: namespace.clone(),
                source,
            })?;

        let max = canary.spec.analysis.max_replicas;
        let ready = deployment
            .status
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0)
            .clamp(0, max.max(0));
        let canary_weight = weight_for_replicas(ready, max)?;
        Ok(Routes::canary_share(canary_weight))
    }

    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        if is_rolling_update(canary) {
            return Ok(());
        }
        self.inner.finalize(canary).await
    }
}
