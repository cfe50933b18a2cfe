//! Capacity-safety wrapper for the extension strategy
//!
//! Under the extension strategy primary and canary share `maxReplicas`, so
//! every weight change is also a replica change. Invariants after a
//! Progressing `set_routes`:
//! - canaryWeight > 0 implies canary desired replicas >= 1
//! - canaryWeight != 100 implies primary desired replicas >= 1
//! - the inner router is only asked to route when both sides can serve

use super::{RouteOutcome, Router, RouterError, Routes};
use crate::controller::cluster::{namespace_of, ApiError, ClusterApi};
use crate::controller::deployer::set_replicas;
use crate::controller::phase::{
    is_extension_on, is_failed, is_promoted, is_stepped_weight, source_name,
};
use crate::controller::weight::{replicas_for_weight, HUNDRED};
use crate::crd::Canary;
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

pub struct ScalableRouter {
    cluster: Arc<dyn ClusterApi>,
    inner: Arc<dyn Router>,
}

impl ScalableRouter {
    pub fn new(cluster: Arc<dyn ClusterApi>, inner: Arc<dyn Router>) -> Self {
        Self { cluster, inner }
    }

    async fn available_replicas(&self, namespace: &str, name: &str) -> Result<i32, RouterError> {
        let deployment = self
            .cluster
            .get_deployment(namespace, name)
            .await
            .map_err(|source| RouterError::Availability {
                name: name.to_string(),
                namespace: namespace.to_string(),
                source,
            })?;
        Ok(deployment
            .status
            .and_then(|s| s.available_replicas)
            .unwrap_or(0))
    }

    /// A side can take traffic when it gets none or has an available replica
    async fn routable(&self, namespace: &str, name: &str, weight: i32) -> Result<bool, RouterError> {
        if weight == 0 {
            return Ok(true);
        }
        Ok(self.available_replicas(namespace, name).await? > 0)
    }

    async fn scale(
        &self,
        side: &'static str,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> Result<(), RouterError> {
        set_replicas(self.cluster.as_ref(), namespace, name, replicas)
            .await
            .map_err(|source: ApiError| RouterError::Replicas {
                side,
                name: name.to_string(),
                namespace: namespace.to_string(),
                replicas,
                source,
            })
    }

    async fn set_capacity(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<RouteOutcome, RouterError> {
        let namespace = namespace_of(canary)?;
        let target = canary.spec.target_ref.name.as_str();
        let source = source_name(canary);
        let max = canary.spec.analysis.max_replicas;

        if is_promoted(canary) {
            let outcome = self
                .inner
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await?;
            self.scale("canary", &namespace, target, max).await?;
            self.scale("primary", &namespace, &source, 0).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, replicas = max, "Capacity moved to target after promotion");
            return Ok(outcome);
        }

        if is_failed(canary) {
            let outcome = self
                .inner
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await?;
            self.scale("primary", &namespace, &source, max).await?;
            self.scale("canary", &namespace, target, 0).await?;
            info!(canary = %canary.name_any(), namespace = %namespace, replicas = max, "Capacity returned to source after failure");
            return Ok(outcome);
        }

        let routable = self.routable(&namespace, &source, primary_weight).await?
            && self.routable(&namespace, target, canary_weight).await?;
        let outcome = if routable {
            self.inner
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await?
        } else {
            debug!(
                canary = %canary.name_any(),
                primary_weight,
                canary_weight,
                "A weighted side has no available replicas, routing deferred"
            );
            RouteOutcome::Deferred
        };

        let analysis = &canary.spec.analysis;
        let mut canary_replicas = if analysis.canary_replicas > 0 {
            analysis.canary_replicas
        } else if is_stepped_weight(canary) {
            replicas_for_weight(canary_weight, max)?
        } else {
            0
        };
        if canary_replicas == 0 && canary_weight > 0 {
            canary_replicas = 1;
        }
        self.scale("canary", &namespace, target, canary_replicas).await?;

        // freshly observed availability, not the count just requested
        let canary_available = self.available_replicas(&namespace, target).await?;
        let mut primary_replicas = (max - canary_available).max(0);
        if primary_replicas == 0 && canary_weight != HUNDRED {
            primary_replicas = 1;
        }
        self.scale("primary", &namespace, &source, primary_replicas).await?;

        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            canary_weight,
            canary_replicas,
            primary_replicas,
            "Capacity adjusted"
        );
        Ok(outcome)
    }
}

#[async_trait]
impl Router for ScalableRouter {
    async fn initialize(&self, canary: &Canary) -> Result<(), RouterError> {
        self.inner.initialize(canary).await
    }

    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        self.inner.reconcile(canary).await
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<RouteOutcome, RouterError> {
        if !is_extension_on(canary) {
            return self
                .inner
                .set_routes(canary, primary_weight, canary_weight, mirrored)
                .await;
        }

        self.set_capacity(canary, primary_weight, canary_weight, mirrored)
            .await
            .map_err(|source| RouterError::SetRoutes {
                name: canary.name_any(),
                namespace: canary.namespace().unwrap_or_default(),
                primary_weight,
                canary_weight,
                source: Box::new(source),
            })
    }

    /// Without stepped weights the configured canary weight is the split
    async fn get_routes(&self, canary: &Canary) -> Result<Routes, RouterError> {
        if is_extension_on(canary) && !is_stepped_weight(canary) {
            return Ok(Routes::canary_share(canary.spec.analysis.canary_weight));
        }
        self.inner.get_routes(canary).await
    }

    /// Capacity is the only state this strategy owns and there is nothing to revert
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        if is_extension_on(canary) {
            return Ok(());
        }
        self.inner.finalize(canary).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "scalable_test.rs"]
mod tests;
