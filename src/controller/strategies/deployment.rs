//! Default controller: a dedicated `<target>-primary` Deployment serves
//! stable traffic while the target is rolled out behind it.

use super::{CanaryController, ControllerError, Initialized};
use crate::controller::clock::Clock;
use crate::controller::cluster::{namespace_of, ClusterApi};
use crate::controller::deployer::{encode_pod_spec, Deployer};
use crate::controller::phase::{is_initializing, primary_name};
use crate::controller::readiness::{check_deployment_ready, ReadinessError};
use crate::crd::{Canary, CanaryStatus, Phase};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct DeploymentController {
    deployer: Arc<Deployer>,
    clock: Arc<dyn Clock>,
}

impl DeploymentController {
    pub fn new(deployer: Arc<Deployer>, clock: Arc<dyn Clock>) -> Self {
        Self { deployer, clock }
    }

    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        self.deployer.cluster()
    }

    /// Read the named Deployment and check it is fully rolled out
    pub(crate) async fn check_ready(
        &self,
        canary: &Canary,
        name: &str,
        not_ready: fn(ReadinessError) -> ControllerError,
    ) -> Result<(), ControllerError> {
        let namespace = namespace_of(canary)?;
        let deployment = self.cluster().get_deployment(&namespace, name).await?;
        check_deployment_ready(
            &deployment,
            canary.progress_deadline_seconds(),
            self.clock.now(),
        )
        .map_err(not_ready)
    }

    async fn write_status(
        &self,
        canary: &Canary,
        status: CanaryStatus,
    ) -> Result<Canary, ControllerError> {
        let namespace = namespace_of(canary)?;
        Ok(self
            .cluster()
            .update_canary_status(&namespace, &canary.name_any(), &status)
            .await?)
    }
}

#[async_trait]
impl CanaryController for DeploymentController {
    fn name(&self) -> &'static str {
        "deployment"
    }

    async fn initialize(&self, canary: &Canary) -> Result<Initialized, ControllerError> {
        let label = self.deployer.initialize(canary).await?;

        if is_initializing(canary) && !canary.skip_analysis() {
            self.is_primary_ready(canary).await?;
        }

        Ok(Initialized {
            selector_label: Some(label),
            canary: canary.clone(),
        })
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.check_ready(canary, &primary_name(canary), ControllerError::PrimaryNotReady)
            .await
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.check_ready(
            canary,
            &canary.spec.target_ref.name,
            ControllerError::CanaryNotReady,
        )
        .await
    }

    async fn promote(&self, canary: &Canary) -> Result<Canary, ControllerError> {
        self.deployer.promote(canary).await?;
        Ok(canary.clone())
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError> {
        Ok(self.deployer.has_deployment_changed(canary).await?)
    }

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        Ok(self.deployer.scale(canary, 0).await?)
    }

    /// Restore the target to its autoscaler's minimum, or a single replica
    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        let namespace = namespace_of(canary)?;
        let target = self
            .cluster()
            .get_deployment(&namespace, &canary.spec.target_ref.name)
            .await?;

        let current = target.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if current > 0 {
            debug!(canary = %canary.name_any(), replicas = current, "Target already scaled up");
            return Ok(());
        }

        let mut replicas = 1;
        if let Some(hpa_ref) = &canary.spec.autoscaler_ref {
            let hpa = self.cluster().get_autoscaler(&namespace, &hpa_ref.name).await?;
            if let Some(min) = hpa.spec.and_then(|s| s.min_replicas).filter(|m| *m > 0) {
                replicas = min;
            }
        }

        Ok(self.deployer.scale(canary, replicas).await?)
    }

    async fn sync_status(&self, canary: &Canary, phase: Phase) -> Result<Canary, ControllerError> {
        let namespace = namespace_of(canary)?;
        let target = self
            .cluster()
            .get_deployment(&namespace, &canary.spec.target_ref.name)
            .await?;
        let pod_spec = target
            .spec
            .and_then(|s| s.template.spec)
            .unwrap_or_default();
        let snapshot = encode_pod_spec(&pod_spec).map_err(|source| ControllerError::Snapshot {
            name: canary.name_any(),
            namespace: namespace.clone(),
            source,
        })?;

        let mut status = canary.status.clone().unwrap_or_default();
        if status.phase.as_ref() != Some(&phase) || status.last_transition_time.is_none() {
            status.last_transition_time = Some(self.clock.timestamp());
        }
        // a new rollout starts from zero weight and a clean analysis record
        if phase == Phase::Progressing && status.phase.as_ref() != Some(&Phase::Progressing) {
            status.canary_weight = 0;
            status.failed_checks = 0;
            status.iterations = 0;
        }
        status.phase = Some(phase.clone());
        status.last_applied_spec = Some(snapshot);

        let updated = self.write_status(canary, status).await?;
        info!(canary = %canary.name_any(), namespace = %namespace, phase = ?phase, "Status synced");
        Ok(updated)
    }

    async fn set_status_weight(
        &self,
        canary: &Canary,
        weight: i32,
    ) -> Result<Canary, ControllerError> {
        let mut status = canary.status.clone().unwrap_or_default();
        status.canary_weight = weight;

        let updated = self.write_status(canary, status).await?;
        info!(canary = %canary.name_any(), weight, "Status weight updated");
        Ok(updated)
    }
}
