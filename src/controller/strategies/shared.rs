//! Controller for strategies where primary and canary share capacity
//!
//! Under the rolling-update and extension strategies the source workload is
//! the primary and replicas move between the two sides instead of the target
//! being scaled up from zero. Zero-scaling either side would drop capacity the
//! other side relies on, so both zero-scaling operations are no-ops.

use super::{CanaryController, ControllerError, DeploymentController, Initialized};
use crate::controller::cluster::namespace_of;
use crate::controller::phase::{
    has_source_ref, is_extension_on, is_initialized, is_initializing, is_rolling_update,
    source_name,
};
use crate::crd::{Canary, Phase};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingMode {
    /// Selected by `stepReplicas != 0`
    RollingUpdate,
    /// Selected by the `kanary.io/extension-switch` annotation
    Extension,
}

impl SharingMode {
    pub fn holds(self, canary: &Canary) -> bool {
        match self {
            SharingMode::RollingUpdate => is_rolling_update(canary),
            SharingMode::Extension => is_extension_on(canary),
        }
    }

    fn name(self) -> &'static str {
        match self {
            SharingMode::RollingUpdate => "rolling-update",
            SharingMode::Extension => "extension",
        }
    }
}

pub struct SharedCapacityController {
    mode: SharingMode,
    base: Arc<DeploymentController>,
}

impl SharedCapacityController {
    pub fn new(mode: SharingMode, base: Arc<DeploymentController>) -> Self {
        Self { mode, base }
    }

    /// The source workload stands in for the primary
    fn uses_source(&self, canary: &Canary) -> bool {
        self.mode.holds(canary) && has_source_ref(canary)
    }
}

#[async_trait]
impl CanaryController for SharedCapacityController {
    fn name(&self) -> &'static str {
        self.mode.name()
    }

    /// Check the source instead of creating a primary
    ///
    /// A Canary with a source is assumed to have changed already, so an
    /// Initialized Canary moves straight on to Progressing.
    async fn initialize(&self, canary: &Canary) -> Result<Initialized, ControllerError> {
        if !self.uses_source(canary) {
            return self.base.initialize(canary).await;
        }

        let namespace = namespace_of(canary)?;
        let source = source_name(canary);
        self.base.cluster().get_deployment(&namespace, &source).await?;

        if is_initializing(canary) && !canary.skip_analysis() {
            self.base
                .check_ready(canary, &source, ControllerError::PrimaryNotReady)
                .await?;
        }

        let canary = if is_initialized(canary) {
            info!(
                canary = %canary.name_any(),
                namespace = %namespace,
                strategy = self.name(),
                "Source in place, advancing to Progressing"
            );
            self.base.sync_status(canary, Phase::Progressing).await?
        } else {
            canary.clone()
        };

        Ok(Initialized {
            selector_label: None,
            canary,
        })
    }

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        if !self.uses_source(canary) {
            return self.base.is_primary_ready(canary).await;
        }
        self.base
            .check_ready(canary, &source_name(canary), ControllerError::PrimaryNotReady)
            .await
    }

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), ControllerError> {
        self.base.is_canary_ready(canary).await
    }

    /// Promotion is a weight change: the router moves capacity to the target
    async fn promote(&self, canary: &Canary) -> Result<Canary, ControllerError> {
        if !self.mode.holds(canary) {
            return self.base.promote(canary).await;
        }
        if canary.status_weight() == 100 {
            debug!(canary = %canary.name_any(), "Already at full weight");
            return Ok(canary.clone());
        }

        let namespace = namespace_of(canary)?;
        self.base.set_status_weight(canary, 100).await?;
        Ok(self
            .base
            .cluster()
            .get_canary(&namespace, &canary.name_any())
            .await?)
    }

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError> {
        self.base.has_target_changed(canary).await
    }

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        if self.mode.holds(canary) {
            return Ok(());
        }
        self.base.scale_to_zero(canary).await
    }

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), ControllerError> {
        if self.mode.holds(canary) {
            return Ok(());
        }
        self.base.scale_from_zero(canary).await
    }

    async fn sync_status(&self, canary: &Canary, phase: Phase) -> Result<Canary, ControllerError> {
        self.base.sync_status(canary, phase).await
    }

    async fn set_status_weight(
        &self,
        canary: &Canary,
        weight: i32,
    ) -> Result<Canary, ControllerError> {
        self.base.set_status_weight(canary, weight).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "shared_test.rs"]
mod tests;
