//! Strategy-specific canary controllers
//!
//! - `DeploymentController`: the default, with a dedicated `<target>-primary`
//! - `SharedCapacityController`: rolling-update and extension strategies,
//!   where primary and canary share one capacity budget and the source
//!   workload acts as primary
//!
//! Every decorated operation re-evaluates its strategy predicate against the
//! Canary it is given and delegates to the base controller when it does not hold.

pub mod deployment;
pub mod shared;

use crate::controller::cluster::{ApiError, MissingNamespace};
use crate::controller::deployer::DeployerError;
use crate::controller::phase::{is_extension_on, is_rolling_update};
use crate::controller::readiness::ReadinessError;
use crate::crd::{Canary, Phase};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use deployment::DeploymentController;
pub use shared::{SharedCapacityController, SharingMode};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Deployer(#[from] DeployerError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    MissingNamespace(#[from] MissingNamespace),

    #[error("primary readiness check failed: {0}")]
    PrimaryNotReady(#[source] ReadinessError),

    #[error("canary readiness check failed: {0}")]
    CanaryNotReady(#[source] ReadinessError),

    #[error("{name}.{namespace} pod spec snapshot failed: {source}")]
    Snapshot {
        name: String,
        namespace: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ControllerError {
    /// Whether waiting for the next reconciliation may resolve the error
    pub fn is_retriable(&self) -> bool {
        match self {
            ControllerError::PrimaryNotReady(e) | ControllerError::CanaryNotReady(e) => e.retriable,
            ControllerError::Deployer(DeployerError::SelectorLabel { .. }) => false,
            _ => true,
        }
    }
}

/// Result of initializing a Canary
#[derive(Debug, Clone, PartialEq)]
pub struct Initialized {
    /// Selector label resolved for the primary, when a primary was synthesized
    pub selector_label: Option<String>,
    /// Canary as it stands after initialization (status may have moved)
    pub canary: Canary,
}

/// Operations the reconciliation driver performs on a Canary's workloads
///
/// Operations that change the Canary return the updated object; callers
/// continue with the returned value.
#[async_trait]
pub trait CanaryController: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ensure the primary exists and is ready to serve
    async fn initialize(&self, canary: &Canary) -> Result<Initialized, ControllerError>;

    async fn is_primary_ready(&self, canary: &Canary) -> Result<(), ControllerError>;

    async fn is_canary_ready(&self, canary: &Canary) -> Result<(), ControllerError>;

    /// Move the canary's version onto the primary
    async fn promote(&self, canary: &Canary) -> Result<Canary, ControllerError>;

    async fn has_target_changed(&self, canary: &Canary) -> Result<bool, ControllerError>;

    async fn scale_to_zero(&self, canary: &Canary) -> Result<(), ControllerError>;

    async fn scale_from_zero(&self, canary: &Canary) -> Result<(), ControllerError>;

    /// Record a phase together with a fresh snapshot of the target pod spec
    ///
    /// Entering Progressing from any other phase clears the weight, failed
    /// checks and iterations left by the previous rollout.
    async fn sync_status(&self, canary: &Canary, phase: Phase) -> Result<Canary, ControllerError>;

    async fn set_status_weight(&self, canary: &Canary, weight: i32)
        -> Result<Canary, ControllerError>;
}

/// Select the controller for a Canary
///
/// 1. `stepReplicas != 0` → rolling-update strategy
/// 2. extension switch annotation set → extension strategy
/// 3. otherwise → the default deployment controller
pub fn select_controller(
    canary: &Canary,
    base: &Arc<DeploymentController>,
) -> Box<dyn CanaryController> {
    if is_rolling_update(canary) {
        Box::new(SharedCapacityController::new(
            SharingMode::RollingUpdate,
            base.clone(),
        ))
    } else if is_extension_on(canary) {
        Box::new(SharedCapacityController::new(
            SharingMode::Extension,
            base.clone(),
        ))
    } else {
        Box::new(base.as_ref().clone())
    }
}
