//! Traffic routers
//!
//! Routers are stacked, outermost first:
//! - `ScalableRouter`: extension strategy, keeps both sides' replica counts
//!   consistent with the requested split
//! - `ReadyRatioRouter`: rolling-update strategy, realizes weight as a
//!   ready-replica ratio and halts until capacity catches up
//! - `ServiceRouter`: ClusterIP services, no traffic splitting of its own
//!
//! A wrapper whose strategy is inactive for a Canary passes every call
//! straight through to the router it wraps.

pub mod ready_ratio;
pub mod scalable;
pub mod service;

use crate::config::ControllerConfig;
use crate::controller::cluster::{ApiError, ClusterApi, MissingNamespace};
use crate::controller::weight::WeightError;
use crate::crd::Canary;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

pub use ready_ratio::ReadyRatioRouter;
pub use scalable::ScalableRouter;
pub use service::ServiceRouter;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    MissingNamespace(#[from] MissingNamespace),

    #[error(transparent)]
    Weight(#[from] WeightError),

    #[error("adjust router {name}.{namespace} failed: {source}, primaryWeight: {primary_weight}, canaryWeight: {canary_weight}")]
    SetRoutes {
        name: String,
        namespace: String,
        primary_weight: i32,
        canary_weight: i32,
        #[source]
        source: Box<RouterError>,
    },

    #[error("adjust replicas of {side} deployment {name}.{namespace} failed: {source}, replicas: {replicas}")]
    Replicas {
        side: &'static str,
        name: String,
        namespace: String,
        replicas: i32,
        #[source]
        source: ApiError,
    },

    #[error("set route of {side} deployment {name}.{namespace} failed: {source}, weight: {weight}")]
    Route {
        side: &'static str,
        name: String,
        namespace: String,
        weight: i32,
        #[source]
        source: ApiError,
    },

    #[error("query available replicas of deployment {name}.{namespace} failed: {source}")]
    Availability {
        name: String,
        namespace: String,
        #[source]
        source: ApiError,
    },

    #[error("halting canary {name}.{namespace} failed: {source}")]
    Halt {
        name: String,
        namespace: String,
        #[source]
        source: ApiError,
    },

    #[error("service {service}.{namespace}: label {label} missing from deployment {deployment} pod template")]
    ServiceLabel {
        service: String,
        namespace: String,
        deployment: String,
        label: String,
    },
}

/// Current traffic split
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routes {
    pub primary_weight: i32,
    pub canary_weight: i32,
    pub mirrored: bool,
}

impl Routes {
    pub fn primary_only() -> Self {
        Self {
            primary_weight: 100,
            canary_weight: 0,
            mirrored: false,
        }
    }

    /// Split with `canary_weight` on the canary and the complement on the primary
    pub fn canary_share(canary_weight: i32) -> Self {
        Self {
            primary_weight: 100 - canary_weight,
            canary_weight,
            mirrored: false,
        }
    }
}

/// What a `set_routes` call did
#[derive(Debug, Clone, PartialEq)]
pub enum RouteOutcome {
    /// The requested split was handed to the traffic layer
    Applied,
    /// A side had no available capacity, so the split was not routed yet;
    /// replica counts were still adjusted
    Deferred,
    /// Rollout paused behind a manual-confirmation hook; carries the
    /// persisted Canary
    Halted(Box<Canary>),
}

#[async_trait]
pub trait Router: Send + Sync {
    /// Create per-side routing objects
    async fn initialize(&self, _canary: &Canary) -> Result<(), RouterError> {
        Ok(())
    }

    /// Create or update the apex routing object
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError>;

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        mirrored: bool,
    ) -> Result<RouteOutcome, RouterError>;

    async fn get_routes(&self, canary: &Canary) -> Result<Routes, RouterError>;

    /// Revert routing changes when the Canary is deleted
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError>;
}

/// Scalable over ready-ratio over ClusterIP services
pub fn router_stack(cluster: Arc<dyn ClusterApi>, config: &ControllerConfig) -> Arc<dyn Router> {
    let services = Arc::new(ServiceRouter::new(
        cluster.clone(),
        config.selector_labels.clone(),
        config.service_ports.clone(),
    ));
    let ready_ratio = Arc::new(ReadyRatioRouter::new(
        cluster.clone(),
        services,
        config.halt_url.clone(),
    ));
    Arc::new(ScalableRouter::new(cluster, ready_ratio))
}

/// Router that records calls, for wrapper tests
#[cfg(test)]
pub(crate) mod recording {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum RouterCall {
        Initialize,
        Reconcile,
        SetRoutes(i32, i32, bool),
        GetRoutes,
        Finalize,
    }

    pub struct RecordingRouter {
        calls: Mutex<Vec<RouterCall>>,
        routes: Routes,
        fail_set_routes: bool,
    }

    #[allow(clippy::unwrap_used)]
    impl RecordingRouter {
        pub fn new() -> Self {
            Self::reporting(Routes::canary_share(10))
        }

        pub fn reporting(routes: Routes) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                routes,
                fail_set_routes: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail_set_routes: true,
                ..Self::new()
            }
        }

        pub fn calls(&self) -> Vec<RouterCall> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: RouterCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Router for RecordingRouter {
        async fn initialize(&self, _canary: &Canary) -> Result<(), RouterError> {
            self.record(RouterCall::Initialize);
            Ok(())
        }

        async fn reconcile(&self, _canary: &Canary) -> Result<(), RouterError> {
            self.record(RouterCall::Reconcile);
            Ok(())
        }

        async fn set_routes(
            &self,
            canary: &Canary,
            primary_weight: i32,
            canary_weight: i32,
            mirrored: bool,
        ) -> Result<RouteOutcome, RouterError> {
            self.record(RouterCall::SetRoutes(primary_weight, canary_weight, mirrored));
            if self.fail_set_routes {
                return Err(RouterError::Api(ApiError::NotFound {
                    kind: "route",
                    name: canary.spec.target_ref.name.clone(),
                    namespace: "default".to_string(),
                }));
            }
            Ok(RouteOutcome::Applied)
        }

        async fn get_routes(&self, _canary: &Canary) -> Result<Routes, RouterError> {
            self.record(RouterCall::GetRoutes);
            Ok(self.routes)
        }

        async fn finalize(&self, _canary: &Canary) -> Result<(), RouterError> {
            self.record(RouterCall::Finalize);
            Ok(())
        }
    }
}
