//! Custom resource definitions
//!
//! The `Canary` resource describes one progressive rollout: which workload
//! is the canary, what the primary is, and how traffic and capacity are split.

pub mod canary;

pub use canary::{
    AnalysisSpec, AutoscalerRef, Canary, CanarySpec, CanaryStatus, CanaryWebhook, HookType,
    Phase, ServiceSpec, WorkloadRef,
};
