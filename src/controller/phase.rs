//! Predicates over a Canary's recorded state
//!
//! Pure queries: they read the spec, annotations and status and never touch
//! the cluster. Strategy decorators and routers branch on them every call.

use crate::crd::canary::EXTENSION_SWITCH_ANNOTATION;
use crate::crd::{Canary, Phase};
use kube::ResourceExt;

/// Rolling-update strategy: capacity moves in replica steps (`stepReplicas != 0`)
pub fn is_rolling_update(canary: &Canary) -> bool {
    canary.spec.analysis.step_replicas != 0
}

/// Extension strategy: enabled by the `kanary.io/extension-switch: "true"` annotation
pub fn is_extension_on(canary: &Canary) -> bool {
    canary
        .annotations()
        .get(EXTENSION_SWITCH_ANNOTATION)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// A non-empty source workload reference is configured
pub fn has_source_ref(canary: &Canary) -> bool {
    canary
        .spec
        .source_ref
        .as_ref()
        .map(|s| !s.name.is_empty())
        .unwrap_or(false)
}

/// Stepped-weight rollout is configured (`stepWeight > 0`)
pub fn is_stepped_weight(canary: &Canary) -> bool {
    canary.spec.analysis.step_weight > 0
}

/// Canary has been promoted: Promoting, Finalising or Succeeded
pub fn is_promoted(canary: &Canary) -> bool {
    matches!(
        canary.phase(),
        Some(Phase::Promoting) | Some(Phase::Finalising) | Some(Phase::Succeeded)
    )
}

/// Canary failed and must be rolled back
///
/// True once the phase is Failed or the failed-check counter reached the threshold.
pub fn is_failed(canary: &Canary) -> bool {
    let failed_checks = canary
        .status
        .as_ref()
        .map(|s| s.failed_checks)
        .unwrap_or(0);
    canary.phase() == Some(&Phase::Failed) || failed_checks >= canary.analysis_threshold()
}

/// Rollout reached a terminal or post-analysis phase
pub fn is_finished(canary: &Canary) -> bool {
    matches!(
        canary.phase(),
        Some(Phase::Promoting)
            | Some(Phase::Finalising)
            | Some(Phase::Succeeded)
            | Some(Phase::Failed)
            | Some(Phase::Terminating)
            | Some(Phase::Terminated)
    )
}

/// No phase recorded yet, or explicitly Initializing
pub fn is_initializing(canary: &Canary) -> bool {
    matches!(canary.phase(), None | Some(Phase::Initializing))
}

pub fn is_initialized(canary: &Canary) -> bool {
    canary.phase() == Some(&Phase::Initialized)
}

/// Name of the workload acting as primary
///
/// The source workload when one is referenced, otherwise `<target>-primary`.
pub fn source_name(canary: &Canary) -> String {
    match &canary.spec.source_ref {
        Some(source) if !source.name.is_empty() => source.name.clone(),
        _ => primary_name(canary),
    }
}

/// Name of the synthesized primary Deployment
pub fn primary_name(canary: &Canary) -> String {
    format!("{}-primary", canary.spec.target_ref.name)
}

#[cfg(test)]
#[path = "phase_test.rs"]
mod tests;
