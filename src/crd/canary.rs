use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation that switches a Canary to the extension strategy ("true" enables it)
pub const EXTENSION_SWITCH_ANNOTATION: &str = "kanary.io/extension-switch";

/// Annotation listing label keys that tell primary and canary pods apart
///
/// Comma separated. Used by the service router to build per-side selectors.
pub const DISTINGUISH_LABELS_ANNOTATION: &str = "kanary.io/distinguish-labels";

/// Annotation listing label keys shared by primary and canary pods
///
/// Comma separated. Used by the service router once a rollout has finished.
pub const GENERAL_LABELS_ANNOTATION: &str = "kanary.io/general-labels";

/// Default progress deadline when the Canary does not set one
pub const DEFAULT_PROGRESS_DEADLINE_SECONDS: i32 = 600;

/// Canary is a Custom Resource describing a progressive rollout of a workload
///
/// The target workload carries the new version, the primary (either the
/// synthesized `<target>-primary` Deployment or the optional source workload)
/// carries the stable one.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kanary.io",
    version = "v1beta1",
    kind = "Canary",
    namespaced,
    status = "CanaryStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Weight", "type":"integer", "jsonPath":".status.canaryWeight"}"#,
    printcolumn = r#"{"name":"FailedChecks", "type":"integer", "jsonPath":".status.failedChecks"}"#,
    printcolumn = r#"{"name":"LastTransitionTime", "type":"string", "jsonPath":".status.lastTransitionTime"}"#
)]
pub struct CanarySpec {
    /// Workload carrying the new version
    #[serde(rename = "targetRef")]
    pub target_ref: WorkloadRef,

    /// Existing baseline workload used as primary instead of `<target>-primary`
    #[serde(rename = "sourceRef", skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<WorkloadRef>,

    /// Autoscaler mirrored for the primary workload
    #[serde(rename = "autoscalerRef", skip_serializing_if = "Option::is_none")]
    pub autoscaler_ref: Option<AutoscalerRef>,

    /// Service exposing the workload
    pub service: ServiceSpec,

    /// Traffic-split configuration
    #[serde(default)]
    pub analysis: AnalysisSpec,

    /// Maximum time in seconds for a workload to become ready.
    /// Defaults to 600 when not specified.
    #[serde(
        rename = "progressDeadlineSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_deadline_seconds: Option<i32>,

    /// Skip readiness gating and promote straight away
    #[serde(rename = "skipAnalysis", default)]
    pub skip_analysis: bool,
}

/// Reference to a workload in the Canary's namespace
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct WorkloadRef {
    pub name: String,

    #[serde(default = "default_workload_kind")]
    pub kind: String,

    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

fn default_workload_kind() -> String {
    "Deployment".to_string()
}

/// Reference to an autoscaler in the Canary's namespace
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct AutoscalerRef {
    pub name: String,

    #[serde(default = "default_autoscaler_kind")]
    pub kind: String,

    #[serde(rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

fn default_autoscaler_kind() -> String {
    "HorizontalPodAutoscaler".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ServiceSpec {
    /// Port exposed by the apex, primary and canary services
    pub port: i32,

    /// Port name (default: "http")
    #[serde(rename = "portName", skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,

    /// Container port (default: same as port)
    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<i32>,
}

/// Traffic-split settings
///
/// `stepWeight > 0` selects stepped-weight rollout, `stepReplicas != 0`
/// selects the rolling-update strategy.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AnalysisSpec {
    /// Failed checks tolerated before the rollout is considered failed
    #[serde(default)]
    pub threshold: i32,

    /// Weight increment per step (percentage)
    #[serde(rename = "stepWeight", default)]
    pub step_weight: i32,

    /// Highest weight routed to the canary before promotion
    #[serde(rename = "maxWeight", default)]
    pub max_weight: i32,

    /// Explicit canary weight (percentage)
    #[serde(rename = "canaryWeight", default)]
    pub canary_weight: i32,

    /// Explicit canary replica count, preferred over weight-derived counts
    #[serde(rename = "canaryReplicas", default)]
    pub canary_replicas: i32,

    /// Replica increment per step for the rolling-update strategy
    #[serde(rename = "stepReplicas", default)]
    pub step_replicas: i32,

    /// Total replicas shared between primary and canary
    #[serde(rename = "maxReplicas", default)]
    pub max_replicas: i32,

    /// Hooks invoked during the rollout
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub webhooks: Vec<CanaryWebhook>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CanaryWebhook {
    pub name: String,

    #[serde(rename = "type", default)]
    pub hook_type: HookType,

    pub url: String,

    /// Request timeout (e.g., "30s")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<std::collections::BTreeMap<String, String>>,
}

/// When a webhook is invoked
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum HookType {
    #[serde(rename = "pre-rollout")]
    PreRollout,
    #[default]
    #[serde(rename = "rollout")]
    Rollout,
    #[serde(rename = "post-rollout")]
    PostRollout,
    /// Gates advancement until the URL answers 200
    #[serde(rename = "confirm-rollout")]
    ConfirmRollout,
    #[serde(rename = "confirm-promotion")]
    ConfirmPromotion,
    #[serde(rename = "rollback")]
    Rollback,
    #[serde(rename = "event")]
    Event,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    /// Phase of the rollout; absent until the first initialization
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,

    /// Weight currently routed to the canary (0-100)
    #[serde(rename = "canaryWeight", default)]
    pub canary_weight: i32,

    /// Consecutive failed checks recorded by analysis
    #[serde(rename = "failedChecks", default)]
    pub failed_checks: i32,

    #[serde(default)]
    pub iterations: i32,

    /// Base64-encoded JSON snapshot of the target pod spec last rolled out
    #[serde(rename = "lastAppliedSpec", skip_serializing_if = "Option::is_none")]
    pub last_applied_spec: Option<String>,

    /// Timestamp of the last phase change (RFC3339 format)
    #[serde(
        rename = "lastTransitionTime",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    /// Primary workload is being created
    Initializing,
    /// Primary is ready, waiting for a target change
    Initialized,
    /// Traffic is being shifted to the canary
    Progressing,
    /// Canary reached full weight, primary is being updated
    Promoting,
    /// Routing is being restored to the primary
    Finalising,
    /// Rollout completed
    Succeeded,
    /// Rollout rolled back
    Failed,
    /// Canary is being deleted
    Terminating,
    /// Canary deletion finished
    Terminated,
}

impl Canary {
    /// Progress deadline, defaulting to 600 seconds
    pub fn progress_deadline_seconds(&self) -> i32 {
        self.spec
            .progress_deadline_seconds
            .unwrap_or(DEFAULT_PROGRESS_DEADLINE_SECONDS)
    }

    /// Failed-check threshold, never lower than 1
    pub fn analysis_threshold(&self) -> i32 {
        if self.spec.analysis.threshold > 0 {
            self.spec.analysis.threshold
        } else {
            1
        }
    }

    pub fn skip_analysis(&self) -> bool {
        self.spec.skip_analysis
    }

    /// Recorded phase, if any
    pub fn phase(&self) -> Option<&Phase> {
        self.status.as_ref().and_then(|s| s.phase.as_ref())
    }

    /// Recorded canary weight (0 when no status yet)
    pub fn status_weight(&self) -> i32 {
        self.status.as_ref().map(|s| s.canary_weight).unwrap_or(0)
    }

    /// Apex, primary and canary service names
    pub fn service_names(&self) -> (String, String, String) {
        let apex = self.spec.target_ref.name.clone();
        let primary = format!("{}-primary", apex);
        let canary = format!("{}-canary", apex);
        (apex, primary, canary)
    }
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
