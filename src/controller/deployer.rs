//! Primary workload synchronization
//!
//! The Deployer owns the `<target>-primary` Deployment and its autoscaler:
//! it creates them from the target on initialization, copies the target's
//! template onto the primary on promotion and detects pod spec drift against
//! the last applied snapshot.

use crate::controller::cluster::{namespace_of, ApiError, ClusterApi, MissingNamespace};
use crate::controller::config_tracker::{ConfigError, ConfigTracker};
use crate::controller::phase::primary_name;
use crate::crd::Canary;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Pod template annotation carrying a fresh identifier on every promotion
///
/// Guarantees the primary's template differs from the previous revision,
/// which forces a rolling restart even when nothing else changed.
pub const TRACKING_ANNOTATION: &str = "kanary-id";

#[derive(Debug, Error)]
pub enum DeployerError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    MissingNamespace(#[from] MissingNamespace),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("creating {kind} {name}.{namespace} failed: {source}")]
    Create {
        kind: &'static str,
        name: String,
        namespace: String,
        #[source]
        source: Box<DeployerError>,
    },

    #[error("invalid label selector! Deployment {name}.{namespace} spec.selector.matchLabels must contain selector '{expected}: {name}'")]
    SelectorLabel {
        name: String,
        namespace: String,
        expected: String,
    },

    #[error("scaling {name}.{namespace} to {replicas} failed: {source}")]
    Scale {
        name: String,
        namespace: String,
        replicas: i32,
        #[source]
        source: ApiError,
    },

    #[error("updating deployment {name}.{namespace} template spec failed: {source}")]
    Promote {
        name: String,
        namespace: String,
        #[source]
        source: ApiError,
    },

    #[error("{name}.{namespace} last applied spec cannot be read: {message}")]
    Snapshot {
        name: String,
        namespace: String,
        message: String,
    },
}

pub struct Deployer {
    cluster: Arc<dyn ClusterApi>,
    tracker: Arc<dyn ConfigTracker>,
    /// Candidate selector label keys, first match wins
    labels: Vec<String>,
}

impl Deployer {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        tracker: Arc<dyn ConfigTracker>,
        labels: Vec<String>,
    ) -> Self {
        Self {
            cluster,
            tracker,
            labels,
        }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterApi> {
        &self.cluster
    }

    /// Create the primary Deployment and autoscaler and return the selector label
    ///
    /// On the very first initialization (no phase recorded) the target is
    /// scaled to zero; the primary takes over serving.
    pub async fn initialize(&self, canary: &Canary) -> Result<String, DeployerError> {
        let namespace = namespace_of(canary)?;
        let primary = primary_name(canary);

        let label = self
            .create_primary_deployment(canary, &namespace)
            .await
            .map_err(|e| DeployerError::Create {
                kind: "deployment",
                name: primary.clone(),
                namespace: namespace.clone(),
                source: Box::new(e),
            })?;

        if canary.phase().is_none() {
            info!(
                canary = %canary.name_any(),
                namespace = %namespace,
                deployment = %canary.spec.target_ref.name,
                "Scaling down target"
            );
            self.scale(canary, 0).await?;
        }

        if let Some(hpa_ref) = &canary.spec.autoscaler_ref {
            if hpa_ref.kind == "HorizontalPodAutoscaler" {
                self.create_primary_hpa(canary, &namespace, &hpa_ref.name)
                    .await
                    .map_err(|e| DeployerError::Create {
                        kind: "HorizontalPodAutoscaler",
                        name: format!("{}-primary", hpa_ref.name),
                        namespace: namespace.clone(),
                        source: Box::new(e),
                    })?;
            }
        }

        Ok(label)
    }

    /// Copy the target's template, config references and deployment knobs onto the primary
    pub async fn promote(&self, canary: &Canary) -> Result<(), DeployerError> {
        let namespace = namespace_of(canary)?;
        let target_name = &canary.spec.target_ref.name;
        let primary_name = primary_name(canary);

        let target = self.cluster.get_deployment(&namespace, target_name).await?;
        let label = self.require_selector_label(&target, &namespace)?;
        let primary = self.cluster.get_deployment(&namespace, &primary_name).await?;

        let refs = self.tracker.get_target_configs(canary).await?;
        self.tracker.create_primary_configs(canary, &refs).await?;

        let target_spec = target.spec.unwrap_or_default();
        let target_meta = target_spec.template.metadata.unwrap_or_default();

        let mut promoted = primary;
        let spec = promoted.spec.get_or_insert_with(Default::default);
        spec.progress_deadline_seconds = target_spec.progress_deadline_seconds;
        spec.min_ready_seconds = target_spec.min_ready_seconds;
        spec.revision_history_limit = target_spec.revision_history_limit;
        spec.strategy = target_spec.strategy;
        spec.template.spec = Some(
            self.tracker
                .apply_primary_configs(target_spec.template.spec.unwrap_or_default(), &refs),
        );
        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);
        template_meta.annotations = Some(make_annotations(target_meta.annotations.as_ref()));
        template_meta.labels = Some(make_primary_labels(
            target_meta.labels.as_ref(),
            &primary_name,
            &label,
        ));

        self.cluster
            .update_deployment(&namespace, &promoted)
            .await
            .map_err(|source| DeployerError::Promote {
                name: primary_name.clone(),
                namespace: namespace.clone(),
                source,
            })?;

        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            deployment = %primary_name,
            "Primary template updated from target"
        );
        Ok(())
    }

    /// Whether the target pod spec differs from the last applied snapshot
    ///
    /// Always true before a snapshot has been recorded.
    pub async fn has_deployment_changed(&self, canary: &Canary) -> Result<bool, DeployerError> {
        let namespace = namespace_of(canary)?;
        let target = self
            .cluster
            .get_deployment(&namespace, &canary.spec.target_ref.name)
            .await?;

        let Some(snapshot) = canary
            .status
            .as_ref()
            .and_then(|s| s.last_applied_spec.as_deref())
            .filter(|s| !s.is_empty())
        else {
            return Ok(true);
        };

        let snapshot_error = |message: String| DeployerError::Snapshot {
            name: canary.name_any(),
            namespace: namespace.clone(),
            message,
        };
        let decoded = STANDARD
            .decode(snapshot)
            .map_err(|e| snapshot_error(format!("decode error {e}")))?;
        let applied: PodSpec = serde_json::from_slice(&decoded)
            .map_err(|e| snapshot_error(format!("unmarshal error {e}")))?;

        let current = target
            .spec
            .and_then(|s| s.template.spec)
            .unwrap_or_default();

        // compare wire forms so field defaults and map ordering don't count as drift
        let current = serde_json::to_value(&current)
            .map_err(|e| snapshot_error(format!("serialization error {e}")))?;
        let applied = serde_json::to_value(&applied)
            .map_err(|e| snapshot_error(format!("serialization error {e}")))?;

        let changed = current != applied;
        debug!(canary = %canary.name_any(), changed, "Compared target pod spec with last applied");
        Ok(changed)
    }

    /// Set the target Deployment's replica count
    pub async fn scale(&self, canary: &Canary, replicas: i32) -> Result<(), DeployerError> {
        let namespace = namespace_of(canary)?;
        set_replicas(
            self.cluster.as_ref(),
            &namespace,
            &canary.spec.target_ref.name,
            replicas,
        )
        .await
        .map_err(|source| match source {
            ApiError::NotFound { .. } => DeployerError::Api(source),
            source => DeployerError::Scale {
                name: canary.spec.target_ref.name.clone(),
                namespace: namespace.clone(),
                replicas,
                source,
            },
        })
    }

    /// First configured label key present in the Deployment's selector
    pub fn get_selector_label(&self, deployment: &Deployment) -> Option<String> {
        selector_label(deployment, &self.labels)
    }

    fn require_selector_label(
        &self,
        deployment: &Deployment,
        namespace: &str,
    ) -> Result<String, DeployerError> {
        self.get_selector_label(deployment)
            .ok_or_else(|| DeployerError::SelectorLabel {
                name: deployment.name_any(),
                namespace: namespace.to_string(),
                expected: self.labels.first().cloned().unwrap_or_default(),
            })
    }

    async fn create_primary_deployment(
        &self,
        canary: &Canary,
        namespace: &str,
    ) -> Result<String, DeployerError> {
        let target_name = &canary.spec.target_ref.name;
        let primary_name = primary_name(canary);

        let target = self.cluster.get_deployment(namespace, target_name).await?;
        let label = self.require_selector_label(&target, namespace)?;

        match self.cluster.get_deployment(namespace, &primary_name).await {
            Ok(_) => return Ok(label),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let refs = self.tracker.get_target_configs(canary).await?;
        self.tracker.create_primary_configs(canary, &refs).await?;

        let target_spec = target.spec.unwrap_or_default();
        let target_meta = target_spec.template.metadata.unwrap_or_default();
        let replicas = target_spec.replicas.filter(|r| *r > 0).unwrap_or(1);

        let primary = Deployment {
            metadata: ObjectMeta {
                name: Some(primary_name.clone()),
                namespace: Some(namespace.to_string()),
                owner_references: canary.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                progress_deadline_seconds: target_spec.progress_deadline_seconds,
                min_ready_seconds: target_spec.min_ready_seconds,
                revision_history_limit: target_spec.revision_history_limit,
                replicas: Some(replicas),
                strategy: target_spec.strategy,
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(label.clone(), primary_name.clone())])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(make_primary_labels(
                            target_meta.labels.as_ref(),
                            &primary_name,
                            &label,
                        )),
                        annotations: Some(make_annotations(target_meta.annotations.as_ref())),
                        ..Default::default()
                    }),
                    spec: Some(
                        self.tracker
                            .apply_primary_configs(target_spec.template.spec.unwrap_or_default(), &refs),
                    ),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        self.cluster.create_deployment(namespace, &primary).await?;
        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            deployment = %primary_name,
            replicas,
            "Primary deployment created"
        );
        Ok(label)
    }

    async fn create_primary_hpa(
        &self,
        canary: &Canary,
        namespace: &str,
        hpa_name: &str,
    ) -> Result<(), DeployerError> {
        let hpa = self.cluster.get_autoscaler(namespace, hpa_name).await?;
        let primary_hpa_name = format!("{hpa_name}-primary");

        match self.cluster.get_autoscaler(namespace, &primary_hpa_name).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let spec = hpa.spec.unwrap_or_default();
        let primary_hpa = HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some(primary_hpa_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: hpa.metadata.labels.clone(),
                owner_references: canary.controller_owner_ref(&()).map(|owner| vec![owner]),
                ..Default::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    name: primary_name(canary),
                    kind: spec.scale_target_ref.kind,
                    api_version: spec.scale_target_ref.api_version,
                },
                min_replicas: spec.min_replicas,
                max_replicas: spec.max_replicas,
                metrics: spec.metrics,
                behavior: spec.behavior,
            }),
            ..Default::default()
        };

        self.cluster.create_autoscaler(namespace, &primary_hpa).await?;
        info!(
            canary = %canary.name_any(),
            namespace = %namespace,
            autoscaler = %primary_hpa_name,
            "Primary autoscaler created"
        );
        Ok(())
    }
}

/// Read, set `spec.replicas` and replace a Deployment
pub async fn set_replicas(
    cluster: &dyn ClusterApi,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<(), ApiError> {
    let mut deployment = cluster.get_deployment(namespace, name).await?;
    deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
    cluster.update_deployment(namespace, &deployment).await?;
    info!(deployment = %name, namespace = %namespace, replicas, "Scaled deployment");
    Ok(())
}

/// First candidate label key present in the Deployment's `matchLabels`
pub fn selector_label(deployment: &Deployment, candidates: &[String]) -> Option<String> {
    let match_labels = deployment
        .spec
        .as_ref()
        .and_then(|s| s.selector.match_labels.as_ref())?;
    candidates
        .iter()
        .find(|label| match_labels.contains_key(label.as_str()))
        .cloned()
}

/// Base64 JSON snapshot of a pod spec, as stored in `status.lastAppliedSpec`
pub fn encode_pod_spec(spec: &PodSpec) -> Result<String, serde_json::Error> {
    Ok(STANDARD.encode(serde_json::to_vec(spec)?))
}

/// Copy annotations, replacing the tracking identifier with a fresh one
pub fn make_annotations(annotations: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut result: BTreeMap<String, String> = annotations
        .into_iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != TRACKING_ANNOTATION)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    result.insert(
        TRACKING_ANNOTATION.to_string(),
        uuid::Uuid::new_v4().to_string(),
    );
    result
}

/// Copy labels, pointing the selector label at the primary
pub fn make_primary_labels(
    labels: Option<&BTreeMap<String, String>>,
    primary_name: &str,
    label: &str,
) -> BTreeMap<String, String> {
    let mut result: BTreeMap<String, String> = labels
        .into_iter()
        .flatten()
        .filter(|(k, _)| k.as_str() != label)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    result.insert(label.to_string(), primary_name.to_string());
    result
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployer_test.rs"]
mod tests;
