//! Shared builders for controller and router tests
#![allow(clippy::unwrap_used)]

use crate::crd::canary::EXTENSION_SWITCH_ANNOTATION;
use crate::crd::{AnalysisSpec, Canary, CanarySpec, CanaryStatus, Phase, ServiceSpec, WorkloadRef};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use serde_json::json;

/// Canary in namespace `default` targeting the Deployment `target`
pub fn test_canary(target: &str) -> Canary {
    let mut canary = Canary::new(
        target,
        CanarySpec {
            target_ref: WorkloadRef {
                name: target.to_string(),
                kind: "Deployment".to_string(),
                api_version: Some("apps/v1".to_string()),
            },
            source_ref: None,
            autoscaler_ref: None,
            service: ServiceSpec {
                port: 9898,
                ..Default::default()
            },
            analysis: AnalysisSpec::default(),
            progress_deadline_seconds: Some(60),
            skip_analysis: false,
        },
    );
    canary.metadata.namespace = Some("default".to_string());
    canary.metadata.uid = Some(format!("{target}-uid"));
    canary
}

pub fn with_phase(mut canary: Canary, phase: Phase) -> Canary {
    canary.status.get_or_insert_with(CanaryStatus::default).phase = Some(phase);
    canary
}

pub fn with_weight(mut canary: Canary, weight: i32) -> Canary {
    canary.status.get_or_insert_with(CanaryStatus::default).canary_weight = weight;
    canary
}

pub fn with_source(mut canary: Canary, source: &str) -> Canary {
    canary.spec.source_ref = Some(WorkloadRef {
        name: source.to_string(),
        kind: "Deployment".to_string(),
        api_version: None,
    });
    canary
}

/// Canary with the extension switch on and a source workload
pub fn extension_canary(target: &str, source: &str, max_replicas: i32) -> Canary {
    let mut canary = with_source(test_canary(target), source);
    canary
        .metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(EXTENSION_SWITCH_ANNOTATION.to_string(), "true".to_string());
    canary.spec.analysis.max_replicas = max_replicas;
    canary
}

/// Canary using the rolling-update strategy against a source workload
pub fn rolling_canary(target: &str, source: &str, max_replicas: i32) -> Canary {
    let mut canary = with_source(test_canary(target), source);
    canary.spec.analysis.step_replicas = 1;
    canary.spec.analysis.max_replicas = max_replicas;
    canary
}

/// Fully rolled-out Deployment labelled `app: <name>`
pub fn deployment(name: &str, replicas: i32) -> Deployment {
    serde_json::from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": "default",
            "generation": 1
        },
        "spec": {
            "replicas": replicas,
            "progressDeadlineSeconds": 300,
            "minReadySeconds": 5,
            "revisionHistoryLimit": 4,
            "selector": { "matchLabels": { "app": name } },
            "template": {
                "metadata": {
                    "labels": { "app": name, "version": "v1" },
                    "annotations": { "prometheus.io/scrape": "true" }
                },
                "spec": {
                    "containers": [{
                        "name": "app",
                        "image": format!("registry.local/{name}:1.0.0"),
                        "resources": { "requests": { "cpu": "100m", "memory": "64Mi" } }
                    }]
                }
            }
        },
        "status": {
            "observedGeneration": 1,
            "replicas": replicas,
            "updatedReplicas": replicas,
            "readyReplicas": replicas,
            "availableReplicas": replicas
        }
    }))
    .unwrap()
}

/// Override the observed available and ready replica counts
pub fn with_available(mut deployment: Deployment, available: i32) -> Deployment {
    let status = deployment.status.get_or_insert_with(Default::default);
    status.available_replicas = Some(available);
    status.ready_replicas = Some(available);
    deployment
}

pub fn autoscaler(name: &str, target: &str) -> HorizontalPodAutoscaler {
    serde_json::from_value(json!({
        "apiVersion": "autoscaling/v2",
        "kind": "HorizontalPodAutoscaler",
        "metadata": {
            "name": name,
            "namespace": "default",
            "labels": { "team": "web" }
        },
        "spec": {
            "scaleTargetRef": { "apiVersion": "apps/v1", "kind": "Deployment", "name": target },
            "minReplicas": 2,
            "maxReplicas": 6,
            "metrics": [{
                "type": "Resource",
                "resource": {
                    "name": "cpu",
                    "target": { "type": "Utilization", "averageUtilization": 80 }
                }
            }]
        }
    }))
    .unwrap()
}
