use super::*;
use crate::controller::cluster::{ClusterWrite, MockCluster};
use crate::controller::config_tracker::{ConfigKind, ConfigRef, MockTracker, NopTracker};
use crate::controller::fixtures::{autoscaler, deployment, test_canary, with_phase};
use crate::crd::{AutoscalerRef, CanaryStatus, Phase};

fn labels() -> Vec<String> {
    vec!["app".to_string(), "name".to_string()]
}

fn deployer(cluster: Arc<MockCluster>) -> Deployer {
    Deployer::new(cluster, Arc::new(NopTracker), labels())
}

fn template_labels(dep: &Deployment) -> BTreeMap<String, String> {
    dep.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

fn template_annotations(dep: &Deployment) -> BTreeMap<String, String> {
    dep.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_initialize_creates_primary_and_scales_target_down() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 3)));
    let canary = test_canary("podinfo");

    let label = deployer(cluster.clone()).initialize(&canary).await.unwrap();
    assert_eq!(label, "app");

    let primary = cluster.deployment("podinfo-primary").expect("primary created");
    let spec = primary.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(3));
    assert_eq!(spec.min_ready_seconds, Some(5));
    assert_eq!(spec.revision_history_limit, Some(4));
    assert_eq!(
        spec.selector.match_labels.as_ref().unwrap().get("app"),
        Some(&"podinfo-primary".to_string())
    );

    let labels = template_labels(&primary);
    assert_eq!(labels.get("app"), Some(&"podinfo-primary".to_string()));
    assert_eq!(labels.get("version"), Some(&"v1".to_string()));

    let annotations = template_annotations(&primary);
    assert_eq!(annotations.get("prometheus.io/scrape"), Some(&"true".to_string()));
    assert!(annotations.contains_key(TRACKING_ANNOTATION));

    let owner = &primary.metadata.owner_references.as_ref().unwrap()[0];
    assert_eq!(owner.kind, "Canary");
    assert_eq!(owner.name, "podinfo");
    assert_eq!(owner.controller, Some(true));

    assert_eq!(cluster.replicas("podinfo"), Some(0));
}

#[tokio::test]
async fn test_initialize_primary_gets_one_replica_when_target_is_scaled_down() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 0)));

    deployer(cluster.clone())
        .initialize(&test_canary("podinfo"))
        .await
        .unwrap();

    assert_eq!(cluster.replicas("podinfo-primary"), Some(1));
}

#[tokio::test]
async fn test_initialize_only_scales_target_on_first_run() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 3)));
    let canary = with_phase(test_canary("podinfo"), Phase::Initialized);

    deployer(cluster.clone()).initialize(&canary).await.unwrap();

    assert_eq!(cluster.replicas("podinfo"), Some(3));
    assert_eq!(
        cluster.writes(),
        vec![ClusterWrite::CreateDeployment("podinfo-primary".to_string())]
    );
}

#[tokio::test]
async fn test_initialize_is_idempotent_for_existing_primary() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("podinfo", 3))
            .with_deployment(deployment("podinfo-primary", 5)),
    );
    let canary = with_phase(test_canary("podinfo"), Phase::Progressing);

    deployer(cluster.clone()).initialize(&canary).await.unwrap();

    assert!(cluster.writes().is_empty());
    assert_eq!(cluster.replicas("podinfo-primary"), Some(5));
}

#[tokio::test]
async fn test_initialize_creates_primary_autoscaler() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("podinfo", 2))
            .with_autoscaler(autoscaler("podinfo", "podinfo")),
    );
    let mut canary = test_canary("podinfo");
    canary.spec.autoscaler_ref = Some(AutoscalerRef {
        name: "podinfo".to_string(),
        kind: "HorizontalPodAutoscaler".to_string(),
        api_version: None,
    });

    deployer(cluster.clone()).initialize(&canary).await.unwrap();

    let hpa = cluster.autoscaler("podinfo-primary").expect("primary hpa created");
    let spec = hpa.spec.unwrap();
    assert_eq!(spec.scale_target_ref.name, "podinfo-primary");
    assert_eq!(spec.scale_target_ref.kind, "Deployment");
    assert_eq!(spec.min_replicas, Some(2));
    assert_eq!(spec.max_replicas, 6);
    assert_eq!(spec.metrics.map(|m| m.len()), Some(1));
    assert_eq!(
        hpa.metadata.labels.unwrap().get("team"),
        Some(&"web".to_string())
    );
}

#[tokio::test]
async fn test_initialize_fails_when_autoscaler_missing() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 2)));
    let mut canary = with_phase(test_canary("podinfo"), Phase::Initialized);
    canary.spec.autoscaler_ref = Some(AutoscalerRef {
        name: "podinfo".to_string(),
        kind: "HorizontalPodAutoscaler".to_string(),
        api_version: None,
    });

    let err = deployer(cluster).initialize(&canary).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "creating HorizontalPodAutoscaler podinfo-primary.default failed: HorizontalPodAutoscaler podinfo.default not found"
    );
}

#[tokio::test]
async fn test_initialize_fails_when_target_missing() {
    let cluster = Arc::new(MockCluster::new());

    let err = deployer(cluster)
        .initialize(&test_canary("podinfo"))
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "creating deployment podinfo-primary.default failed: deployment podinfo.default not found"
    );
}

#[tokio::test]
async fn test_initialize_rejects_selector_without_candidate_label() {
    let mut target = deployment("podinfo", 2);
    target.spec.as_mut().unwrap().selector.match_labels =
        Some(BTreeMap::from([("release".to_string(), "podinfo".to_string())]));
    let cluster = Arc::new(MockCluster::new().with_deployment(target));

    let err = deployer(cluster.clone())
        .initialize(&test_canary("podinfo"))
        .await
        .unwrap_err();

    assert!(err
        .to_string()
        .contains("spec.selector.matchLabels must contain selector 'app: podinfo'"));
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn test_promote_copies_template_and_refreshes_tracking_id() {
    let mut target = deployment("podinfo", 3);
    {
        let spec = target.spec.as_mut().unwrap();
        spec.min_ready_seconds = Some(15);
        spec.template.spec.as_mut().unwrap().containers[0].image =
            Some("registry.local/podinfo:2.0.0".to_string());
    }
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 3)));
    let canary = test_canary("podinfo");
    let deployer = deployer(cluster.clone());
    deployer.initialize(&canary).await.unwrap();
    let first_id = template_annotations(&cluster.deployment("podinfo-primary").unwrap())
        .get(TRACKING_ANNOTATION)
        .cloned()
        .unwrap();

    cluster.put_deployment(target);
    deployer.promote(&canary).await.unwrap();

    let primary = cluster.deployment("podinfo-primary").unwrap();
    let spec = primary.spec.as_ref().unwrap();
    assert_eq!(spec.min_ready_seconds, Some(15));
    assert_eq!(
        spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("registry.local/podinfo:2.0.0")
    );
    assert_eq!(
        template_labels(&primary).get("app"),
        Some(&"podinfo-primary".to_string())
    );
    let second_id = template_annotations(&primary)
        .get(TRACKING_ANNOTATION)
        .cloned()
        .unwrap();
    assert_ne!(first_id, second_id);
    assert_eq!(uuid::Uuid::parse_str(&second_id).unwrap().get_version_num(), 4);
}

#[tokio::test]
async fn test_promote_propagates_config_references() {
    let tracker = Arc::new(MockTracker::with_refs(vec![ConfigRef {
        kind: ConfigKind::ConfigMap,
        name: "podinfo-env".to_string(),
    }]));
    let mut target = deployment("podinfo", 1);
    target.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].env_from =
        Some(vec![serde_json::from_value(
            serde_json::json!({ "configMapRef": { "name": "podinfo-env" } }),
        )
        .unwrap()]);
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(target)
            .with_deployment(deployment("podinfo-primary", 1)),
    );
    let deployer = Deployer::new(cluster.clone(), tracker.clone(), labels());

    deployer.promote(&test_canary("podinfo")).await.unwrap();

    assert_eq!(tracker.created().len(), 1);
    let primary = cluster.deployment("podinfo-primary").unwrap();
    let container = &primary.spec.unwrap().template.spec.unwrap().containers[0];
    let env_from = container.env_from.as_ref().unwrap();
    assert_eq!(
        env_from[0].config_map_ref.as_ref().map(|c| c.name.as_str()),
        Some("podinfo-env-primary")
    );
}

#[tokio::test]
async fn test_promote_fails_without_primary() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 1)));

    let err = deployer(cluster)
        .promote(&test_canary("podinfo"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::Api(ref e) if e.is_not_found()));
    assert_eq!(err.to_string(), "deployment podinfo-primary.default not found");
}

#[tokio::test]
async fn test_promote_wraps_update_failure() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("podinfo", 1))
            .with_deployment(deployment("podinfo-primary", 1)),
    );
    cluster.fail_update("podinfo-primary");

    let err = deployer(cluster)
        .promote(&test_canary("podinfo"))
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::Promote { .. }));
    assert!(err
        .to_string()
        .starts_with("updating deployment podinfo-primary.default template spec failed"));
}

#[tokio::test]
async fn test_has_deployment_changed_without_snapshot() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 1)));

    let changed = deployer(cluster)
        .has_deployment_changed(&test_canary("podinfo"))
        .await
        .unwrap();

    assert!(changed);
}

#[tokio::test]
async fn test_has_deployment_changed_compares_snapshot() {
    let target = deployment("podinfo", 1);
    let snapshot =
        encode_pod_spec(target.spec.as_ref().unwrap().template.spec.as_ref().unwrap()).unwrap();
    let cluster = Arc::new(MockCluster::new().with_deployment(target.clone()));
    let deployer = deployer(cluster.clone());
    let mut canary = test_canary("podinfo");
    canary.status = Some(CanaryStatus {
        last_applied_spec: Some(snapshot),
        ..Default::default()
    });

    assert!(!deployer.has_deployment_changed(&canary).await.unwrap());

    let mut changed = target;
    changed.spec.as_mut().unwrap().template.spec.as_mut().unwrap().containers[0].image =
        Some("registry.local/podinfo:1.1.0".to_string());
    cluster.put_deployment(changed);

    assert!(deployer.has_deployment_changed(&canary).await.unwrap());
}

#[tokio::test]
async fn test_has_deployment_changed_rejects_corrupt_snapshot() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 1)));
    let mut canary = test_canary("podinfo");
    canary.status = Some(CanaryStatus {
        last_applied_spec: Some("not base64!".to_string()),
        ..Default::default()
    });

    let err = deployer(cluster)
        .has_deployment_changed(&canary)
        .await
        .unwrap_err();

    assert!(matches!(err, DeployerError::Snapshot { .. }));
}

#[tokio::test]
async fn test_scale_sets_exact_replicas() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 1)));

    deployer(cluster.clone())
        .scale(&test_canary("podinfo"), 4)
        .await
        .unwrap();

    assert_eq!(cluster.scaled(), vec![("podinfo".to_string(), 4)]);
}

#[tokio::test]
async fn test_scale_reports_attempted_replicas_on_failure() {
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("podinfo", 1)));
    cluster.fail_update("podinfo");

    let err = deployer(cluster)
        .scale(&test_canary("podinfo"), 4)
        .await
        .unwrap_err();

    assert!(err.to_string().starts_with("scaling podinfo.default to 4 failed"));
}

#[test]
fn test_make_annotations_replaces_tracking_id() {
    let existing = BTreeMap::from([
        (TRACKING_ANNOTATION.to_string(), "old".to_string()),
        ("team".to_string(), "web".to_string()),
    ]);

    let annotations = make_annotations(Some(&existing));

    assert_eq!(annotations.len(), 2);
    assert_eq!(annotations.get("team"), Some(&"web".to_string()));
    assert_ne!(annotations.get(TRACKING_ANNOTATION), Some(&"old".to_string()));
}

#[test]
fn test_make_primary_labels_overrides_selector_label() {
    let labels = BTreeMap::from([
        ("app".to_string(), "podinfo".to_string()),
        ("tier".to_string(), "web".to_string()),
    ]);

    let primary = make_primary_labels(Some(&labels), "podinfo-primary", "app");

    assert_eq!(primary.get("app"), Some(&"podinfo-primary".to_string()));
    assert_eq!(primary.get("tier"), Some(&"web".to_string()));
}

#[test]
fn test_selector_label_prefers_candidate_order() {
    let mut dep = deployment("podinfo", 1);
    dep.spec.as_mut().unwrap().selector.match_labels = Some(BTreeMap::from([
        ("name".to_string(), "podinfo".to_string()),
        ("app".to_string(), "podinfo".to_string()),
    ]));

    assert_eq!(
        selector_label(&dep, &["app".to_string(), "name".to_string()]),
        Some("app".to_string())
    );
    assert_eq!(
        selector_label(&dep, &["name".to_string(), "app".to_string()]),
        Some("name".to_string())
    );
    assert_eq!(selector_label(&dep, &["release".to_string()]), None);
}
