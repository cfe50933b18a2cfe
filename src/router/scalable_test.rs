use super::*;
use crate::controller::cluster::MockCluster;
use crate::controller::fixtures::{
    deployment, extension_canary, test_canary, with_available, with_phase, with_weight,
};
use crate::crd::Phase;
use crate::router::recording::{RecordingRouter, RouterCall};

fn router(cluster: Arc<MockCluster>, inner: Arc<RecordingRouter>) -> ScalableRouter {
    ScalableRouter::new(cluster, inner)
}

fn progressing(max_replicas: i32) -> Canary {
    let mut canary = with_phase(
        extension_canary("web", "web-stable", max_replicas),
        Phase::Progressing,
    );
    canary.spec.analysis.step_weight = 25;
    canary
}

#[tokio::test]
async fn test_promoted_moves_all_capacity_to_target() {
    let canary = with_weight(
        with_phase(extension_canary("web", "web-stable", 10), Phase::Promoting),
        40,
    );
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("web", 4))
            .with_deployment(deployment("web-stable", 6)),
    );
    let inner = Arc::new(RecordingRouter::new());

    let outcome = router(cluster.clone(), inner.clone())
        .set_routes(&canary, 0, 100, false)
        .await
        .unwrap();

    assert_eq!(outcome, RouteOutcome::Applied);
    assert_eq!(inner.calls(), vec![RouterCall::SetRoutes(0, 100, false)]);
    assert_eq!(
        cluster.scaled(),
        vec![("web".to_string(), 10), ("web-stable".to_string(), 0)]
    );
}

#[tokio::test]
async fn test_failed_returns_all_capacity_to_source() {
    let canary = with_phase(extension_canary("web", "web-stable", 10), Phase::Failed);
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("web", 3))
            .with_deployment(deployment("web-stable", 7)),
    );
    let inner = Arc::new(RecordingRouter::new());

    router(cluster.clone(), inner.clone())
        .set_routes(&canary, 100, 0, false)
        .await
        .unwrap();

    assert_eq!(inner.calls(), vec![RouterCall::SetRoutes(100, 0, false)]);
    assert_eq!(
        cluster.scaled(),
        vec![("web-stable".to_string(), 10), ("web".to_string(), 0)]
    );
}

#[tokio::test]
async fn test_progressing_sizes_sides_from_weight_and_observed_availability() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(with_available(deployment("web", 2), 2))
            .with_deployment(deployment("web-stable", 8)),
    );
    let inner = Arc::new(RecordingRouter::new());

    let outcome = router(cluster.clone(), inner.clone())
        .set_routes(&progressing(10), 75, 25, false)
        .await
        .unwrap();

    assert_eq!(outcome, RouteOutcome::Applied);
    assert_eq!(inner.calls(), vec![RouterCall::SetRoutes(75, 25, false)]);
    // ceil(10 * 25 / 100) requested, primary sized from the 2 available
    assert_eq!(
        cluster.scaled(),
        vec![("web".to_string(), 3), ("web-stable".to_string(), 8)]
    );
}

#[tokio::test]
async fn test_unroutable_side_defers_routing() {
    let mut canary = progressing(10);
    canary.spec.analysis.step_weight = 0;
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(with_available(deployment("web", 0), 0))
            .with_deployment(deployment("web-stable", 10)),
    );
    let inner = Arc::new(RecordingRouter::new());

    let outcome = router(cluster.clone(), inner.clone())
        .set_routes(&canary, 90, 10, false)
        .await
        .unwrap();

    assert_eq!(outcome, RouteOutcome::Deferred);
    assert!(inner.calls().is_empty());
    // weighted canary is never left without an instance
    assert_eq!(
        cluster.scaled(),
        vec![("web".to_string(), 1), ("web-stable".to_string(), 10)]
    );
}

#[tokio::test]
async fn test_zero_weight_side_is_routable_without_capacity() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(with_available(deployment("web", 0), 0))
            .with_deployment(deployment("web-stable", 4)),
    );
    let inner = Arc::new(RecordingRouter::new());

    let outcome = router(cluster.clone(), inner.clone())
        .set_routes(&progressing(4), 100, 0, false)
        .await
        .unwrap();

    assert_eq!(outcome, RouteOutcome::Applied);
    assert_eq!(
        cluster.scaled(),
        vec![("web".to_string(), 0), ("web-stable".to_string(), 4)]
    );
}

#[tokio::test]
async fn test_primary_keeps_an_instance_unless_canary_takes_everything() {
    for weight in [1, 50, 99, 100] {
        let cluster = Arc::new(
            MockCluster::new()
                .with_deployment(deployment("web", 4))
                .with_deployment(deployment("web-stable", 4)),
        );

        router(cluster.clone(), Arc::new(RecordingRouter::new()))
            .set_routes(&progressing(4), 100 - weight, weight, false)
            .await
            .unwrap();

        let canary_replicas = cluster.replicas("web").unwrap();
        let primary_replicas = cluster.replicas("web-stable").unwrap();
        assert!(canary_replicas >= 1, "weight={weight}");
        if weight == 100 {
            assert_eq!(primary_replicas, 0);
        } else {
            assert!(primary_replicas >= 1, "weight={weight}");
        }
    }
}

#[tokio::test]
async fn test_explicit_canary_replicas_win_over_stepped_weight() {
    let mut canary = progressing(10);
    canary.spec.analysis.canary_replicas = 5;
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(with_available(deployment("web", 1), 1))
            .with_deployment(deployment("web-stable", 9)),
    );

    router(cluster.clone(), Arc::new(RecordingRouter::new()))
        .set_routes(&canary, 90, 10, false)
        .await
        .unwrap();

    assert_eq!(cluster.replicas("web"), Some(5));
    assert_eq!(cluster.replicas("web-stable"), Some(9));
}

#[tokio::test]
async fn test_scale_failure_names_workload_and_weight() {
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("web", 2))
            .with_deployment(deployment("web-stable", 8)),
    );
    cluster.fail_update("web");

    let err = router(cluster.clone(), Arc::new(RecordingRouter::new()))
        .set_routes(&progressing(10), 75, 25, false)
        .await
        .unwrap_err();

    match &err {
        RouterError::SetRoutes {
            canary_weight,
            source,
            ..
        } => {
            assert_eq!(*canary_weight, 25);
            assert!(matches!(
                source.as_ref(),
                RouterError::Replicas { name, replicas: 3, .. } if name == "web"
            ));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.to_string().contains("canaryWeight: 25"));
    assert!(cluster.scaled().is_empty());
}

#[tokio::test]
async fn test_inner_failure_aborts_before_scaling() {
    let canary = with_phase(extension_canary("web", "web-stable", 4), Phase::Promoting);
    let cluster = Arc::new(
        MockCluster::new()
            .with_deployment(deployment("web", 2))
            .with_deployment(deployment("web-stable", 2)),
    );

    let err = router(cluster.clone(), Arc::new(RecordingRouter::failing()))
        .set_routes(&canary, 0, 100, false)
        .await
        .unwrap_err();

    assert!(matches!(err, RouterError::SetRoutes { .. }));
    assert!(cluster.writes().is_empty());
}

#[tokio::test]
async fn test_get_routes_reports_configured_weight_without_steps() {
    let mut canary = extension_canary("web", "web-stable", 4);
    canary.spec.analysis.canary_weight = 30;
    let inner = Arc::new(RecordingRouter::new());
    let router = router(Arc::new(MockCluster::new()), inner.clone());

    let routes = router.get_routes(&canary).await.unwrap();
    assert_eq!(routes, Routes::canary_share(30));
    assert!(inner.calls().is_empty());

    canary.spec.analysis.step_weight = 10;
    let routes = router.get_routes(&canary).await.unwrap();
    assert_eq!(routes, Routes::canary_share(10));
    assert_eq!(inner.calls(), vec![RouterCall::GetRoutes]);
}

#[tokio::test]
async fn test_switch_off_passes_everything_through() {
    let canary = with_weight(with_phase(test_canary("web"), Phase::Promoting), 40);
    let cluster = Arc::new(MockCluster::new().with_deployment(deployment("web", 2)));
    let wrapped = Arc::new(RecordingRouter::new());
    let bare = RecordingRouter::new();
    let router = router(cluster.clone(), wrapped.clone());

    assert_eq!(
        router.set_routes(&canary, 60, 40, true).await.unwrap(),
        bare.set_routes(&canary, 60, 40, true).await.unwrap()
    );
    assert_eq!(
        router.get_routes(&canary).await.unwrap(),
        bare.get_routes(&canary).await.unwrap()
    );
    router.reconcile(&canary).await.unwrap();
    bare.reconcile(&canary).await.unwrap();
    router.finalize(&canary).await.unwrap();
    bare.finalize(&canary).await.unwrap();

    assert_eq!(wrapped.calls(), bare.calls());
    assert!(cluster.writes().is_empty());
}
