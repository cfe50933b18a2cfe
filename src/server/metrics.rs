//! Prometheus metrics for the controller
//!
//! - `kanary_reconciliations_total{outcome}`
//! - `kanary_reconcile_duration_seconds{outcome}`
//! - `kanary_canary_weight{namespace,canary}`
//! - `kanary_desired_replicas{namespace,canary,side}`

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

pub type SharedMetrics = Arc<ControllerMetrics>;

pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconcile_duration_seconds: HistogramVec,
    canary_weight: IntGaugeVec,
    desired_replicas: IntGaugeVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new("kanary_reconciliations_total", "Canary reconciliations"),
            &["outcome"],
        )?;
        registry.register(Box::new(reconciliations_total.clone()))?;

        let reconcile_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "kanary_reconcile_duration_seconds",
                "Time spent reconciling one Canary",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(reconcile_duration_seconds.clone()))?;

        let canary_weight = IntGaugeVec::new(
            Opts::new("kanary_canary_weight", "Recorded canary traffic weight"),
            &["namespace", "canary"],
        )?;
        registry.register(Box::new(canary_weight.clone()))?;

        let desired_replicas = IntGaugeVec::new(
            Opts::new(
                "kanary_desired_replicas",
                "Desired replicas of the primary and canary workloads",
            ),
            &["namespace", "canary", "side"],
        )?;
        registry.register(Box::new(desired_replicas.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconcile_duration_seconds,
            canary_weight,
            desired_replicas,
        })
    }

    pub fn record_reconciliation(&self, outcome: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&[outcome])
            .inc();
        self.reconcile_duration_seconds
            .with_label_values(&[outcome])
            .observe(duration_secs);
    }

    pub fn set_canary_weight(&self, namespace: &str, canary: &str, weight: i32) {
        self.canary_weight
            .with_label_values(&[namespace, canary])
            .set(i64::from(weight));
    }

    /// `side` is `primary` or `canary`
    pub fn set_desired_replicas(&self, namespace: &str, canary: &str, side: &str, replicas: i32) {
        self.desired_replicas
            .with_label_values(&[namespace, canary, side])
            .set(i64::from(replicas));
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Build the shared metrics registry
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    Ok(Arc::new(ControllerMetrics::new()?))
}
