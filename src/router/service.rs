//! ClusterIP service router
//!
//! Owns three services per Canary: `<target>-primary` and `<target>-canary`
//! select one side each, the apex `<target>` selects whatever currently
//! serves. It has no way to split traffic, so weights are never applied.
//!
//! Pod selectors come from the Deployment pod templates:
//! - `kanary.io/distinguish-labels` lists labels that tell the sides apart
//! - `kanary.io/general-labels` lists labels shared by both sides
//! - otherwise the Deployment's selector label is used

use super::{RouteOutcome, Router, RouterError, Routes};
use crate::config::split_list;
use crate::controller::cluster::{namespace_of, ClusterApi};
use crate::controller::deployer::selector_label;
use crate::controller::phase::{
    has_source_ref, is_finished, is_initialized, is_initializing, source_name,
};
use crate::crd::canary::{DISTINGUISH_LABELS_ANNOTATION, GENERAL_LABELS_ANNOTATION};
use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_PORT_NAME: &str = "http";

/// Pod labels a service selects on
#[derive(Debug, Clone, PartialEq)]
enum Selection {
    /// Each listed label, with its value taken from the pod template
    Labels(Vec<String>),
    /// The Deployment's selector label only
    SelectorLabel,
}

pub struct ServiceRouter {
    cluster: Arc<dyn ClusterApi>,
    selector_labels: Vec<String>,
    extra_ports: BTreeMap<String, i32>,
}

impl ServiceRouter {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        selector_labels: Vec<String>,
        extra_ports: BTreeMap<String, i32>,
    ) -> Self {
        Self {
            cluster,
            selector_labels,
            extra_ports,
        }
    }

    /// Selector label of a Deployment, falling back to the first configured candidate
    fn label_for(&self, deployment: &Deployment) -> String {
        selector_label(deployment, &self.selector_labels)
            .or_else(|| self.selector_labels.first().cloned())
            .unwrap_or_else(|| "app".to_string())
    }

    fn pod_selector(
        &self,
        service: &str,
        namespace: &str,
        deployment: &Deployment,
        selection: &Selection,
    ) -> Result<BTreeMap<String, String>, RouterError> {
        let template_labels = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();

        let keys = match selection {
            Selection::Labels(keys) => keys.clone(),
            Selection::SelectorLabel => vec![self.label_for(deployment)],
        };

        keys.into_iter()
            .map(|key| match template_labels.get(&key) {
                Some(value) => Ok((key, value.clone())),
                None => Err(RouterError::ServiceLabel {
                    service: service.to_string(),
                    namespace: namespace.to_string(),
                    deployment: deployment.name_any(),
                    label: key,
                }),
            })
            .collect()
    }

    fn ports(&self, canary: &Canary) -> Vec<ServicePort> {
        let service = &canary.spec.service;
        let target_port = service
            .target_port
            .filter(|p| *p > 0)
            .unwrap_or(service.port);

        let main = ServicePort {
            name: Some(
                service
                    .port_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| DEFAULT_PORT_NAME.to_string()),
            ),
            protocol: Some("TCP".to_string()),
            port: service.port,
            target_port: Some(IntOrString::Int(target_port)),
            ..Default::default()
        };

        std::iter::once(main)
            .chain(self.extra_ports.iter().map(|(name, port)| ServicePort {
                name: Some(name.clone()),
                protocol: Some("TCP".to_string()),
                port: *port,
                target_port: Some(IntOrString::Int(*port)),
                ..Default::default()
            }))
            .collect()
    }

    /// Create the service or bring its selector and ports up to date
    async fn reconcile_service(
        &self,
        canary: &Canary,
        name: &str,
        deployment_name: &str,
        selection: &Selection,
    ) -> Result<(), RouterError> {
        let namespace = namespace_of(canary)?;
        let deployment = self
            .cluster
            .get_deployment(&namespace, deployment_name)
            .await?;
        let selector = self.pod_selector(name, &namespace, &deployment, selection)?;
        let mut ports = self.ports(canary);

        let existing = match self.cluster.get_service(&namespace, name).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                let service = Service {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.clone()),
                        labels: Some(BTreeMap::from([(
                            self.label_for(&deployment),
                            name.to_string(),
                        )])),
                        owner_references: canary.controller_owner_ref(&()).map(|r| vec![r]),
                        ..Default::default()
                    },
                    spec: Some(ServiceSpec {
                        type_: Some("ClusterIP".to_string()),
                        selector: Some(selector),
                        ports: Some(ports),
                        ..Default::default()
                    }),
                    ..Default::default()
                };
                self.cluster.create_service(&namespace, &service).await?;
                info!(canary = %canary.name_any(), namespace = %namespace, service = %name, "Service created");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let current = existing.spec.clone().unwrap_or_default();
        let current_ports = current.ports.clone().unwrap_or_default();
        for port in &mut ports {
            if let Some(node_port) = current_ports
                .iter()
                .find(|p| p.name == port.name)
                .and_then(|p| p.node_port)
                .filter(|n| *n > 0)
            {
                port.node_port = Some(node_port);
            }
        }

        if sorted_by_port(&ports) == sorted_by_port(&current_ports)
            && current.selector.as_ref() == Some(&selector)
        {
            debug!(service = %name, namespace = %namespace, "Service up to date");
            return Ok(());
        }

        let mut updated = existing;
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.ports = Some(ports);
        spec.selector = Some(selector);
        self.cluster.update_service(&namespace, &updated).await?;
        info!(canary = %canary.name_any(), namespace = %namespace, service = %name, "Service updated");
        Ok(())
    }
}

fn sorted_by_port(ports: &[ServicePort]) -> Vec<ServicePort> {
    let mut sorted = ports.to_vec();
    sorted.sort_by_key(|p| p.port);
    sorted
}

fn annotation_labels(canary: &Canary, annotation: &str) -> Option<Vec<String>> {
    canary
        .annotations()
        .get(annotation)
        .map(|v| split_list(v))
        .filter(|labels| !labels.is_empty())
}

#[async_trait]
impl Router for ServiceRouter {
    /// Create the primary and canary services
    ///
    /// With distinguish labels the services are only written at the point the
    /// serving side is known to exist: while initializing when a source is
    /// referenced, once Initialized when the primary is synthesized.
    async fn initialize(&self, canary: &Canary) -> Result<(), RouterError> {
        let (_, primary, canary_service) = canary.service_names();
        let target = canary.spec.target_ref.name.clone();

        let selection = match annotation_labels(canary, DISTINGUISH_LABELS_ANNOTATION) {
            Some(labels) => {
                if has_source_ref(canary) && !is_initializing(canary) {
                    return Ok(());
                }
                if !has_source_ref(canary) && !is_initialized(canary) {
                    return Ok(());
                }
                Selection::Labels(labels)
            }
            None => Selection::SelectorLabel,
        };

        self.reconcile_service(canary, &primary, &source_name(canary), &selection)
            .await?;
        self.reconcile_service(canary, &canary_service, &target, &selection)
            .await
    }

    /// Point the apex service at the serving workload
    async fn reconcile(&self, canary: &Canary) -> Result<(), RouterError> {
        let (apex, _, _) = canary.service_names();
        let annotation = if is_finished(canary) {
            GENERAL_LABELS_ANNOTATION
        } else {
            DISTINGUISH_LABELS_ANNOTATION
        };
        let selection = annotation_labels(canary, annotation)
            .map(Selection::Labels)
            .unwrap_or(Selection::SelectorLabel);

        self.reconcile_service(canary, &apex, &source_name(canary), &selection)
            .await
    }

    async fn set_routes(
        &self,
        canary: &Canary,
        primary_weight: i32,
        canary_weight: i32,
        _mirrored: bool,
    ) -> Result<RouteOutcome, RouterError> {
        debug!(
            canary = %canary.name_any(),
            primary_weight,
            canary_weight,
            "ClusterIP services cannot split traffic"
        );
        Ok(RouteOutcome::Applied)
    }

    async fn get_routes(&self, _canary: &Canary) -> Result<Routes, RouterError> {
        Ok(Routes::primary_only())
    }

    /// Hand the apex service back to the target workload
    async fn finalize(&self, canary: &Canary) -> Result<(), RouterError> {
        let namespace = namespace_of(canary)?;
        let (apex, _, _) = canary.service_names();
        match self.cluster.get_service(&namespace, &apex).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let selection = annotation_labels(canary, GENERAL_LABELS_ANNOTATION)
            .map(Selection::Labels)
            .unwrap_or(Selection::SelectorLabel);
        self.reconcile_service(canary, &apex, &canary.spec.target_ref.name, &selection)
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[path = "service_test.rs"]
mod tests;
