//! Orchestration API access
//!
//! Every read and write the controllers and routers perform goes through
//! `ClusterApi`. Production uses `KubeCluster` over `kube::Api`; tests use
//! `MockCluster`, an in-memory store that records every write.
//!
//! Writes are plain "read, mutate a copy, replace" sequences. A conflicting
//! concurrent update surfaces as `ApiError::Kube` and is retried by the next
//! reconciliation, never here.

use crate::crd::{Canary, CanaryStatus};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{kind} {name}.{namespace} not found")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name}.{namespace} {operation} failed: {source}")]
    Kube {
        kind: &'static str,
        name: String,
        namespace: String,
        operation: &'static str,
        #[source]
        source: kube::Error,
    },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

/// Canary resource is cluster-scoped or was built without a namespace
#[derive(Debug, Error)]
#[error("canary {0} has no namespace")]
pub struct MissingNamespace(pub String);

pub fn namespace_of(canary: &Canary) -> Result<String, MissingNamespace> {
    canary
        .namespace()
        .ok_or_else(|| MissingNamespace(canary.name_any()))
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError>;

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError>;

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HorizontalPodAutoscaler, ApiError>;

    async fn create_autoscaler(
        &self,
        namespace: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, ApiError>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError>;

    async fn create_service(&self, namespace: &str, service: &Service)
        -> Result<Service, ApiError>;

    async fn update_service(&self, namespace: &str, service: &Service)
        -> Result<Service, ApiError>;

    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ApiError>;

    /// Replace the Canary object (spec and metadata)
    async fn update_canary(&self, namespace: &str, canary: &Canary) -> Result<Canary, ApiError>;

    /// Merge-patch the status subresource
    async fn update_canary_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryStatus,
    ) -> Result<Canary, ApiError>;
}

/// `ClusterApi` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Map a kube error, turning 404 into the distinguished not-found variant
fn api_error(
    kind: &'static str,
    namespace: &str,
    name: &str,
    operation: &'static str,
) -> impl FnOnce(kube::Error) -> ApiError {
    let namespace = namespace.to_string();
    let name = name.to_string();
    move |err| match err {
        kube::Error::Api(ref resp) if resp.code == 404 => ApiError::NotFound {
            kind,
            name,
            namespace,
        },
        source => ApiError::Kube {
            kind,
            name,
            namespace,
            operation,
            source,
        },
    }
}

async fn replace<K>(api: &Api<K>, kind: &'static str, namespace: &str, obj: &K) -> Result<K, ApiError>
where
    K: kube::Resource + Clone + DeserializeOwned + serde::Serialize + Debug,
{
    let name = obj.name_any();
    api.replace(&name, &PostParams::default(), obj)
        .await
        .map_err(api_error(kind, namespace, &name, "update"))
}

async fn create<K>(api: &Api<K>, kind: &'static str, namespace: &str, obj: &K) -> Result<K, ApiError>
where
    K: kube::Resource + Clone + DeserializeOwned + serde::Serialize + Debug,
{
    let name = obj.name_any();
    api.create(&PostParams::default(), obj)
        .await
        .map_err(api_error(kind, namespace, &name, "create"))
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError> {
        self.api::<Deployment>(namespace)
            .get(name)
            .await
            .map_err(api_error("deployment", namespace, name, "get"))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError> {
        create(&self.api(namespace), "deployment", namespace, deployment).await
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError> {
        replace(&self.api(namespace), "deployment", namespace, deployment).await
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HorizontalPodAutoscaler, ApiError> {
        self.api::<HorizontalPodAutoscaler>(namespace)
            .get(name)
            .await
            .map_err(api_error("HorizontalPodAutoscaler", namespace, name, "get"))
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, ApiError> {
        create(&self.api(namespace), "HorizontalPodAutoscaler", namespace, hpa).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        self.api::<Service>(namespace)
            .get(name)
            .await
            .map_err(api_error("service", namespace, name, "get"))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ApiError> {
        create(&self.api(namespace), "service", namespace, service).await
    }

    async fn update_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ApiError> {
        replace(&self.api(namespace), "service", namespace, service).await
    }

    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ApiError> {
        self.api::<Canary>(namespace)
            .get(name)
            .await
            .map_err(api_error("canary", namespace, name, "get"))
    }

    async fn update_canary(&self, namespace: &str, canary: &Canary) -> Result<Canary, ApiError> {
        replace(&self.api(namespace), "canary", namespace, canary).await
    }

    async fn update_canary_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryStatus,
    ) -> Result<Canary, ApiError> {
        self.api::<Canary>(namespace)
            .patch_status(
                name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({
                    "status": status
                })),
            )
            .await
            .map_err(api_error("canary", namespace, name, "status update"))
    }
}

/// Write recorded by `MockCluster`
#[cfg(test)]
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterWrite {
    CreateDeployment(String),
    UpdateDeployment { name: String, replicas: Option<i32> },
    CreateAutoscaler(String),
    CreateService(String),
    UpdateService(String),
    UpdateCanary(String),
    UpdateCanaryStatus(String),
}

/// In-memory `ClusterApi` for tests
///
/// Objects are keyed by `<namespace>/<name>`. Updates keep whatever status
/// the submitted object carries, so availability set up by a test survives
/// a scale.
#[cfg(test)]
#[derive(Default)]
pub struct MockCluster {
    deployments: std::sync::Mutex<std::collections::BTreeMap<String, Deployment>>,
    autoscalers: std::sync::Mutex<std::collections::BTreeMap<String, HorizontalPodAutoscaler>>,
    services: std::sync::Mutex<std::collections::BTreeMap<String, Service>>,
    canaries: std::sync::Mutex<std::collections::BTreeMap<String, Canary>>,
    writes: std::sync::Mutex<Vec<ClusterWrite>>,
    failing_gets: std::sync::Mutex<std::collections::BTreeSet<String>>,
    failing_updates: std::sync::Mutex<std::collections::BTreeSet<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    fn object_key<K: kube::Resource>(obj: &K) -> String {
        Self::key(
            obj.meta().namespace.as_deref().unwrap_or("default"),
            obj.meta().name.as_deref().unwrap_or_default(),
        )
    }

    fn injected(kind: &'static str, namespace: &str, name: &str, operation: &'static str) -> ApiError {
        ApiError::Kube {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
            operation,
            source: kube::Error::Service("injected failure".into()),
        }
    }

    fn not_found(kind: &'static str, namespace: &str, name: &str) -> ApiError {
        ApiError::NotFound {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    pub fn with_deployment(self, deployment: Deployment) -> Self {
        self.put_deployment(deployment);
        self
    }

    pub fn with_autoscaler(self, hpa: HorizontalPodAutoscaler) -> Self {
        self.autoscalers
            .lock()
            .unwrap()
            .insert(Self::object_key(&hpa), hpa);
        self
    }

    pub fn with_service(self, service: Service) -> Self {
        self.services
            .lock()
            .unwrap()
            .insert(Self::object_key(&service), service);
        self
    }

    pub fn with_canary(self, canary: Canary) -> Self {
        self.canaries
            .lock()
            .unwrap()
            .insert(Self::object_key(&canary), canary);
        self
    }

    pub fn put_deployment(&self, deployment: Deployment) {
        self.deployments
            .lock()
            .unwrap()
            .insert(Self::object_key(&deployment), deployment);
    }

    /// Make every `get` of the named object fail with an API error
    pub fn fail_get(&self, name: &str) {
        self.failing_gets.lock().unwrap().insert(name.to_string());
    }

    /// Make every update or create of the named object fail with an API error
    pub fn fail_update(&self, name: &str) {
        self.failing_updates.lock().unwrap().insert(name.to_string());
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.deployments
            .lock()
            .unwrap()
            .get(&Self::key("default", name))
            .cloned()
    }

    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.deployment(name)
            .and_then(|d| d.spec)
            .and_then(|s| s.replicas)
    }

    pub fn autoscaler(&self, name: &str) -> Option<HorizontalPodAutoscaler> {
        self.autoscalers
            .lock()
            .unwrap()
            .get(&Self::key("default", name))
            .cloned()
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&Self::key("default", name))
            .cloned()
    }

    pub fn canary(&self, name: &str) -> Option<Canary> {
        self.canaries
            .lock()
            .unwrap()
            .get(&Self::key("default", name))
            .cloned()
    }

    pub fn writes(&self) -> Vec<ClusterWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Replica counts written to Deployments, in order
    pub fn scaled(&self) -> Vec<(String, i32)> {
        self.writes()
            .into_iter()
            .filter_map(|w| match w {
                ClusterWrite::UpdateDeployment {
                    name,
                    replicas: Some(r),
                } => Some((name, r)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, write: ClusterWrite) {
        self.writes.lock().unwrap().push(write);
    }

    fn check_get(&self, kind: &'static str, namespace: &str, name: &str) -> Result<(), ApiError> {
        if self.failing_gets.lock().unwrap().contains(name) {
            return Err(Self::injected(kind, namespace, name, "get"));
        }
        Ok(())
    }

    fn check_update(
        &self,
        kind: &'static str,
        namespace: &str,
        name: &str,
        operation: &'static str,
    ) -> Result<(), ApiError> {
        if self.failing_updates.lock().unwrap().contains(name) {
            return Err(Self::injected(kind, namespace, name, operation));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ClusterApi for MockCluster {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, ApiError> {
        self.check_get("deployment", namespace, name)?;
        self.deployments
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("deployment", namespace, name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError> {
        let name = deployment.name_any();
        self.check_update("deployment", namespace, &name, "create")?;
        let mut stored = deployment.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        self.deployments
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &name), stored.clone());
        self.record(ClusterWrite::CreateDeployment(name));
        Ok(stored)
    }

    async fn update_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, ApiError> {
        let name = deployment.name_any();
        self.check_update("deployment", namespace, &name, "update")?;
        let mut store = self.deployments.lock().unwrap();
        let key = Self::key(namespace, &name);
        if !store.contains_key(&key) {
            return Err(Self::not_found("deployment", namespace, &name));
        }
        store.insert(key, deployment.clone());
        drop(store);
        self.record(ClusterWrite::UpdateDeployment {
            name,
            replicas: deployment.spec.as_ref().and_then(|s| s.replicas),
        });
        Ok(deployment.clone())
    }

    async fn get_autoscaler(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HorizontalPodAutoscaler, ApiError> {
        self.check_get("HorizontalPodAutoscaler", namespace, name)?;
        self.autoscalers
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("HorizontalPodAutoscaler", namespace, name))
    }

    async fn create_autoscaler(
        &self,
        namespace: &str,
        hpa: &HorizontalPodAutoscaler,
    ) -> Result<HorizontalPodAutoscaler, ApiError> {
        let name = hpa.name_any();
        self.check_update("HorizontalPodAutoscaler", namespace, &name, "create")?;
        self.autoscalers
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &name), hpa.clone());
        self.record(ClusterWrite::CreateAutoscaler(name));
        Ok(hpa.clone())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        self.check_get("service", namespace, name)?;
        self.services
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("service", namespace, name))
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ApiError> {
        let name = service.name_any();
        self.check_update("service", namespace, &name, "create")?;
        self.services
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &name), service.clone());
        self.record(ClusterWrite::CreateService(name));
        Ok(service.clone())
    }

    async fn update_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, ApiError> {
        let name = service.name_any();
        self.check_update("service", namespace, &name, "update")?;
        self.services
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &name), service.clone());
        self.record(ClusterWrite::UpdateService(name));
        Ok(service.clone())
    }

    async fn get_canary(&self, namespace: &str, name: &str) -> Result<Canary, ApiError> {
        self.check_get("canary", namespace, name)?;
        self.canaries
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| Self::not_found("canary", namespace, name))
    }

    async fn update_canary(&self, namespace: &str, canary: &Canary) -> Result<Canary, ApiError> {
        let name = canary.name_any();
        self.check_update("canary", namespace, &name, "update")?;
        self.canaries
            .lock()
            .unwrap()
            .insert(Self::key(namespace, &name), canary.clone());
        self.record(ClusterWrite::UpdateCanary(name));
        Ok(canary.clone())
    }

    async fn update_canary_status(
        &self,
        namespace: &str,
        name: &str,
        status: &CanaryStatus,
    ) -> Result<Canary, ApiError> {
        self.check_update("canary", namespace, name, "status update")?;
        let mut store = self.canaries.lock().unwrap();
        let canary = store
            .get_mut(&Self::key(namespace, name))
            .ok_or_else(|| Self::not_found("canary", namespace, name))?;
        canary.status = Some(status.clone());
        let updated = canary.clone();
        drop(store);
        self.record(ClusterWrite::UpdateCanaryStatus(name.to_string()));
        Ok(updated)
    }
}
