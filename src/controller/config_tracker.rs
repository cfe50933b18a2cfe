//! Propagation of ConfigMaps and Secrets from target to primary
//!
//! The tracker enumerates the config objects the target's pod template
//! references and creates primary-scoped copies (`<name>-primary`).
//! `apply_primary_configs` then rewrites a pod spec to point at those copies,
//! so the primary keeps running the promoted configuration even after the
//! target's config objects change.

use crate::crd::Canary;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigKind {
    ConfigMap,
    Secret,
}

/// A config object referenced by the target pod template
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ConfigRef {
    pub kind: ConfigKind,
    pub name: String,
}

impl ConfigRef {
    pub fn primary_name(&self) -> String {
        format!("{}-primary", self.name)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{kind:?} {name}.{namespace} not found")]
    NotFound {
        kind: ConfigKind,
        name: String,
        namespace: String,
    },

    #[error("copying {kind:?} {name}.{namespace} failed: {message}")]
    CopyFailed {
        kind: ConfigKind,
        name: String,
        namespace: String,
        message: String,
    },
}

#[async_trait]
pub trait ConfigTracker: Send + Sync {
    async fn get_target_configs(&self, canary: &Canary) -> Result<Vec<ConfigRef>, ConfigError>;

    async fn create_primary_configs(
        &self,
        canary: &Canary,
        refs: &[ConfigRef],
    ) -> Result<(), ConfigError>;

    /// Point every reference in `spec` that appears in `refs` at its primary copy
    fn apply_primary_configs(&self, spec: PodSpec, refs: &[ConfigRef]) -> PodSpec {
        rewrite_config_refs(spec, refs)
    }
}

/// Tracker for clusters where config propagation is disabled
pub struct NopTracker;

#[async_trait]
impl ConfigTracker for NopTracker {
    async fn get_target_configs(&self, _canary: &Canary) -> Result<Vec<ConfigRef>, ConfigError> {
        Ok(Vec::new())
    }

    async fn create_primary_configs(
        &self,
        _canary: &Canary,
        _refs: &[ConfigRef],
    ) -> Result<(), ConfigError> {
        Ok(())
    }
}

fn renamed(refs: &[ConfigRef], kind: ConfigKind, name: &str) -> Option<String> {
    refs.iter()
        .find(|r| r.kind == kind && r.name == name)
        .map(ConfigRef::primary_name)
}

fn rename_in_place(refs: &[ConfigRef], kind: ConfigKind, name: &mut String) {
    if let Some(primary) = renamed(refs, kind, name) {
        *name = primary;
    }
}

fn rewrite_container(refs: &[ConfigRef], container: &mut Container) {
    for source in container.env_from.iter_mut().flatten() {
        if let Some(cm) = source.config_map_ref.as_mut() {
            rename_in_place(refs, ConfigKind::ConfigMap, &mut cm.name);
        }
        if let Some(secret) = source.secret_ref.as_mut() {
            rename_in_place(refs, ConfigKind::Secret, &mut secret.name);
        }
    }
    for var in container.env.iter_mut().flatten() {
        let Some(from) = var.value_from.as_mut() else {
            continue;
        };
        if let Some(cm) = from.config_map_key_ref.as_mut() {
            rename_in_place(refs, ConfigKind::ConfigMap, &mut cm.name);
        }
        if let Some(secret) = from.secret_key_ref.as_mut() {
            rename_in_place(refs, ConfigKind::Secret, &mut secret.name);
        }
    }
}

pub fn rewrite_config_refs(mut spec: PodSpec, refs: &[ConfigRef]) -> PodSpec {
    if refs.is_empty() {
        return spec;
    }

    for volume in spec.volumes.iter_mut().flatten() {
        if let Some(cm) = volume.config_map.as_mut() {
            rename_in_place(refs, ConfigKind::ConfigMap, &mut cm.name);
        }
        if let Some(secret) = volume.secret.as_mut() {
            if let Some(name) = secret.secret_name.as_mut() {
                rename_in_place(refs, ConfigKind::Secret, name);
            }
        }
        if let Some(projected) = volume.projected.as_mut() {
            for source in projected.sources.iter_mut().flatten() {
                if let Some(cm) = source.config_map.as_mut() {
                    rename_in_place(refs, ConfigKind::ConfigMap, &mut cm.name);
                }
                if let Some(secret) = source.secret.as_mut() {
                    rename_in_place(refs, ConfigKind::Secret, &mut secret.name);
                }
            }
        }
    }

    for container in spec.containers.iter_mut() {
        rewrite_container(refs, container);
    }
    for container in spec.init_containers.iter_mut().flatten() {
        rewrite_container(refs, container);
    }

    spec
}

/// Tracker returning a fixed set of references and recording copies
#[cfg(test)]
#[derive(Default)]
pub struct MockTracker {
    pub refs: Vec<ConfigRef>,
    created: std::sync::Mutex<Vec<ConfigRef>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockTracker {
    pub fn with_refs(refs: Vec<ConfigRef>) -> Self {
        Self {
            refs,
            created: Default::default(),
        }
    }

    pub fn created(&self) -> Vec<ConfigRef> {
        self.created.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl ConfigTracker for MockTracker {
    async fn get_target_configs(&self, _canary: &Canary) -> Result<Vec<ConfigRef>, ConfigError> {
        Ok(self.refs.clone())
    }

    async fn create_primary_configs(
        &self,
        _canary: &Canary,
        refs: &[ConfigRef],
    ) -> Result<(), ConfigError> {
        self.created.lock().unwrap().extend_from_slice(refs);
        Ok(())
    }
}
