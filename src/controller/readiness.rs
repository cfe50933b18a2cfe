//! Deployment readiness checks
//!
//! A Deployment is ready once its latest generation is fully rolled out:
//! observed generation caught up, every desired replica updated, no old
//! replicas left and all updated replicas available.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use thiserror::Error;

/// Deployment is not ready yet
///
/// `retriable` is false once waiting longer cannot help: the progress
/// deadline was exceeded, or pods have been unavailable past the deadline.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("deployment {name}: {message}")]
pub struct ReadinessError {
    pub name: String,
    pub message: String,
    pub retriable: bool,
}

pub fn check_deployment_ready(
    deployment: &Deployment,
    deadline_seconds: i32,
    now: DateTime<Utc>,
) -> Result<(), ReadinessError> {
    let name = deployment.name_any();
    let not_ready = |message: String, retriable: bool| ReadinessError {
        name: name.clone(),
        message,
        retriable,
    };

    let status = deployment.status.clone().unwrap_or_default();
    let generation = deployment.metadata.generation.unwrap_or(0);
    if generation > status.observed_generation.unwrap_or(0) {
        return Err(not_ready(
            "waiting for rollout to finish: observed generation is behind the desired generation"
                .to_string(),
            true,
        ));
    }

    let progressing = condition(&status, "Progressing");
    if progressing.and_then(|c| c.reason.as_deref()) == Some("ProgressDeadlineExceeded") {
        return Err(not_ready(
            "exceeded its progress deadline".to_string(),
            false,
        ));
    }

    let mut retriable = true;
    if progressing.is_some() {
        if let Some(available) = condition(&status, "Available") {
            let stuck = available.status == "False"
                && available.reason.as_deref() == Some("MinimumReplicasUnavailable");
            if stuck {
                if let Some(since) = available.last_update_time.as_ref().and_then(to_utc) {
                    let deadline = since + chrono::Duration::seconds(i64::from(deadline_seconds));
                    retriable = deadline >= now;
                }
            }
        }
    }

    let desired = deployment.spec.as_ref().and_then(|s| s.replicas);
    let replicas = status.replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);

    if let Some(desired) = desired {
        if updated < desired {
            return Err(not_ready(
                format!(
                    "waiting for rollout to finish: {updated} out of {desired} new replicas have been updated"
                ),
                retriable,
            ));
        }
    }
    if replicas > updated {
        return Err(not_ready(
            format!(
                "waiting for rollout to finish: {} old replicas are pending termination",
                replicas - updated
            ),
            retriable,
        ));
    }
    if available < updated {
        return Err(not_ready(
            format!(
                "waiting for rollout to finish: {available} of {updated} updated replicas are available"
            ),
            retriable,
        ));
    }

    Ok(())
}

fn condition<'a>(status: &'a DeploymentStatus, kind: &str) -> Option<&'a DeploymentCondition> {
    status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == kind))
}

/// Read a meta/v1 Time through its RFC3339 wire form
fn to_utc(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
