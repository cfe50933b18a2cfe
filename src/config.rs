//! Controller configuration
//!
//! Resolved once from environment variables at startup and passed explicitly
//! to the components that need it:
//! - KANARY_SELECTOR_LABELS: ordered candidate selector label keys (comma separated)
//! - KANARY_HALT_URL: URL of the manual-confirmation halt hook
//! - KANARY_HEALTH_PORT: port for health and metrics endpoints
//! - KANARY_REQUEUE_SECONDS: requeue interval between reconciliations
//! - KANARY_SERVICE_PORTS: extra `name=port` pairs exposed by reconciled services

use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_HALT_URL: &str = "http://localhost:9090/gate/halt";
pub const DEFAULT_SELECTOR_LABELS: [&str; 3] = ["app", "name", "app.kubernetes.io/name"];
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
pub const DEFAULT_REQUEUE_SECONDS: u64 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Candidate selector label keys, first match wins
    pub selector_labels: Vec<String>,
    pub halt_url: String,
    pub health_port: u16,
    pub requeue_interval: Duration,
    /// Additional service ports (name → port)
    pub service_ports: BTreeMap<String, i32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            selector_labels: DEFAULT_SELECTOR_LABELS
                .iter()
                .map(|l| l.to_string())
                .collect(),
            halt_url: DEFAULT_HALT_URL.to_string(),
            health_port: DEFAULT_HEALTH_PORT,
            requeue_interval: Duration::from_secs(DEFAULT_REQUEUE_SECONDS),
            service_ports: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    /// Build configuration from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup
    ///
    /// Unset, empty or malformed values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let selector_labels = lookup("KANARY_SELECTOR_LABELS")
            .map(|v| split_list(&v))
            .filter(|labels| !labels.is_empty())
            .unwrap_or(defaults.selector_labels);

        let halt_url = lookup("KANARY_HALT_URL")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.halt_url);

        let health_port = lookup("KANARY_HEALTH_PORT")
            .and_then(|v| v.trim().parse::<u16>().ok())
            .unwrap_or(defaults.health_port);

        let requeue_interval = lookup("KANARY_REQUEUE_SECONDS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.requeue_interval);

        let service_ports = lookup("KANARY_SERVICE_PORTS")
            .map(|v| parse_service_ports(&v))
            .unwrap_or_default();

        Self {
            selector_labels,
            halt_url,
            health_port,
            requeue_interval,
            service_ports,
        }
    }
}

/// Split a comma separated list, trimming entries and dropping empty ones
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name=port` pairs; malformed entries are skipped
fn parse_service_ports(value: &str) -> BTreeMap<String, i32> {
    split_list(value)
        .into_iter()
        .filter_map(|entry| {
            let (name, port) = entry.split_once('=')?;
            let port = port.trim().parse::<i32>().ok()?;
            (port > 0).then(|| (name.trim().to_string(), port))
        })
        .collect()
}
