pub mod clock;
pub mod cluster;
pub mod config_tracker;
pub mod deployer;
pub mod phase;
pub mod readiness;
pub mod reconcile;
pub mod strategies;
pub mod weight;

#[cfg(test)]
pub(crate) mod fixtures;

pub use reconcile::{error_policy, reconcile, Context, ReconcileError};
