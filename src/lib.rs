//! Capacity-aware progressive delivery for Kubernetes Deployments
//!
//! Keeps a primary workload in sync with a canary target, shifts traffic or
//! ready capacity between them and never leaves a side that receives traffic
//! without a running instance.

pub mod config;
pub mod controller;
pub mod crd;
pub mod router;
pub mod server;
