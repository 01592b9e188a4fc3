//! Provisions and tears down per-request code-server instances on Kubernetes.
//!
//! An instance is a Deployment, a Service fronting it and one rule of a shared Ingress,
//! all correlated by a small integer id.
#![warn(missing_docs)]

/// Instance lifecycle: allocation, templating, provisioning, routing and inventory.
pub mod instance;
/// Labels module for managing resource labels.
pub mod labels;
/// Utils module for the shared context and helpers.
pub mod utils;

/// Field manager recorded on every write made to the cluster.
const FIELD_MANAGER: &str = "ethernetes";
