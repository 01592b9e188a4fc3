//! An instance is a Deployment, a Service and an Ingress rule sharing one correlation id.
//!
//! Nothing about an instance is stored locally, every operation reconstructs it from
//! the cluster using the names and labels derived from the id.

pub mod allocator;
mod config;
pub mod endpoint;
mod error;
pub mod exec;
pub mod inventory;
pub mod orchestrator;
pub mod routing;
pub mod template;
pub mod workload;

pub use allocator::{allocate, CorrelationId, ID_SPACE};
pub use config::{CleanupPolicy, InstanceConfig};
pub use endpoint::EndpointHandle;
pub use error::Error;
pub use exec::{ExecChannel, ExecOutput, KubeExecChannel};
pub use inventory::{
    collect_workloads, inventory, list_workloads, Inventory, PodSummary, WorkloadSummary,
};
pub use orchestrator::{
    create_instance, delete_instance, read_config, CreateError, DeleteReport, Instance,
    InstanceState, StepOutcome, TeardownState,
};
pub use template::{FileTemplateStore, ResourceKind, ResourceSpec, TemplateStore};
pub use workload::WorkloadHandle;
