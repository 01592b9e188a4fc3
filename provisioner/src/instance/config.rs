use std::time::Duration;

use crate::instance::{template::ResourceKind, CorrelationId};

/// What happens to the resources already created when instance creation aborts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum CleanupPolicy {
    /// Leave them in place, the caller deletes the instance using the reported id.
    #[default]
    Manual,
    /// Run the matching teardown steps before reporting the failure.
    Compensate,
}

// InstanceConfig defines which properties of the instance lifecycle can be customized.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Prefix of every resource name and of the routed hostname.
    pub prefix: String,
    /// Name of the shared Ingress holding one rule per instance.
    pub routing_document: String,
    /// Service port the routing rules forward to.
    pub backend_port: i32,
    /// Upper bound on every single cluster API call.
    pub api_timeout: Duration,
    /// How long a foreground deletion may take to remove dependents.
    pub cascade_timeout: Duration,
    /// Interval between checks for a finished foreground deletion.
    pub cascade_poll: Duration,
    /// Rereads and rewrites of the routing document after a conflicting write.
    pub conflict_retries: u32,
    /// Check that a drawn id is unused before accepting it.
    pub collision_guard: bool,
    /// Ids drawn before giving up when every candidate is in use.
    pub allocation_attempts: u32,
    /// Page size of workload listings.
    pub page_size: u32,
    /// Read the code-server config back out of the new pod.
    pub verify: bool,
    /// Wait before reading the config back.
    pub settle_delay: Duration,
    /// Path of the code-server config inside the pod.
    pub config_path: String,
    /// Policy for partially created instances.
    pub cleanup: CleanupPolicy,
}

// Define clear defaults for this config
impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            prefix: "code-server".to_owned(),
            routing_document: "myingress".to_owned(),
            backend_port: 80,
            api_timeout: Duration::from_secs(10),
            cascade_timeout: Duration::from_secs(60),
            cascade_poll: Duration::from_secs(1),
            conflict_retries: 3,
            collision_guard: true,
            allocation_attempts: 10,
            page_size: 100,
            verify: true,
            settle_delay: Duration::from_secs(5),
            config_path: "/home/coder/.config/code-server/config.yaml".to_owned(),
            cleanup: CleanupPolicy::Manual,
        }
    }
}

impl InstanceConfig {
    /// Name of the resource of the given kind for an instance, e.g. `code-server-deployment-7`.
    pub fn resource_name(&self, kind: ResourceKind, id: CorrelationId) -> String {
        format!("{}-{}-{id}", self.prefix, kind.suffix())
    }

    /// Hostname routed to an instance, e.g. `code-server-7`.
    pub fn host(&self, id: CorrelationId) -> String {
        format!("{}-{id}", self.prefix)
    }
}
