use std::time::Duration;

/// Errors produced while provisioning or tearing down an instance.
///
/// Every variant names the operation and the resource it was acting on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No unused correlation id was found.
    #[error("allocate: no unused correlation id in namespace {namespace} after {attempts} attempts")]
    Allocation {
        /// Namespace the id was allocated for
        namespace: String,
        /// Number of ids drawn
        attempts: u32,
    },
    /// The base template could not be read or parsed.
    #[error("load template {resource}: {source}")]
    TemplateLoad {
        /// Template that failed to load
        resource: String,
        /// Underlying cause
        source: anyhow::Error,
    },
    /// The template lacks the labels or selectors an instance needs.
    #[error("render {resource}: {reason}")]
    TemplateShape {
        /// Resource being rendered
        resource: String,
        /// What is missing or inconsistent
        reason: String,
    },
    /// A workload named after the drawn id already exists, so the id belongs to another
    /// instance. Nothing was created under it.
    #[error("{operation} {resource}: id is held by another instance")]
    IdInUse {
        /// Operation that was attempted
        operation: &'static str,
        /// Resource name
        resource: String,
    },
    /// The resource does not exist.
    #[error("{operation} {resource}: not found")]
    NotFound {
        /// Operation that was attempted
        operation: &'static str,
        /// Resource name
        resource: String,
    },
    /// The resource is still present after its dependents were given time to go away.
    #[error("{operation} {resource}: dependents not torn down after {waited:?}")]
    Cascade {
        /// Operation that was attempted
        operation: &'static str,
        /// Resource name
        resource: String,
        /// How long the deletion was awaited
        waited: Duration,
    },
    /// The shared routing document does not exist.
    #[error("{operation}: routing document {resource} not found")]
    DocumentNotFound {
        /// Operation that was attempted
        operation: &'static str,
        /// Routing document name
        resource: String,
    },
    /// Writing the routing document back was rejected.
    #[error("{operation} {resource}: write rejected after {attempts} attempts: {source}")]
    WriteConflict {
        /// Operation that was attempted
        operation: &'static str,
        /// Routing document name
        resource: String,
        /// Number of writes attempted
        attempts: u32,
        /// Last rejection
        source: kube::Error,
    },
    /// The routing document has no rule for the host.
    #[error("{operation} {resource}: no rule for host {host}")]
    RuleNotFound {
        /// Operation that was attempted
        operation: &'static str,
        /// Routing document name
        resource: String,
        /// Host that was looked up
        host: String,
    },
    /// The routing document already has a rule for the host.
    #[error("{operation} {resource}: a rule for host {host} already exists")]
    DuplicateRule {
        /// Operation that was attempted
        operation: &'static str,
        /// Routing document name
        resource: String,
        /// Host that is already routed
        host: String,
    },
    /// The cluster API did not answer in time.
    #[error("{operation} {resource}: timed out after {after:?}")]
    Timeout {
        /// Operation that was attempted
        operation: &'static str,
        /// Resource name
        resource: String,
        /// Timeout that expired
        after: Duration,
    },
    /// Running a command inside an instance pod failed.
    #[error("exec in {resource}: {source}")]
    Exec {
        /// Pod selector
        resource: String,
        /// Underlying cause
        source: anyhow::Error,
    },
    /// Any other cluster API failure.
    #[error("{operation} {resource}: {source}")]
    Kube {
        /// Operation that was attempted
        operation: &'static str,
        /// Resource name
        resource: String,
        /// Kube error
        source: kube::Error,
    },
}

impl Error {
    pub(crate) fn kube(operation: &'static str, resource: &str, source: kube::Error) -> Self {
        Error::Kube {
            operation,
            resource: resource.to_owned(),
            source,
        }
    }

    /// Reports whether the error means the targeted resource is already gone.
    ///
    /// Teardown treats these as completed steps.
    pub fn is_absent(&self) -> bool {
        matches!(self, Error::NotFound { .. } | Error::RuleNotFound { .. })
    }

    /// Reports whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::WriteConflict { .. } | Error::IdInUse { .. }
        )
    }
}
