//! Create and tear down whole instances.
//!
//! Creation walks `Allocated -> WorkloadCreated -> EndpointCreated -> RuleAdded`, teardown
//! walks `RuleRemoved -> EndpointRemoved -> WorkloadRemoved`. A failed creation reports the
//! id and the last state it reached so the instance can still be deleted by id.
use std::sync::Arc;

use opentelemetry::{global, KeyValue};
use rand::RngCore;
use tracing::{debug, error, info, warn};

use crate::{
    instance::{
        allocate,
        endpoint::{create_endpoint, delete_endpoint},
        routing::{add_rule, remove_rule},
        template::render_instance,
        workload::{create_workload, delete_workload},
        CleanupPolicy, CorrelationId, EndpointHandle, Error, ExecChannel, ResourceKind,
        TemplateStore, WorkloadHandle,
    },
    labels::instance_selector,
    utils::{settle, Context},
};

const READ_CONFIG: &str = "read config";

/// Progress of instance creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceState {
    /// A correlation id was drawn
    Allocated,
    /// The Deployment exists
    WorkloadCreated,
    /// The Service exists
    EndpointCreated,
    /// The host is routed to the Service
    RuleAdded,
}

impl InstanceState {
    fn next(self) -> Self {
        match self {
            InstanceState::Allocated => InstanceState::WorkloadCreated,
            InstanceState::WorkloadCreated => InstanceState::EndpointCreated,
            InstanceState::EndpointCreated | InstanceState::RuleAdded => InstanceState::RuleAdded,
        }
    }
}

// The furthest state the cluster may be in. A step that timed out may still have been
// applied by the API server.
fn attempted(reached: Option<InstanceState>, source: &Error) -> Option<InstanceState> {
    match source {
        Error::Timeout { .. } => reached.map(InstanceState::next),
        _ => reached,
    }
}

/// Progress of instance teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TeardownState {
    /// No rule routes the host anymore
    RuleRemoved,
    /// The Service is gone
    EndpointRemoved,
    /// The Deployment and its pods are gone
    WorkloadRemoved,
}

/// A fully created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Correlation id shared by all resources of the instance
    pub id: CorrelationId,
    /// Namespace of the instance
    pub namespace: String,
    /// The Deployment
    pub workload: WorkloadHandle,
    /// The Service
    pub endpoint: EndpointHandle,
    /// Hostname routed to the Service
    pub host: String,
    /// code-server config read back out of the pod, when verification succeeded
    pub config: Option<String>,
}

/// Creation of an instance stopped before the host was routed.
#[derive(Debug, thiserror::Error)]
#[error(
    "create instance {} in {namespace} stopped {}: {source}",
    describe_id(.id),
    describe_reached(.reached)
)]
pub struct CreateError {
    /// Namespace the instance was created in
    pub namespace: String,
    /// Id drawn for the instance, if one was allocated
    ///
    /// When the source is [`Error::IdInUse`] the id belongs to another instance. Use
    /// [`CreateError::leaves_resources`] before deleting by this id.
    pub id: Option<CorrelationId>,
    /// Last state reached before the failure
    pub reached: Option<InstanceState>,
    /// Whether the created resources were removed again
    pub compensated: bool,
    /// The failure
    pub source: Error,
}

fn describe_id(id: &Option<CorrelationId>) -> String {
    id.map_or_else(|| "(no id)".to_owned(), |id| id.to_string())
}

fn describe_reached(reached: &Option<InstanceState>) -> String {
    match reached {
        Some(state) => format!("after {state:?}"),
        None => "before allocation".to_owned(),
    }
}

impl CreateError {
    /// Reports whether resources of this instance may still exist in the cluster.
    ///
    /// Only then is deleting by [`CreateError::id`] safe and useful.
    pub fn leaves_resources(&self) -> bool {
        !self.compensated
            && self.id.is_some()
            && attempted(self.reached, &self.source) >= Some(InstanceState::WorkloadCreated)
    }
}

/// Outcome of a single teardown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The resource existed and was removed
    Removed,
    /// The resource did not exist
    Absent,
}

/// Outcome of every teardown step of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    /// Correlation id of the deleted instance
    pub id: CorrelationId,
    /// Routing rule
    pub rule: StepOutcome,
    /// Service
    pub endpoint: StepOutcome,
    /// Deployment
    pub workload: StepOutcome,
}

fn count(name: &'static str, description: &'static str, ok: bool) {
    let meter = global::meter("ethernetes");
    let runs = meter.u64_counter(name).with_description(description).init();
    runs.add(
        1,
        &[KeyValue {
            key: "result".into(),
            value: if ok { "ok" } else { "err" }.into(),
        }],
    );
}

/// Create an instance in the namespace.
///
/// On failure the error carries the allocated id and the last state reached. Under
/// [`CleanupPolicy::Compensate`] the resources already created are deleted before
/// returning.
#[tracing::instrument(skip(cx))]
pub async fn create_instance(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
) -> Result<Instance, CreateError> {
    let result = create_instance_(cx, ns).await;
    count(
        "instance_create_count",
        "Number of instance creations",
        result.is_ok(),
    );
    result
}

#[derive(Debug, Default)]
struct Progress {
    id: Option<CorrelationId>,
    reached: Option<InstanceState>,
}

impl Progress {
    fn reach(&mut self, state: InstanceState) {
        debug!(id = self.id, ?state, "instance progressed");
        self.reached = Some(state);
    }
}

async fn create_instance_(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
) -> Result<Instance, CreateError> {
    let mut progress = Progress::default();
    let source = match run_create(cx.clone(), ns, &mut progress).await {
        Ok(instance) => {
            info!(id = instance.id, host = instance.host, "instance created");
            return Ok(instance);
        }
        Err(err) => err,
    };
    error!(?progress, %source, "instance creation failed");

    let compensated = match (cx.config.cleanup, progress.id) {
        (CleanupPolicy::Compensate, Some(id)) => {
            compensate(cx, ns, id, attempted(progress.reached, &source)).await
        }
        (CleanupPolicy::Compensate, None) => true,
        (CleanupPolicy::Manual, _) => false,
    };
    Err(CreateError {
        namespace: ns.to_owned(),
        id: progress.id,
        reached: progress.reached,
        compensated,
        source,
    })
}

async fn run_create(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    progress: &mut Progress,
) -> Result<Instance, Error> {
    let id = allocate(cx.clone(), ns).await?;
    progress.id = Some(id);
    progress.reach(InstanceState::Allocated);

    let (workload_spec, endpoint_spec) = render_instance(cx.clone(), id, ns).await?;
    let workload = create_workload(cx.clone(), ns, workload_spec).await?;
    progress.reach(InstanceState::WorkloadCreated);

    let endpoint = create_endpoint(cx.clone(), ns, endpoint_spec, id).await?;
    progress.reach(InstanceState::EndpointCreated);

    let host = cx.config.host(id);
    add_rule(
        cx.clone(),
        &cx.config.routing_document,
        ns,
        &host,
        &endpoint.name,
    )
    .await?;
    progress.reach(InstanceState::RuleAdded);

    let config = if cx.config.verify {
        settle(cx.config.settle_delay).await;
        match read_config(cx.clone(), ns, id).await {
            Ok(config) => Some(config),
            Err(err) => {
                warn!(id, %err, "config read-back failed");
                None
            }
        }
    } else {
        None
    };

    Ok(Instance {
        id,
        namespace: ns.to_owned(),
        workload,
        endpoint,
        host,
        config,
    })
}

// Undo the steps that may have been applied, newest first. Reports whether everything
// was undone.
async fn compensate(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    id: CorrelationId,
    attempted: Option<InstanceState>,
) -> bool {
    let mut undone = true;
    if attempted >= Some(InstanceState::RuleAdded) {
        let host = cx.config.host(id);
        let step = remove_rule(cx.clone(), &cx.config.routing_document, ns, &host)
            .await
            .map(|_| ());
        undone &= undo(id, "rule", step);
    }
    if attempted >= Some(InstanceState::EndpointCreated) {
        let name = cx.config.resource_name(ResourceKind::Endpoint, id);
        undone &= undo(id, "endpoint", delete_endpoint(cx.clone(), ns, &name).await);
    }
    if attempted >= Some(InstanceState::WorkloadCreated) {
        let name = cx.config.resource_name(ResourceKind::Workload, id);
        undone &= undo(id, "workload", delete_workload(cx.clone(), ns, &name).await);
    }
    if undone {
        info!(id, ?attempted, "partially created instance removed");
    }
    undone
}

fn undo(id: CorrelationId, resource: &'static str, step: Result<(), Error>) -> bool {
    match step {
        Ok(()) => true,
        Err(err) if err.is_absent() => true,
        Err(err) => {
            warn!(id, resource, %err, "compensation left a resource behind");
            false
        }
    }
}

fn tolerate_absent(step: Result<(), Error>) -> Result<StepOutcome, Error> {
    match step {
        Ok(()) => Ok(StepOutcome::Removed),
        Err(err) if err.is_absent() => {
            warn!(%err, "already absent, continuing teardown");
            Ok(StepOutcome::Absent)
        }
        Err(err) => Err(err),
    }
}

/// Delete the instance with the id from the namespace.
///
/// Steps whose resource is already gone are reported as [`StepOutcome::Absent`] and the
/// teardown continues. Any other failure aborts the teardown.
#[tracing::instrument(skip(cx))]
pub async fn delete_instance(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    id: CorrelationId,
) -> Result<DeleteReport, Error> {
    let result = delete_instance_(cx, ns, id).await;
    count(
        "instance_delete_count",
        "Number of instance deletions",
        result.is_ok(),
    );
    result
}

async fn delete_instance_(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    id: CorrelationId,
) -> Result<DeleteReport, Error> {
    let host = cx.config.host(id);
    let rule = tolerate_absent(
        remove_rule(cx.clone(), &cx.config.routing_document, ns, &host)
            .await
            .map(|_| ()),
    )?;
    debug!(id, state = ?TeardownState::RuleRemoved, ?rule, "teardown progressed");

    let endpoint_name = cx.config.resource_name(ResourceKind::Endpoint, id);
    let endpoint = tolerate_absent(delete_endpoint(cx.clone(), ns, &endpoint_name).await)?;
    debug!(id, state = ?TeardownState::EndpointRemoved, ?endpoint, "teardown progressed");

    let workload_name = cx.config.resource_name(ResourceKind::Workload, id);
    let workload = tolerate_absent(delete_workload(cx.clone(), ns, &workload_name).await)?;
    debug!(id, state = ?TeardownState::WorkloadRemoved, ?workload, "teardown progressed");

    info!(id, host, "instance deleted");
    Ok(DeleteReport {
        id,
        rule,
        endpoint,
        workload,
    })
}

/// Read the code-server config file out of the instance's pod.
pub async fn read_config(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    id: CorrelationId,
) -> Result<String, Error> {
    let selector = instance_selector(id);
    let command = vec!["cat".to_owned(), cx.config.config_path.clone()];
    let output = tokio::time::timeout(
        cx.config.api_timeout,
        cx.exec.exec(ns.to_owned(), selector.clone(), command),
    )
    .await
    .map_err(|_| Error::Timeout {
        operation: READ_CONFIG,
        resource: selector.clone(),
        after: cx.config.api_timeout,
    })?
    .map_err(|source| Error::Exec {
        resource: selector,
        source,
    })?;
    debug!(id, pod = output.pod, "config read back");
    Ok(output.stdout)
}
