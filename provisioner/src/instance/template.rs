//! Base manifests for the workload and endpoint, stamped with a correlation id.
use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use rand::RngCore;
use tracing::debug;

use crate::{
    instance::{CorrelationId, Error, ExecChannel, InstanceConfig},
    labels::{instance_labels_extend, selects, NUMBER_LABEL},
    utils::Context,
};

/// The two templated resources of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceKind {
    /// Deployment running the code-server pod
    Workload,
    /// Service fronting the workload
    Endpoint,
}

impl ResourceKind {
    /// Kind specific part of the resource name.
    pub fn suffix(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "deployment",
            ResourceKind::Endpoint => "service",
        }
    }

    /// File holding the base manifest of the kind.
    pub fn template_file(&self) -> &'static str {
        match self {
            ResourceKind::Workload => "code-server-deployment.yaml",
            ResourceKind::Endpoint => "code-server-svc.yaml",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Workload => write!(f, "workload"),
            ResourceKind::Endpoint => write!(f, "endpoint"),
        }
    }
}

/// Define where the base manifests come from.
#[async_trait]
pub trait TemplateStore {
    /// Load the raw YAML manifest of the kind.
    async fn load(&self, kind: ResourceKind) -> Result<String>;
}

/// Reads base manifests from a directory.
pub struct FileTemplateStore {
    dir: PathBuf,
}

impl FileTemplateStore {
    /// Create a store reading `code-server-deployment.yaml` and `code-server-svc.yaml` from dir.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TemplateStore for FileTemplateStore {
    async fn load(&self, kind: ResourceKind) -> Result<String> {
        let path = self.dir.join(kind.template_file());
        tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))
    }
}

/// A rendered resource, ready to be submitted.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceSpec {
    /// Rendered Deployment
    Workload(Deployment),
    /// Rendered Service
    Endpoint(Service),
}

async fn load(
    cx: &Context<impl TemplateStore, impl ExecChannel, impl RngCore>,
    kind: ResourceKind,
) -> Result<String, Error> {
    cx.templates
        .load(kind)
        .await
        .map_err(|source| Error::TemplateLoad {
            resource: kind.template_file().to_owned(),
            source,
        })
}

/// Load the workload template and stamp the id and namespace into it.
pub async fn render_workload(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    id: CorrelationId,
    ns: &str,
) -> Result<Deployment, Error> {
    let raw = load(cx.as_ref(), ResourceKind::Workload).await?;
    let deployment = stamp_workload(&cx.config, &raw, id, ns)?;
    debug!(id, ns, "rendered workload");
    Ok(deployment)
}

/// Load the endpoint template and stamp the id and namespace into it.
pub async fn render_endpoint(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    id: CorrelationId,
    ns: &str,
) -> Result<Service, Error> {
    let raw = load(cx.as_ref(), ResourceKind::Endpoint).await?;
    let service = stamp_endpoint(&cx.config, &raw, id, ns)?;
    debug!(id, ns, "rendered endpoint");
    Ok(service)
}

/// Load the template of the kind and stamp the id and namespace into it.
pub async fn render(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    kind: ResourceKind,
    id: CorrelationId,
    ns: &str,
) -> Result<ResourceSpec, Error> {
    Ok(match kind {
        ResourceKind::Workload => ResourceSpec::Workload(render_workload(cx, id, ns).await?),
        ResourceKind::Endpoint => ResourceSpec::Endpoint(render_endpoint(cx, id, ns).await?),
    })
}

/// Render both resources of an instance and check the endpoint selects the workload pods.
pub async fn render_instance(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    id: CorrelationId,
    ns: &str,
) -> Result<(Deployment, Service), Error> {
    let workload = render_workload(cx.clone(), id, ns).await?;
    let endpoint = render_endpoint(cx.clone(), id, ns).await?;
    check_endpoint_selects_workload(&cx.config, id, &workload, &endpoint)?;
    Ok((workload, endpoint))
}

fn parse<K: serde::de::DeserializeOwned>(raw: &str, kind: ResourceKind) -> Result<K, Error> {
    serde_yaml::from_str(raw).map_err(|source| Error::TemplateLoad {
        resource: kind.template_file().to_owned(),
        source: source.into(),
    })
}

fn shape_error(resource: &str, reason: &str) -> Error {
    Error::TemplateShape {
        resource: resource.to_owned(),
        reason: reason.to_owned(),
    }
}

/// Stamp the id into a Deployment manifest.
///
/// The metadata labels, selector and pod template labels all receive `number=<id>` and
/// the managed labels, so the Deployment only owns the pods of its own instance.
pub fn stamp_workload(
    config: &InstanceConfig,
    raw: &str,
    id: CorrelationId,
    ns: &str,
) -> Result<Deployment, Error> {
    let mut deployment: Deployment = parse(raw, ResourceKind::Workload)?;
    let name = config.resource_name(ResourceKind::Workload, id);

    let labels = deployment
        .metadata
        .labels
        .take()
        .ok_or_else(|| shape_error(&name, "metadata.labels missing"))?;
    deployment.metadata.name = Some(name.clone());
    deployment.metadata.namespace = Some(ns.to_owned());
    deployment.metadata.labels = Some(instance_labels_extend(labels, id));

    let spec = deployment
        .spec
        .as_mut()
        .ok_or_else(|| shape_error(&name, "spec missing"))?;
    let match_labels = spec
        .selector
        .match_labels
        .as_mut()
        .ok_or_else(|| shape_error(&name, "spec.selector.matchLabels missing"))?;
    match_labels.insert(NUMBER_LABEL.to_owned(), id.to_string());
    let pod_metadata = spec
        .template
        .metadata
        .as_mut()
        .ok_or_else(|| shape_error(&name, "spec.template.metadata missing"))?;
    let pod_labels = pod_metadata
        .labels
        .take()
        .ok_or_else(|| shape_error(&name, "spec.template.metadata.labels missing"))?;
    let pod_labels = instance_labels_extend(pod_labels, id);
    if !selects(match_labels, &pod_labels) {
        return Err(shape_error(
            &name,
            "spec.selector does not match the pod template labels",
        ));
    }
    pod_metadata.labels = Some(pod_labels);
    Ok(deployment)
}

/// Stamp the id into a Service manifest.
pub fn stamp_endpoint(
    config: &InstanceConfig,
    raw: &str,
    id: CorrelationId,
    ns: &str,
) -> Result<Service, Error> {
    let mut service: Service = parse(raw, ResourceKind::Endpoint)?;
    let name = config.resource_name(ResourceKind::Endpoint, id);

    let labels = service
        .metadata
        .labels
        .take()
        .ok_or_else(|| shape_error(&name, "metadata.labels missing"))?;
    service.metadata.name = Some(name.clone());
    service.metadata.namespace = Some(ns.to_owned());
    service.metadata.labels = Some(instance_labels_extend(labels, id));

    let selector = service
        .spec
        .as_mut()
        .and_then(|spec| spec.selector.as_mut())
        .ok_or_else(|| shape_error(&name, "spec.selector missing"))?;
    selector.insert(NUMBER_LABEL.to_owned(), id.to_string());
    Ok(service)
}

/// Check the invariant that routes traffic to the right pods: every selector entry of the
/// endpoint is a label of the workload's pods, including `number=<id>`.
pub fn check_endpoint_selects_workload(
    config: &InstanceConfig,
    id: CorrelationId,
    workload: &Deployment,
    endpoint: &Service,
) -> Result<(), Error> {
    let name = config.resource_name(ResourceKind::Endpoint, id);
    let pod_labels = workload
        .spec
        .as_ref()
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|metadata| metadata.labels.as_ref())
        .ok_or_else(|| shape_error(&name, "workload has no pod labels"))?;
    let selector = endpoint
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .ok_or_else(|| shape_error(&name, "spec.selector missing"))?;
    if selector.get(NUMBER_LABEL) != Some(&id.to_string()) {
        return Err(shape_error(&name, "spec.selector is not stamped with the id"));
    }
    if !selects(selector, pod_labels) {
        return Err(shape_error(
            &name,
            "spec.selector does not match the workload pod labels",
        ));
    }
    Ok(())
}
