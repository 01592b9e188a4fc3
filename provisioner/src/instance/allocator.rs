//! Correlation ids bind the resources of one instance together.
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::Api;
use rand::{Rng, RngCore};
use tracing::{debug, warn};

use crate::{
    instance::{Error, ExecChannel, ResourceKind, TemplateStore},
    utils::Context,
};

/// Identifies one instance. Rendered in decimal into names, labels and the hostname.
pub type CorrelationId = u32;

/// Ids are drawn from `0..ID_SPACE` so hostnames stay short and readable.
pub const ID_SPACE: CorrelationId = 1000;

const ALLOCATE: &str = "allocate";

/// Draw a candidate id without checking whether it is in use.
pub fn draw(rng: &mut impl RngCore) -> CorrelationId {
    rng.gen_range(0..ID_SPACE)
}

/// Allocate a correlation id for a new instance in the namespace.
///
/// With the collision guard enabled a candidate is only accepted when no workload
/// carries its name yet. Ids are not reserved, two concurrent allocations may still
/// settle on the same id; the second create then fails on the existing workload.
pub async fn allocate(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
) -> Result<CorrelationId, Error> {
    if !cx.config.collision_guard {
        let id = cx.with_rng(|rng| draw(rng));
        debug!(id, "allocated unchecked id");
        return Ok(id);
    }

    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    for attempt in 1..=cx.config.allocation_attempts {
        let id = cx.with_rng(|rng| draw(rng));
        let name = cx.config.resource_name(ResourceKind::Workload, id);
        let existing = cx
            .call(ALLOCATE, &name, deployments.get_opt(&name))
            .await?
            .map_err(|source| Error::kube(ALLOCATE, &name, source))?;
        if existing.is_none() {
            debug!(id, attempt, "allocated id");
            return Ok(id);
        }
        warn!(id, attempt, "id already in use, drawing again");
    }
    Err(Error::Allocation {
        namespace: ns.to_owned(),
        attempts: cx.config.allocation_attempts,
    })
}
