use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{DeleteParams, PropagationPolicy},
    Api, ResourceExt,
};
use rand::RngCore;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::{
    instance::{Error, ExecChannel, TemplateStore},
    utils::{is_already_exists, is_not_found, post_params, settle, Context},
};

const CREATE_WORKLOAD: &str = "create workload";
const DELETE_WORKLOAD: &str = "delete workload";

/// Addresses a created workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    /// Deployment name
    pub name: String,
    /// Deployment namespace
    pub namespace: String,
}

/// Submit a rendered Deployment.
///
/// A Deployment of the same name means the id is already in use, reported as
/// [`Error::IdInUse`].
pub async fn create_workload(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    spec: Deployment,
) -> Result<WorkloadHandle, Error> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    let name = spec.name_any();

    let created = cx
        .call(
            CREATE_WORKLOAD,
            &name,
            deployments.create(&post_params(), &spec),
        )
        .await?
        .map_err(|source| {
            if is_already_exists(&source) {
                Error::IdInUse {
                    operation: CREATE_WORKLOAD,
                    resource: name.clone(),
                }
            } else {
                Error::kube(CREATE_WORKLOAD, &name, source)
            }
        })?;
    info!(name, ns, "workload created");
    Ok(WorkloadHandle {
        name: created.name_any(),
        namespace: ns.to_owned(),
    })
}

/// Delete a Deployment and wait until its pods are gone.
///
/// Deletion propagates in the foreground: the Deployment stays visible, marked for
/// deletion, until the garbage collector has removed its ReplicaSets and pods.
pub async fn delete_workload(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    name: &str,
) -> Result<(), Error> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    let params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };

    match cx
        .call(DELETE_WORKLOAD, name, deployments.delete(name, &params))
        .await?
    {
        // The API server answered with a Status, nothing is left to wait for.
        Ok(deleted) if deleted.is_right() => {
            info!(name, ns, "workload deleted");
            return Ok(());
        }
        Ok(_) => debug!(name, ns, "workload marked for deletion"),
        Err(err) if is_not_found(&err) => {
            return Err(Error::NotFound {
                operation: DELETE_WORKLOAD,
                resource: name.to_owned(),
            })
        }
        Err(source) => return Err(Error::kube(DELETE_WORKLOAD, name, source)),
    }

    let started = Instant::now();
    loop {
        let remaining = cx
            .call(DELETE_WORKLOAD, name, deployments.get_opt(name))
            .await?
            .map_err(|source| Error::kube(DELETE_WORKLOAD, name, source))?;
        if remaining.is_none() {
            info!(name, ns, "workload deleted");
            return Ok(());
        }
        let waited = started.elapsed();
        if waited >= cx.config.cascade_timeout {
            return Err(Error::Cascade {
                operation: DELETE_WORKLOAD,
                resource: name.to_owned(),
                waited,
            });
        }
        trace!(name, ?waited, "waiting for dependents to be removed");
        settle(cx.config.cascade_poll).await;
    }
}
