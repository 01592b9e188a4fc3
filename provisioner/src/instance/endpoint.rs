use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use kube::{api::DeleteParams, Api, ResourceExt};
use rand::RngCore;
use tracing::info;

use crate::{
    instance::{CorrelationId, Error, ExecChannel, TemplateStore},
    labels::NUMBER_LABEL,
    utils::{is_not_found, post_params, Context},
};

const CREATE_ENDPOINT: &str = "create endpoint";
const DELETE_ENDPOINT: &str = "delete endpoint";

/// Addresses a created endpoint. Its name is the backend of the instance's routing rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointHandle {
    /// Service name
    pub name: String,
    /// Service namespace
    pub namespace: String,
}

/// Submit a rendered Service for the instance with the given id.
pub async fn create_endpoint(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    spec: Service,
    id: CorrelationId,
) -> Result<EndpointHandle, Error> {
    let name = spec.name_any();
    let stamped = spec
        .spec
        .as_ref()
        .and_then(|spec| spec.selector.as_ref())
        .and_then(|selector| selector.get(NUMBER_LABEL))
        .is_some_and(|number| *number == id.to_string());
    if !stamped {
        return Err(Error::TemplateShape {
            resource: name,
            reason: format!("spec.selector does not select {NUMBER_LABEL}={id}"),
        });
    }

    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    let created = cx
        .call(CREATE_ENDPOINT, &name, services.create(&post_params(), &spec))
        .await?
        .map_err(|source| Error::kube(CREATE_ENDPOINT, &name, source))?;
    info!(name, ns, id, "endpoint created");
    Ok(EndpointHandle {
        name: created.name_any(),
        namespace: ns.to_owned(),
    })
}

/// Delete a Service.
pub async fn delete_endpoint(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    name: &str,
) -> Result<(), Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    match cx
        .call(
            DELETE_ENDPOINT,
            name,
            services.delete(name, &DeleteParams::default()),
        )
        .await?
    {
        Ok(_) => {
            info!(name, ns, "endpoint deleted");
            Ok(())
        }
        Err(err) if is_not_found(&err) => Err(Error::NotFound {
            operation: DELETE_ENDPOINT,
            resource: name.to_owned(),
        }),
        Err(source) => Err(Error::kube(DELETE_ENDPOINT, name, source)),
    }
}
