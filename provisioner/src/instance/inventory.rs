use std::{fmt::Debug, sync::Arc};

use futures::{stream, Stream, TryStreamExt};
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Pod, Service},
};
use kube::{api::ListParams, Api, ResourceExt};
use rand::RngCore;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{
    instance::{Error, ExecChannel, TemplateStore},
    labels::PROJECT_LABEL_SELECTOR,
    utils::Context,
};

const LIST_WORKLOADS: &str = "list workloads";
const LIST_ENDPOINTS: &str = "list endpoints";
const LIST_PODS: &str = "list pods";

/// A workload as reported by listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSummary {
    /// Deployment name
    pub name: String,
    /// Desired replica count
    pub replicas: i32,
}

impl From<Deployment> for WorkloadSummary {
    fn from(deployment: Deployment) -> Self {
        Self {
            name: deployment.name_any(),
            // The API server defaults an absent replica count to one.
            replicas: deployment
                .spec
                .and_then(|spec| spec.replicas)
                .unwrap_or(1),
        }
    }
}

/// A pod as reported by the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name
    pub name: String,
    /// Lifecycle phase, when reported
    pub phase: Option<String>,
}

impl From<Pod> for PodSummary {
    fn from(pod: Pod) -> Self {
        Self {
            name: pod.name_any(),
            phase: pod.status.and_then(|status| status.phase),
        }
    }
}

/// Everything ethernetes manages in a namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// Managed deployments
    pub workloads: Vec<WorkloadSummary>,
    /// Names of the managed services
    pub endpoints: Vec<String>,
    /// Managed pods
    pub pods: Vec<PodSummary>,
}

enum Page {
    First,
    Next(String),
    Done,
}

// Lazily pages through a collection, one request per page of `page_size` objects.
fn pages<K>(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    api: Api<K>,
    operation: &'static str,
    selector: String,
) -> impl Stream<Item = Result<K, Error>>
where
    K: Clone + DeserializeOwned + Debug,
{
    stream::try_unfold(Page::First, move |page| {
        let cx = cx.clone();
        let api = api.clone();
        let selector = selector.clone();
        async move {
            let mut params = ListParams::default().limit(cx.config.page_size);
            if !selector.is_empty() {
                params = params.labels(&selector);
            }
            match page {
                Page::Done => return Ok::<_, Error>(None),
                Page::First => {}
                Page::Next(token) => params = params.continue_token(&token),
            }
            let list = cx
                .call(operation, &selector, api.list(&params))
                .await?
                .map_err(|source| Error::kube(operation, &selector, source))?;
            let next = match list.metadata.continue_ {
                Some(token) if !token.is_empty() => Page::Next(token),
                _ => Page::Done,
            };
            debug!(operation, selector, items = list.items.len(), "listed page");
            let items = list.items.into_iter().map(Ok::<K, Error>);
            Ok(Some((stream::iter(items), next)))
        }
    })
    .try_flatten()
}

/// Stream the workloads in the namespace matching the label selector.
///
/// Nothing is requested until the stream is polled. Every call starts again from the
/// first page.
pub fn list_workloads(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    selector: &str,
) -> impl Stream<Item = Result<WorkloadSummary, Error>> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    pages(cx, deployments, LIST_WORKLOADS, selector.to_owned()).map_ok(WorkloadSummary::from)
}

/// Collect every workload in the namespace matching the label selector.
pub async fn collect_workloads(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
    selector: &str,
) -> Result<Vec<WorkloadSummary>, Error> {
    list_workloads(cx, ns, selector).try_collect().await
}

/// List the deployments, services and pods managed by ethernetes in the namespace.
pub async fn inventory(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    ns: &str,
) -> Result<Inventory, Error> {
    let services: Api<Service> = Api::namespaced(cx.k_client.clone(), ns);
    let pods: Api<Pod> = Api::namespaced(cx.k_client.clone(), ns);

    let workloads = collect_workloads(cx.clone(), ns, PROJECT_LABEL_SELECTOR).await?;
    let endpoints = pages(
        cx.clone(),
        services,
        LIST_ENDPOINTS,
        PROJECT_LABEL_SELECTOR.to_owned(),
    )
    .map_ok(|service| service.name_any())
    .try_collect()
    .await?;
    let pods = pages(cx, pods, LIST_PODS, PROJECT_LABEL_SELECTOR.to_owned())
        .map_ok(PodSummary::from)
        .try_collect()
        .await?;
    Ok(Inventory {
        workloads,
        endpoints,
        pods,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instance::InstanceConfig,
        utils::{
            fake_cluster::FakeCluster,
            test::{timeout_after_1s, workload_fixture},
        },
    };
    use futures::StreamExt;
    use serde_json::json;
    use unimock::Unimock;

    const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/default/deployments";

    fn page(ids: &[u32], continue_: Option<&str>) -> serde_json::Value {
        let items: Vec<Deployment> = ids.iter().map(|id| workload_fixture("default", *id)).collect();
        let mut metadata = json!({ "resourceVersion": "1" });
        if let Some(token) = continue_ {
            metadata["continue"] = json!(token);
        }
        json!({
            "apiVersion": "apps/v1",
            "kind": "DeploymentList",
            "metadata": metadata,
            "items": items,
        })
    }

    #[tokio::test]
    async fn follows_continue_tokens() {
        let (testctx, mut fakeserver) = Context::test_with(
            Unimock::new(()),
            InstanceConfig {
                page_size: 2,
                ..InstanceConfig::test()
            },
        );
        let mocksrv = tokio::spawn(async move {
            let first = fakeserver
                .handle_json("GET", DEPLOYMENTS, &page(&[1, 2], Some("next-page")))
                .await;
            assert_eq!(first.query_param("limit").as_deref(), Some("2"));
            assert_eq!(
                first.query_param("labelSelector").as_deref(),
                Some("project=ethernetes")
            );
            assert_eq!(first.query_param("continue"), None);
            let second = fakeserver
                .handle_json("GET", DEPLOYMENTS, &page(&[3], None))
                .await;
            assert_eq!(second.query_param("continue").as_deref(), Some("next-page"));
        });
        let workloads = collect_workloads(testctx, "default", "project=ethernetes")
            .await
            .unwrap();
        let names: Vec<&str> = workloads.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "code-server-deployment-1",
                "code-server-deployment-2",
                "code-server-deployment-3"
            ]
        );
        assert!(workloads.iter().all(|w| w.replicas == 1));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn nothing_is_requested_until_polled() {
        let (testctx, mut fakeserver) = Context::test(Unimock::new(()));
        let mut workloads = Box::pin(list_workloads(testctx, "default", "number=4"));
        let mocksrv = tokio::spawn(async move {
            let request = fakeserver
                .handle_json("GET", DEPLOYMENTS, &page(&[4], None))
                .await;
            assert_eq!(request.query_param("labelSelector").as_deref(), Some("number=4"));
        });
        let first = workloads.next().await.unwrap().unwrap();
        assert_eq!(first.name, "code-server-deployment-4");
        assert!(workloads.next().await.is_none());
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn listing_restarts_from_first_page() {
        let cluster = FakeCluster::default();
        for id in [3, 5, 8] {
            cluster.insert(
                "default",
                "deployments",
                serde_json::to_value(workload_fixture("default", id)).unwrap(),
            );
        }
        let cx = cluster.context(
            Unimock::new(()),
            InstanceConfig {
                page_size: 1,
                ..InstanceConfig::test()
            },
        );
        let first = collect_workloads(cx.clone(), "default", "").await.unwrap();
        let second = collect_workloads(cx, "default", "").await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
        let gets = cluster.requests().iter().filter(|(m, _)| m == "GET").count();
        assert_eq!(gets, 6);
    }

    #[tokio::test]
    async fn inventory_covers_managed_resources() {
        let cluster = FakeCluster::default();
        cluster.insert(
            "default",
            "deployments",
            serde_json::to_value(workload_fixture("default", 3)).unwrap(),
        );
        cluster.insert(
            "default",
            "services",
            json!({ "metadata": { "name": "code-server-service-3", "labels": { "project": "ethernetes", "number": "3" } } }),
        );
        cluster.insert(
            "default",
            "services",
            json!({ "metadata": { "name": "unrelated", "labels": { "app": "other" } } }),
        );
        cluster.insert(
            "default",
            "pods",
            json!({
                "metadata": { "name": "code-server-deployment-3-abc", "labels": { "project": "ethernetes" } },
                "status": { "phase": "Running" }
            }),
        );
        let cx = cluster.context(Unimock::new(()), InstanceConfig::test());
        let found = inventory(cx, "default").await.unwrap();
        assert_eq!(
            found,
            Inventory {
                workloads: vec![WorkloadSummary {
                    name: "code-server-deployment-3".to_owned(),
                    replicas: 1,
                }],
                endpoints: vec!["code-server-service-3".to_owned()],
                pods: vec![PodSummary {
                    name: "code-server-deployment-3-abc".to_owned(),
                    phase: Some("Running".to_owned()),
                }],
            }
        );
    }
}
