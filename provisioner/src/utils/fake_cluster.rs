//! In-memory API server for scenario tests that span many requests.
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use hyper::Body;
use kube::Client;
use rand::rngs::mock::StepRng;
use serde_json::{json, Value};

use crate::{
    instance::InstanceConfig,
    utils::{
        test::{error_body, respond, success_status, Request, StaticTemplates, ROUTING_TEMPLATE},
        Context,
    },
};

type Key = (String, String, String);

/// A failure to return instead of serving a matching request.
#[derive(Debug, Clone)]
struct Fault {
    method: String,
    plural: String,
    code: u16,
    reason: String,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    faults: VecDeque<Fault>,
    log: Vec<(String, String)>,
}

/// Namespaced object store speaking enough of the Kubernetes REST API for kube's `Api`.
///
/// Creating a deployment also creates one pod carrying its template labels, deleting it
/// removes that pod. Clones share the same store so several clients can race on it.
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

fn type_meta(plural: &str) -> (&'static str, &'static str) {
    match plural {
        "deployments" => ("apps/v1", "Deployment"),
        "services" => ("v1", "Service"),
        "pods" => ("v1", "Pod"),
        "ingresses" => ("networking.k8s.io/v1", "Ingress"),
        other => panic!("fake cluster does not serve {other}"),
    }
}

// Splits `/api/v1/namespaces/{ns}/{plural}[/{name}]` and the apis/{group} equivalent.
fn parse_path(path: &str) -> (String, String, Option<String>) {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let at = segments
        .iter()
        .position(|s| *s == "namespaces")
        .unwrap_or_else(|| panic!("fake cluster only serves namespaced paths, got {path}"));
    let ns = segments[at + 1].to_owned();
    let plural = segments[at + 2].to_owned();
    let name = segments.get(at + 3).map(|s| (*s).to_owned());
    (ns, plural, name)
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    serde_json::from_value(object["metadata"]["labels"].clone()).unwrap_or_default()
}

fn matches_selector(selector: Option<&str>, object: &Value) -> bool {
    let Some(selector) = selector.filter(|s| !s.is_empty()) else {
        return true;
    };
    let labels = labels_of(object);
    selector.split(',').all(|term| match term.split_once('=') {
        Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
        None => labels.contains_key(term),
    })
}

impl FakeCluster {
    /// Cluster holding an empty routing document `myingress` in the namespace.
    pub fn with_routing_document(ns: &str) -> Self {
        let cluster = Self::default();
        cluster.add_routing_document(ns);
        cluster
    }

    /// Store an empty routing document `myingress` in the namespace.
    pub fn add_routing_document(&self, ns: &str) {
        let document: Value =
            serde_yaml::from_str(ROUTING_TEMPLATE).expect("routing template should parse");
        self.insert(ns, "ingresses", document);
    }

    /// Store an object as if it had been created.
    pub fn insert(&self, ns: &str, plural: &str, mut object: Value) {
        let mut state = self.state.lock().unwrap();
        state.version += 1;
        let (api_version, kind) = type_meta(plural);
        object["apiVersion"] = json!(api_version);
        object["kind"] = json!(kind);
        object["metadata"]["namespace"] = json!(ns);
        object["metadata"]["resourceVersion"] = json!(state.version.to_string());
        let name = object["metadata"]["name"]
            .as_str()
            .expect("object should be named")
            .to_owned();
        state
            .objects
            .insert((ns.to_owned(), plural.to_owned(), name), object);
    }

    /// Fail the next request with the method on the resource type.
    pub fn fail_next(&self, method: &str, plural: &str, code: u16, reason: &str) {
        self.state.lock().unwrap().faults.push_back(Fault {
            method: method.to_owned(),
            plural: plural.to_owned(),
            code,
            reason: reason.to_owned(),
        });
    }

    pub fn get(&self, ns: &str, plural: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(ns.to_owned(), plural.to_owned(), name.to_owned()))
            .cloned()
    }

    /// Names of the stored objects of the type in the namespace.
    pub fn names(&self, ns: &str, plural: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .objects
            .keys()
            .filter(|(n, p, _)| n == ns && p == plural)
            .map(|(_, _, name)| name.clone())
            .collect()
    }

    /// Hosts of the rules in the routing document.
    pub fn hosts(&self, ns: &str, document: &str) -> Vec<String> {
        let Some(ingress) = self.get(ns, "ingresses", document) else {
            return vec![];
        };
        ingress["spec"]["rules"]
            .as_array()
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|rule| rule["host"].as_str().map(ToOwned::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Method and path of every request served so far.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().log.clone()
    }

    /// A kube client backed by this cluster. Must be called within a tokio runtime.
    pub fn client(&self) -> Client {
        let (mock_service, mut handle) =
            tower_test::mock::pair::<http::Request<Body>, http::Response<Body>>();
        let cluster = self.clone();
        tokio::spawn(async move {
            while let Some((request, send)) = handle.next_request().await {
                let request = Request::from_request(request)
                    .await
                    .expect("request should be readable");
                let (code, body) = cluster.serve(&request);
                respond(send, code, &body);
            }
        });
        Client::new(mock_service, "default")
    }

    /// A test context talking to this cluster through its own client.
    pub fn context<E>(
        &self,
        exec: E,
        config: InstanceConfig,
    ) -> Arc<Context<StaticTemplates, E, StepRng>> {
        Context::test_on(self.client(), StaticTemplates::default(), exec, config)
    }

    fn serve(&self, request: &Request) -> (u16, Value) {
        let (ns, plural, name) = parse_path(&request.path);
        let mut state = self.state.lock().unwrap();
        state
            .log
            .push((request.method.clone(), request.path.clone()));

        if let Some(at) = state
            .faults
            .iter()
            .position(|f| f.method == request.method && f.plural == plural)
        {
            let fault = state.faults.remove(at).expect("fault was found");
            return (fault.code, error_body(fault.code, &fault.reason));
        }

        let key = |name: &str| (ns.clone(), plural.clone(), name.to_owned());
        match (request.method.as_str(), name) {
            ("GET", Some(name)) => match state.objects.get(&key(&name)) {
                Some(object) => (200, object.clone()),
                None => (404, error_body(404, "NotFound")),
            },
            ("GET", None) => {
                let selector = request.query_param("labelSelector");
                let limit = request
                    .query_param("limit")
                    .and_then(|l| l.parse::<usize>().ok())
                    .unwrap_or(usize::MAX);
                let offset = request
                    .query_param("continue")
                    .and_then(|c| c.parse::<usize>().ok())
                    .unwrap_or(0);
                let matching: Vec<Value> = state
                    .objects
                    .iter()
                    .filter(|((n, p, _), object)| {
                        *n == ns && *p == plural && matches_selector(selector.as_deref(), object)
                    })
                    .map(|(_, object)| object.clone())
                    .collect();
                let end = offset.saturating_add(limit).min(matching.len());
                let items = matching.get(offset..end).unwrap_or_default().to_vec();
                let mut metadata = json!({ "resourceVersion": state.version.to_string() });
                if end < matching.len() {
                    metadata["continue"] = json!(end.to_string());
                }
                let (api_version, kind) = type_meta(&plural);
                (
                    200,
                    json!({
                        "apiVersion": api_version,
                        "kind": format!("{kind}List"),
                        "metadata": metadata,
                        "items": items,
                    }),
                )
            }
            ("POST", None) => {
                let name = request.body["metadata"]["name"]
                    .as_str()
                    .expect("created object should be named")
                    .to_owned();
                if state.objects.contains_key(&key(&name)) {
                    return (409, error_body(409, "AlreadyExists"));
                }
                drop(state);
                self.insert(&ns, &plural, request.body.clone());
                if plural == "deployments" {
                    let pod_labels = request.body["spec"]["template"]["metadata"]["labels"].clone();
                    self.insert(
                        &ns,
                        "pods",
                        json!({ "metadata": { "name": format!("{name}-pod"), "labels": pod_labels } }),
                    );
                }
                let created = self.get(&ns, &plural, &name).expect("object was just stored");
                (201, created)
            }
            ("PUT", Some(name)) => {
                let Some(current) = state.objects.get(&key(&name)) else {
                    return (404, error_body(404, "NotFound"));
                };
                if request.body["metadata"]["resourceVersion"] != current["metadata"]["resourceVersion"]
                {
                    return (409, error_body(409, "Conflict"));
                }
                drop(state);
                self.insert(&ns, &plural, request.body.clone());
                (200, self.get(&ns, &plural, &name).expect("object was just stored"))
            }
            ("DELETE", Some(name)) => {
                if state.objects.remove(&key(&name)).is_none() {
                    return (404, error_body(404, "NotFound"));
                }
                if plural == "deployments" {
                    state
                        .objects
                        .remove(&(ns.clone(), "pods".to_owned(), format!("{name}-pod")));
                }
                (200, success_status())
            }
            (method, name) => panic!("fake cluster cannot serve {method} {plural} {name:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::Api;

    #[tokio::test]
    async fn stale_replace_conflicts() {
        let cluster = FakeCluster::with_routing_document("default");
        let ingresses: Api<Ingress> = Api::namespaced(cluster.client(), "default");
        let first = ingresses.get("myingress").await.unwrap();
        let stale = first.clone();
        ingresses
            .replace("myingress", &Default::default(), &first)
            .await
            .unwrap();
        let err = ingresses
            .replace("myingress", &Default::default(), &stale)
            .await
            .unwrap_err();
        assert!(crate::utils::is_conflict(&err), "unexpected error: {err}");
    }
}
