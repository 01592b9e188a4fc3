//! Edits of the shared Ingress that routes one host to each instance.
//!
//! The document is read, edited and written back as a whole. Writes are conditional on
//! the resourceVersion that was read, so a concurrent writer in another process makes
//! the write fail with a conflict instead of silently dropping its rule. Conflicts are
//! retried on a fresh read up to `conflict_retries` times.
use std::sync::Arc;

use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, ServiceBackendPort,
};
use kube::Api;
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::{
    instance::{Error, ExecChannel, TemplateStore},
    utils::{is_conflict, post_params, Context},
};

const ADD_RULE: &str = "add rule";
const REMOVE_RULE: &str = "remove rule";

/// Hosts of every rule in the document, in document order.
pub fn rule_hosts(document: &Ingress) -> Vec<String> {
    document
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| rules.iter().filter_map(|rule| rule.host.clone()).collect())
        .unwrap_or_default()
}

fn rule(host: &str, endpoint: &str, port: i32) -> IngressRule {
    IngressRule {
        host: Some(host.to_owned()),
        http: Some(HTTPIngressRuleValue {
            paths: vec![HTTPIngressPath {
                path: Some("/".to_owned()),
                path_type: "Prefix".to_owned(),
                backend: IngressBackend {
                    service: Some(IngressServiceBackend {
                        name: endpoint.to_owned(),
                        port: Some(ServiceBackendPort {
                            number: Some(port),
                            ..Default::default()
                        }),
                    }),
                    ..Default::default()
                },
            }],
        }),
    }
}

/// Route `host` to the endpoint by appending a rule to the routing document.
///
/// A host that already has a rule is rejected without writing.
pub async fn add_rule(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    document: &str,
    ns: &str,
    host: &str,
    endpoint: &str,
) -> Result<Ingress, Error> {
    let port = cx.config.backend_port;
    let written = edit_document(cx, ADD_RULE, document, ns, |ingress| {
        if rule_hosts(ingress).iter().any(|h| h == host) {
            return Err(Error::DuplicateRule {
                operation: ADD_RULE,
                resource: document.to_owned(),
                host: host.to_owned(),
            });
        }
        ingress
            .spec
            .get_or_insert_with(Default::default)
            .rules
            .get_or_insert_with(Vec::new)
            .push(rule(host, endpoint, port));
        Ok(())
    })
    .await?;
    info!(document, ns, host, endpoint, "rule added");
    Ok(written)
}

/// Remove every rule routing `host` from the routing document.
///
/// When no rule matches nothing is written and [`Error::RuleNotFound`] is returned.
pub async fn remove_rule(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    document: &str,
    ns: &str,
    host: &str,
) -> Result<Ingress, Error> {
    let written = edit_document(cx, REMOVE_RULE, document, ns, |ingress| {
        let rules = ingress
            .spec
            .as_mut()
            .and_then(|spec| spec.rules.as_mut());
        let removed = match rules {
            Some(rules) => {
                let before = rules.len();
                rules.retain(|rule| rule.host.as_deref() != Some(host));
                before - rules.len()
            }
            None => 0,
        };
        if removed == 0 {
            return Err(Error::RuleNotFound {
                operation: REMOVE_RULE,
                resource: document.to_owned(),
                host: host.to_owned(),
            });
        }
        Ok(())
    })
    .await?;
    info!(document, ns, host, "rule removed");
    Ok(written)
}

async fn edit_document(
    cx: Arc<Context<impl TemplateStore, impl ExecChannel, impl RngCore>>,
    operation: &'static str,
    document: &str,
    ns: &str,
    edit: impl Fn(&mut Ingress) -> Result<(), Error>,
) -> Result<Ingress, Error> {
    // Edits from this process queue up here instead of conflicting on the server.
    let _guard = cx.routing_lock.lock().await;
    let ingresses: Api<Ingress> = Api::namespaced(cx.k_client.clone(), ns);

    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut ingress = cx
            .call(operation, document, ingresses.get_opt(document))
            .await?
            .map_err(|source| Error::kube(operation, document, source))?
            .ok_or_else(|| Error::DocumentNotFound {
                operation,
                resource: document.to_owned(),
            })?;
        edit(&mut ingress)?;

        match cx
            .call(
                operation,
                document,
                ingresses.replace(document, &post_params(), &ingress),
            )
            .await?
        {
            Ok(written) => {
                debug!(document, attempts, "routing document written");
                return Ok(written);
            }
            Err(err) if is_conflict(&err) && attempts <= cx.config.conflict_retries => {
                warn!(document, attempts, "routing document changed concurrently, retrying");
            }
            Err(source) if is_conflict(&source) => {
                return Err(Error::WriteConflict {
                    operation,
                    resource: document.to_owned(),
                    attempts,
                    source,
                })
            }
            Err(source) => return Err(Error::kube(operation, document, source)),
        }
    }
}
