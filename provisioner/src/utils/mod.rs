//! Utils is the shared context and helpers used by every instance component
use std::{
    future::Future,
    sync::{Mutex, PoisonError},
    time::Duration,
};

#[cfg(test)]
pub mod fake_cluster;

use k8s_openapi::chrono::{DateTime, Utc};
use kube::{api::PostParams, client::Client};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use crate::{
    instance::{Error, InstanceConfig},
    FIELD_MANAGER,
};

/// Provisioner Context
pub struct Context<T, E, Rng> {
    /// Kube client
    pub k_client: Client,
    /// Source of the base workload and endpoint manifests
    pub templates: T,
    /// Runs commands inside instance pods
    pub exec: E,
    /// Random number generator backing the correlation ids
    pub rng: Mutex<Rng>,
    /// Instance naming, timeouts and policies
    pub config: InstanceConfig,
    /// Serializes edits of routing documents made through this context
    pub(crate) routing_lock: tokio::sync::Mutex<()>,
}

impl<T, E> Context<T, E, StdRng> {
    /// Create new context, seeding the id generator from the wall clock.
    pub fn new(k_client: Client, templates: T, exec: E, config: InstanceConfig) -> Self {
        Context {
            k_client,
            templates,
            exec,
            rng: Mutex::new(StdRng::seed_from_u64(clock_seed(&UtcClock))),
            config,
            routing_lock: tokio::sync::Mutex::new(()),
        }
    }
}

impl<T, E, Rng> Context<T, E, Rng> {
    /// Run a cluster API call bounded by the configured API timeout.
    ///
    /// The outer result reports expiry of the timeout, the inner one is the API response
    /// so callers can match on the kube error kinds they care about.
    pub(crate) async fn call<F, R>(
        &self,
        operation: &'static str,
        resource: &str,
        request: F,
    ) -> Result<Result<R, kube::Error>, Error>
    where
        F: Future<Output = Result<R, kube::Error>>,
    {
        tokio::time::timeout(self.config.api_timeout, request)
            .await
            .map_err(|_| Error::Timeout {
                operation,
                resource: resource.to_owned(),
                after: self.config.api_timeout,
            })
    }

    /// Draw the next value of the generator.
    pub(crate) fn with_rng<O>(&self, f: impl FnOnce(&mut Rng) -> O) -> O
    where
        Rng: RngCore,
    {
        // A panic while drawing cannot leave the generator in an invalid state.
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }
}

/// Provides the current time.
pub trait Clock {
    /// Report the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Provides the current time using real time.
pub struct UtcClock;
impl Clock for UtcClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Seed for the id generator derived from the current time.
pub fn clock_seed(clock: &impl Clock) -> u64 {
    let now = clock.now();
    now.timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros()) as u64
}

/// Parameters for create and replace calls.
pub fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_owned()),
        ..Default::default()
    }
}

/// Reports whether the API server answered that the resource does not exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "NotFound" || resp.code == 404)
}

/// Reports whether the API server rejected a write made against a stale version.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "Conflict" || resp.code == 409)
}

/// Reports whether the API server refused to create a resource whose name is taken.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.reason == "AlreadyExists")
}

/// Fixed wait used before polling or reading back freshly created state.
pub async fn settle(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await
    }
}
