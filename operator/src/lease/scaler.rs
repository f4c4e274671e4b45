//! Thin wrapper over the orchestrator's scale subresource for a
//! `StatefulSet`-backed builder fleet.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::{
    Api, Client,
    api::{Patch, PatchParams},
    runtime::{WatchStreamExt, watcher},
};
use tokio::sync::Mutex;
use tokio_stream::StreamExt;

use crate::util::{Error, MANAGER_NAME};

/// Serializes read-modify-write access to a single `StatefulSet`'s replica
/// count, and can wait for the orchestrator to report enough ready
/// replicas after a scale-up.
pub struct Scaler {
    client: Client,
    namespace: String,
    name: String,
    watch_timeout: Duration,
    write_lock: Mutex<()>,
}

impl Scaler {
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>, watch_timeout: Duration) -> Self {
        Scaler {
            client,
            namespace: namespace.into(),
            name: name.into(),
            watch_timeout,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn current_replicas(&self) -> Result<i32, Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let scale = api.get_scale(&self.name).await?;
        Ok(scale.spec.and_then(|s| s.replicas).unwrap_or(0))
    }

    /// Applies a signed delta to the current replica count and, if the
    /// delta is positive, waits (bounded by `watch_timeout`) for
    /// `status.readyReplicas` to reach the new target. A negative delta
    /// returns as soon as the patch is accepted: the orchestrator deletes
    /// the highest-ordinal pod(s) asynchronously.
    pub async fn scale(&self, delta: i32) -> Result<i32, Error> {
        if delta == 0 {
            return self.current_replicas().await;
        }
        let _guard = self.write_lock.lock().await;
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let current = api.get_scale(&self.name).await?;
        let current_replicas = current.spec.and_then(|s| s.replicas).unwrap_or(0);
        let desired = (current_replicas + delta).max(0);

        let patch = serde_json::json!({
            "apiVersion": "autoscaling/v1",
            "kind": "Scale",
            "spec": { "replicas": desired },
        });
        let scale: Scale = api
            .patch_scale(&self.name, &PatchParams::apply(MANAGER_NAME).force(), &Patch::Apply(&patch))
            .await?;
        let applied = scale.spec.and_then(|s| s.replicas).unwrap_or(desired);

        if delta > 0 {
            self.wait_ready(applied).await?;
        }
        Ok(applied)
    }

    async fn wait_ready(&self, target: i32) -> Result<(), Error> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let field_selector = format!("metadata.name={}", self.name);
        let cfg = watcher::Config::default().fields(&field_selector);
        let mut stream = Box::pin(watcher(api, cfg).applied_objects());

        let deadline = tokio::time::Instant::now() + self.watch_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::NoCapacity(format!(
                    "statefulset '{}' did not reach {target} ready replicas in time",
                    self.name
                )));
            }
            match tokio::time::timeout(remaining, stream.next()).await {
                Ok(Some(Ok(sts))) => {
                    let ready = sts.status.as_ref().map(|s| s.ready_replicas.unwrap_or(0)).unwrap_or(0);
                    if ready >= target {
                        return Ok(());
                    }
                }
                Ok(Some(Err(e))) => return Err(Error::Transient(e.to_string())),
                Ok(None) => {
                    return Err(Error::Transient("statefulset watch stream ended".to_string()));
                }
                Err(_) => {
                    return Err(Error::NoCapacity(format!(
                        "statefulset '{}' did not reach {target} ready replicas in time",
                        self.name
                    )));
                }
            }
        }
    }
}
