//! Serialized, request-queued allocator that assigns builder pods to
//! callers, applies lease annotations as the authoritative lock, and
//! drives the background reap tick.

pub mod endpoints;
pub mod scaler;

#[cfg(test)]
mod mock_tests;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client, ResourceExt, api::ListParams};
use owo_colors::OwoColorize;
use tokio::sync::{Mutex, oneshot};
use tokio_util::sync::CancellationToken;

use crate::arbiter::{self, BuilderState, PodObservation, Readiness};
use crate::util::colors::{FG1, FG2};
use crate::util::patch::{self, EXPIRY_TIME_ANNOTATION, LEASED_BY_ANNOTATION, MANAGER_ID_ANNOTATION};
use crate::util::{Error, PROBE_INTERVAL};
use scaler::Scaler;

/// Everything the manager needs to know about the builder fleet's identity
/// in the cluster: how to list its pods, where its headless service lives,
/// and which port the build daemon listens on.
pub struct LeaseManagerConfig {
    pub namespace: String,
    pub label_selector: String,
    pub statefulset_name: String,
    pub service_name: String,
    pub port_name: String,
    pub daemon_port: u16,
    pub controller_id: String,
    pub max_idle: Duration,
    pub endpoint_watch_timeout: Duration,
    pub scale_watch_timeout: Duration,
}

struct QueuedRequest {
    owner_id: String,
    tx: oneshot::Sender<Result<String, Error>>,
}

struct Inner {
    client: Client,
    config: LeaseManagerConfig,
    scaler: Scaler,
    queue: Mutex<VecDeque<QueuedRequest>>,
    /// Serializes the list-candidate-then-apply-lease critical section
    /// across every satisfier and the release-path handoff. Listing may
    /// race freely; only the step that actually stamps a lease onto a pod
    /// needs to be single-flighted, since the same field-manager identity
    /// on every apply call means server-side-apply itself never reports a
    /// conflict between two of this controller's own racing satisfiers.
    apply_lock: Mutex<()>,
    closed: std::sync::atomic::AtomicBool,
    shutdown: CancellationToken,
}

/// The public lease allocator. Cheap to clone: internally `Arc`-backed.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<Inner>,
}

impl LeaseManager {
    pub fn new(client: Client, config: LeaseManagerConfig) -> Self {
        let scaler = Scaler::new(
            client.clone(),
            config.namespace.clone(),
            config.statefulset_name.clone(),
            config.scale_watch_timeout,
        );
        LeaseManager {
            inner: Arc::new(Inner {
                client,
                config,
                scaler,
                queue: Mutex::new(VecDeque::new()),
                apply_lock: Mutex::new(()),
                closed: std::sync::atomic::AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Acquires an exclusive, address-resolved handle to a builder pod.
    /// Honors `ctx`: if it cancels before a pod is assigned, the queued
    /// request is removed (best-effort) and `Error::Cancelled` is returned.
    pub async fn acquire(&self, ctx: &CancellationToken, owner_id: &str) -> Result<String, Error> {
        if self.inner.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::Transient("lease manager is closed".to_string()));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut queue = self.inner.queue.lock().await;
            queue.push_back(QueuedRequest {
                owner_id: owner_id.to_string(),
                tx,
            });
        }

        self.drive_queue().await;

        tokio::select! {
            _ = ctx.cancelled() => {
                let mut queue = self.inner.queue.lock().await;
                queue.retain(|r| r.owner_id != owner_id);
                Err(Error::Cancelled)
            }
            _ = self.inner.shutdown.cancelled() => Err(Error::Transient("lease manager is closed".to_string())),
            result = rx => result.unwrap_or(Err(Error::Transient("satisfier dropped the request".to_string()))),
        }
    }

    /// Releases a previously acquired pod. If other requests are queued,
    /// the pod is handed off directly to the head of the queue instead of
    /// reverting to an idle, expiry-bearing state.
    pub async fn release(&self, worker_url: &str) -> Result<(), Error> {
        let pod_name = pod_name_from_url(worker_url)?;
        let namespace = self.inner.config.namespace.clone();

        {
            let mut queue = self.inner.queue.lock().await;
            if let Some(next) = queue.pop_front() {
                let _apply_guard = self.inner.apply_lock.lock().await;
                match patch::apply_lease(
                    self.inner.client.clone(),
                    &namespace,
                    &pod_name,
                    &next.owner_id,
                    &self.inner.config.controller_id,
                )
                .await
                {
                    Ok(_) => {
                        match self.resolve(&pod_name).await {
                            Ok(url) => {
                                let _ = next.tx.send(Ok(url));
                            }
                            Err(e) => {
                                self.rollback_lease(&pod_name).await;
                                let _ = next.tx.send(Err(e));
                            }
                        }
                        return Ok(());
                    }
                    Err(_) => {
                        // Conflict or transient failure handing off directly;
                        // put the request back and fall through to a normal release.
                        queue.push_front(next);
                    }
                }
            }
        }

        let api: Api<Pod> = Api::namespaced(self.inner.client.clone(), &namespace);
        match api.get(&pod_name).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => return Err(Error::InvalidInput("pod not allocated".to_string())),
            Err(e) => return Err(e.into()),
        }

        let expiry = Utc::now() + chrono::Duration::from_std(self.inner.config.max_idle).unwrap_or_default();
        patch::apply_release(self.inner.client.clone(), &namespace, &pod_name, expiry).await?;
        self.drive_queue().await;
        Ok(())
    }

    /// Closes the manager: cancels the reaper, and delivers `Transient`
    /// (the caller sees it as "manager closed") to every queued request.
    pub async fn close(&self) {
        self.inner.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.inner.shutdown.cancel();
        let mut queue = self.inner.queue.lock().await;
        while let Some(req) = queue.pop_front() {
            let _ = req.tx.send(Err(Error::Transient("lease manager closed".to_string())));
        }
    }

    /// Spawns the background reaper: on every tick, classifies the fleet,
    /// asks the arbiter for a replica count, and scales down to it.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = this.reap_once().await {
                    eprintln!("{}", format!("reap tick failed: {e}").color(FG1));
                }
            }
        })
    }

    async fn reap_once(&self) -> Result<(), Error> {
        let observations = self.list_observations().await?;
        let backlog = self.inner.queue.lock().await.len();
        let states: Vec<BuilderState> = observations
            .iter()
            .map(|obs| arbiter::classify(obs, &self.inner.config.controller_id, Utc::now(), self.inner.config.max_idle))
            .collect();
        let desired = arbiter::suggested_replicas(&states, backlog);
        let current = self.inner.scaler.current_replicas().await?;
        let delta = desired as i32 - current;
        if delta != 0 {
            println!(
                "{}",
                format!("reap: scaling builder fleet by {delta} (desired={desired}, current={current})").color(FG2)
            );
            self.inner.scaler.scale(delta).await?;
        }
        Ok(())
    }

    /// Runs one pass of the satisfier against the head of the queue. `Ok(None)`
    /// (no candidate yet, no scale-up attempted) is left for the next
    /// `acquire`/reap tick; a definite failure is delivered straight to the
    /// head request's channel so the blocked `acquire` call returns instead
    /// of waiting out its `ctx` for an error it's never told about.
    async fn drive_queue(&self) {
        loop {
            let head_owner = {
                let queue = self.inner.queue.lock().await;
                match queue.front() {
                    Some(req) => req.owner_id.clone(),
                    None => return,
                }
            };
            match self.try_satisfy(&head_owner).await {
                Ok(Some(url)) => {
                    let mut queue = self.inner.queue.lock().await;
                    if let Some(pos) = queue.iter().position(|r| r.owner_id == head_owner) {
                        let req = queue.remove(pos).unwrap();
                        let _ = req.tx.send(Ok(url));
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    let mut queue = self.inner.queue.lock().await;
                    if let Some(pos) = queue.iter().position(|r| r.owner_id == head_owner) {
                        let req = queue.remove(pos).unwrap();
                        let _ = req.tx.send(Err(e));
                    }
                    return;
                }
            }
        }
    }

    /// Finds the lowest-ordinal leasable pod, requesting a scale-up if
    /// none exists, and applies the lease annotation. Listing races freely;
    /// the apply itself is serialized under `apply_lock` so two satisfiers
    /// racing on the same candidate can't both stamp a lease onto it.
    async fn try_satisfy(&self, owner_id: &str) -> Result<Option<String>, Error> {
        let mut observations = self.list_observations().await?;
        observations.sort_by_key(|o| o.ordinal);
        let now = Utc::now();

        let mut candidate = observations.iter().find(|obs| {
            arbiter::classify(obs, &self.inner.config.controller_id, now, self.inner.config.max_idle).is_leasable()
        });

        if candidate.is_none() {
            self.inner.scaler.scale(1).await?;
            observations = self.list_observations().await?;
            observations.sort_by_key(|o| o.ordinal);
            candidate = observations.iter().find(|obs| {
                arbiter::classify(obs, &self.inner.config.controller_id, now, self.inner.config.max_idle).is_leasable()
            });
        }

        let Some(candidate) = candidate else {
            return Err(Error::NoCapacity("no builder pod became available".to_string()));
        };

        let _apply_guard = self.inner.apply_lock.lock().await;

        // Re-check under the lock: another satisfier may have leased this
        // exact candidate while we were listing/scaling above.
        let api: Api<Pod> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let fresh = api.get(&candidate.name).await?;
        if patch::lease_annotations(&fresh).contains_key(patch::LEASED_BY_ANNOTATION) {
            return Ok(None);
        }

        match patch::apply_lease(
            self.inner.client.clone(),
            &self.inner.config.namespace,
            &candidate.name,
            owner_id,
            &self.inner.config.controller_id,
        )
        .await
        {
            Ok(_) => match self.resolve(&candidate.name).await {
                Ok(url) => Ok(Some(url)),
                Err(e) => {
                    self.rollback_lease(&candidate.name).await;
                    Err(e)
                }
            },
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Reverts a lease just applied to `pod_name` back to an idle,
    /// expiry-bearing state. Used when the handoff succeeds but address
    /// resolution never does, so the pod doesn't end up permanently
    /// `Leased` with no caller holding it.
    async fn rollback_lease(&self, pod_name: &str) {
        let expiry = Utc::now() + chrono::Duration::from_std(self.inner.config.max_idle).unwrap_or_default();
        if let Err(e) = patch::apply_release(self.inner.client.clone(), &self.inner.config.namespace, pod_name, expiry).await {
            eprintln!("{}", format!("failed to roll back lease on '{pod_name}': {e}").color(FG1));
        }
    }

    async fn resolve(&self, pod_name: &str) -> Result<String, Error> {
        endpoints::resolve_address(
            self.inner.client.clone(),
            &self.inner.config.namespace,
            &self.inner.config.service_name,
            pod_name,
            &self.inner.config.port_name,
            self.inner.config.daemon_port,
            self.inner.config.endpoint_watch_timeout,
        )
        .await
    }

    async fn list_observations(&self) -> Result<Vec<PodObservation>, Error> {
        let api: Api<Pod> = Api::namespaced(self.inner.client.clone(), &self.inner.config.namespace);
        let pods = api
            .list(&ListParams::default().labels(&self.inner.config.label_selector))
            .await?;
        Ok(pods.items.into_iter().map(pod_to_observation).collect())
    }
}

fn pod_to_observation(pod: Pod) -> PodObservation {
    let name = pod.name_any();
    let ordinal = parse_ordinal(&name);
    let annotations = patch::lease_annotations(&pod);
    let expiry_time = annotations.get(EXPIRY_TIME_ANNOTATION).map(|v| {
        chrono::DateTime::parse_from_rfc3339(v)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ())
    });
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.clone())
        .unwrap_or_default();
    let cond = |t: &str| conditions.iter().any(|c| c.type_ == t && c.status == "True");
    PodObservation {
        name: name.clone(),
        ordinal,
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_default(),
        readiness: Readiness {
            scheduled: cond("PodScheduled"),
            initialized: cond("Initialized"),
            containers_ready: cond("ContainersReady"),
            ready: cond("Ready"),
        },
        creation_time: pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now),
        deletion_timestamp: pod.metadata.deletion_timestamp.as_ref().map(|t| t.0),
        leased_by: annotations.get(LEASED_BY_ANNOTATION).map(|s| s.to_string()),
        manager_id: annotations.get(MANAGER_ID_ANNOTATION).map(|s| s.to_string()),
        expiry_time,
    }
}

/// Parses the trailing ordinal off a statefulset-style pod name
/// (`<stem>-<n>`). Absent or non-numeric suffixes sentinel to `-1`.
fn parse_ordinal(name: &str) -> i64 {
    name.rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse::<i64>().ok())
        .unwrap_or(-1)
}

fn pod_name_from_url(worker_url: &str) -> Result<String, Error> {
    let url = url::Url::parse(worker_url).map_err(|_| Error::InvalidInput(format!("not an absolute URL: {worker_url}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::InvalidInput(format!("url has no host: {worker_url}")))?;
    let pod_name = host
        .split('.')
        .next()
        .ok_or_else(|| Error::InvalidInput(format!("url host is empty: {worker_url}")))?;
    Ok(pod_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordinal_parses_the_trailing_decimal_suffix() {
        assert_eq!(parse_ordinal("builder-0"), 0);
        assert_eq!(parse_ordinal("builder-12"), 12);
    }

    #[test]
    fn ordinal_sentinels_to_negative_one_when_absent() {
        assert_eq!(parse_ordinal("builder"), -1);
        assert_eq!(parse_ordinal("builder-abc"), -1);
    }

    #[test]
    fn pod_name_extracted_from_the_left_most_dns_label() {
        assert_eq!(
            pod_name_from_url("tcp://builder-0.builder-svc.default:9000").unwrap(),
            "builder-0"
        );
    }

    #[test]
    fn non_absolute_url_is_invalid_input() {
        assert!(pod_name_from_url("not a url").is_err());
    }
}
