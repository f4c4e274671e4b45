//! Resolution of a builder pod's network address via the headless
//! service's `EndpointSlice`, including the bounded watch used when a
//! freshly-leased pod's endpoint hasn't appeared yet.

use std::time::Duration;

use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::{
    Api, Client,
    runtime::{WatchStreamExt, watcher},
};
use tokio_stream::StreamExt;

use crate::util::Error;

/// A snapshot mapping ready endpoints to `(hostname, port)`, built from
/// every `EndpointSlice` selected by the headless service's label.
#[derive(Debug, Default, Clone)]
pub struct ServiceEndpointIndex {
    entries: Vec<(String, String, u16)>, // (pod_name, hostname, port)
}

impl ServiceEndpointIndex {
    fn from_slices(slices: impl IntoIterator<Item = EndpointSlice>, port_name: &str) -> Self {
        let mut entries = Vec::new();
        for slice in slices {
            let port = slice
                .ports
                .iter()
                .flatten()
                .find(|p| p.name.as_deref() == Some(port_name))
                .and_then(|p| p.port)
                .unwrap_or(0);
            if port == 0 {
                continue;
            }
            for endpoint in &slice.endpoints {
                if !endpoint.conditions.as_ref().and_then(|c| c.ready).unwrap_or(false) {
                    continue;
                }
                let Some(target_ref) = endpoint.target_ref.as_ref() else {
                    continue;
                };
                let Some(pod_name) = target_ref.name.clone() else {
                    continue;
                };
                let Some(hostname) = endpoint.hostname.clone() else {
                    continue;
                };
                entries.push((pod_name, hostname, port as u16));
            }
        }
        ServiceEndpointIndex { entries }
    }

    /// Looks up the `(hostname, port)` for a ready endpoint backing the
    /// named pod, if one is present in this snapshot.
    pub fn resolve(&self, pod_name: &str) -> Option<(&str, u16)> {
        self.entries
            .iter()
            .find(|(p, _, _)| p == pod_name)
            .map(|(_, host, port)| (host.as_str(), *port))
    }
}

/// Resolves a builder pod's address, watching the `EndpointSlice`
/// resources for the service (bounded by `watch_timeout`) if the pod's
/// endpoint isn't present on the first snapshot.
pub async fn resolve_address(
    client: Client,
    namespace: &str,
    service_name: &str,
    pod_name: &str,
    port_name: &str,
    daemon_port: u16,
    watch_timeout: Duration,
) -> Result<String, Error> {
    let api: Api<EndpointSlice> = Api::namespaced(client.clone(), namespace);
    let label_selector = format!("kubernetes.io/service-name={service_name}");

    let list = api
        .list(&kube::api::ListParams::default().labels(&label_selector))
        .await?;
    let index = ServiceEndpointIndex::from_slices(list.items, port_name);
    if let Some((hostname, _)) = index.resolve(pod_name) {
        return Ok(format!(
            "tcp://{hostname}.{service_name}.{namespace}:{daemon_port}"
        ));
    }

    let cfg = watcher::Config::default().labels(&label_selector);
    let mut stream = Box::pin(watcher(api, cfg).applied_objects());
    let deadline = tokio::time::Instant::now() + watch_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::NoCapacity(format!(
                "no ready endpoint for pod '{pod_name}' within {watch_timeout:?}"
            )));
        }
        let next = match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(slice))) => slice,
            Ok(Some(Err(e))) => return Err(Error::Transient(e.to_string())),
            Ok(None) => return Err(Error::Transient("endpoint watch stream ended".to_string())),
            Err(_) => {
                return Err(Error::NoCapacity(format!(
                    "no ready endpoint for pod '{pod_name}' within {watch_timeout:?}"
                )));
            }
        };
        let index = ServiceEndpointIndex::from_slices([next], port_name);
        if let Some((hostname, _)) = index.resolve(pod_name) {
            return Ok(format!(
                "tcp://{hostname}.{service_name}.{namespace}:{daemon_port}"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort};
    use k8s_openapi::api::core::v1::ObjectReference;

    fn slice(pod_name: &str, hostname: &str, port: i32, ready: bool) -> EndpointSlice {
        EndpointSlice {
            metadata: Default::default(),
            address_type: "IPv4".to_string(),
            endpoints: vec![Endpoint {
                addresses: vec!["10.0.0.1".to_string()],
                conditions: Some(EndpointConditions {
                    ready: Some(ready),
                    ..Default::default()
                }),
                hostname: Some(hostname.to_string()),
                target_ref: Some(ObjectReference {
                    name: Some(pod_name.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ports: Some(vec![EndpointPort {
                name: Some("builder".to_string()),
                port: Some(port),
                ..Default::default()
            }]),
        }
    }

    #[test]
    fn resolves_a_ready_endpoint_for_the_named_pod() {
        let index = ServiceEndpointIndex::from_slices([slice("builder-0", "builder-0", 9000, true)], "builder");
        assert_eq!(index.resolve("builder-0"), Some(("builder-0", 9000)));
    }

    #[test]
    fn ignores_endpoints_that_are_not_ready() {
        let index = ServiceEndpointIndex::from_slices([slice("builder-0", "builder-0", 9000, false)], "builder");
        assert_eq!(index.resolve("builder-0"), None);
    }

    #[test]
    fn ignores_endpoints_for_a_different_pod() {
        let index = ServiceEndpointIndex::from_slices([slice("builder-1", "builder-1", 9000, true)], "builder");
        assert_eq!(index.resolve("builder-0"), None);
    }
}
