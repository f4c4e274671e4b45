use super::MANAGER_NAME;
use buildctl_types::*;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    Api, Client, Error,
    api::{Patch, PatchParams, Resource},
    core::NamespaceResourceScope,
};
use serde::{Serialize, de::DeserializeOwned};
use std::{clone::Clone, collections::BTreeMap, fmt::Debug};

pub trait Object<S: Status> {
    /// Returns a mutable reference to the status object, initializing
    /// it with the default value if it does not exist.
    fn mut_status(&mut self) -> &mut S;
}

pub trait Status {
    /// Sets the last updated timestamp to the given value.
    fn set_last_updated(&mut self, last_updated: String);
}

impl Object<BuildRequestStatus> for BuildRequest {
    fn mut_status(&mut self) -> &mut BuildRequestStatus {
        if self.status.is_some() {
            return self.status.as_mut().unwrap();
        }
        self.status = Some(Default::default());
        self.status.as_mut().unwrap()
    }
}

impl Status for BuildRequestStatus {
    fn set_last_updated(&mut self, last_updated: String) {
        self.last_updated = Some(last_updated);
    }
}

/// Patch the resource's status object with the provided function.
/// The function is passed a mutable reference to the status object,
/// which is to be mutated in-place. Move closures are supported.
pub async fn patch_status<S: Status, T>(
    client: Client,
    instance: &T,
    f: impl FnOnce(&mut S),
) -> Result<T, Error>
where
    <T as Resource>::DynamicType: Default,
    T: Clone
        + Resource
        + Object<S>
        + Serialize
        + DeserializeOwned
        + Debug
        + Resource<Scope = NamespaceResourceScope>,
{
    let patch = Patch::Json::<T>({
        let mut modified = instance.clone();
        let status = modified.mut_status();
        f(status);
        status.set_last_updated(chrono::Utc::now().to_rfc3339());
        json_patch::diff(
            &serde_json::to_value(instance).unwrap(),
            &serde_json::to_value(&modified).unwrap(),
        )
    });
    let name = instance.meta().name.as_deref().unwrap();
    let namespace = instance.meta().namespace.as_deref().unwrap();
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch_status(name, &PatchParams::apply(MANAGER_NAME), &patch)
        .await
}

use const_format::concatcp;

use super::GROUP;

/// Names of the three annotations that together make up a pod lease. Kept
/// together so every call site agrees on the exact strings.
pub const LEASED_BY_ANNOTATION: &str = concatcp!(GROUP, "/leased-by");
pub const MANAGER_ID_ANNOTATION: &str = concatcp!(GROUP, "/manager-identity");
pub const EXPIRY_TIME_ANNOTATION: &str = concatcp!(GROUP, "/expiry-time");

/// Server-side-apply a lease onto a pod: stamps `leased-by`/`manager-identity`
/// and clears `expiry-time`. A conflict (another satisfier won the race)
/// surfaces as `kube::Error` for the caller to map to `Error::Transient`.
pub async fn apply_lease(
    client: Client,
    namespace: &str,
    pod_name: &str,
    owner_id: &str,
    manager_id: &str,
) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "annotations": {
                LEASED_BY_ANNOTATION: owner_id,
                MANAGER_ID_ANNOTATION: manager_id,
                EXPIRY_TIME_ANNOTATION: serde_json::Value::Null,
            },
        },
    });
    api.patch(
        pod_name,
        &PatchParams::apply(MANAGER_NAME).force(),
        &Patch::Apply(&patch),
    )
    .await
}

/// Server-side-apply a release onto a pod: clears `leased-by`/
/// `manager-identity` and stamps `expiry-time`.
pub async fn apply_release(
    client: Client,
    namespace: &str,
    pod_name: &str,
    expiry_time: chrono::DateTime<chrono::Utc>,
) -> Result<Pod, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "annotations": {
                LEASED_BY_ANNOTATION: serde_json::Value::Null,
                MANAGER_ID_ANNOTATION: serde_json::Value::Null,
                EXPIRY_TIME_ANNOTATION: expiry_time.to_rfc3339(),
            },
        },
    });
    api.patch(
        pod_name,
        &PatchParams::apply(MANAGER_NAME).force(),
        &Patch::Apply(&patch),
    )
    .await
}

/// Reads a pod's lease annotations into a plain map for classification.
pub fn lease_annotations(pod: &Pod) -> BTreeMap<&str, &str> {
    let mut out = BTreeMap::new();
    if let Some(annotations) = pod.metadata.annotations.as_ref() {
        for key in [
            LEASED_BY_ANNOTATION,
            MANAGER_ID_ANNOTATION,
            EXPIRY_TIME_ANNOTATION,
        ] {
            if let Some(value) = annotations.get(key) {
                out.insert(key, value.as_str());
            }
        }
    }
    out
}
