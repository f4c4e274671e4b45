//! Async `LeaseManager` behavior against a faked Kubernetes API, built the
//! way `kube`'s own `mock_tests.rs` fakes one: a `tower_test::mock::pair`
//! wired into `kube::Client::new`, with a scripted task on the other end
//! answering (or deliberately not answering) each request a scenario needs.

use std::time::Duration;

use http::{Request, Response};
use kube::Client;
use kube::client::Body;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::{LeaseManager, LeaseManagerConfig};
use crate::util::Error;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

fn testcontext() -> (Client, ApiServerHandle) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    (client, handle)
}

fn test_config() -> LeaseManagerConfig {
    LeaseManagerConfig {
        namespace: "default".to_string(),
        label_selector: "app=builder".to_string(),
        statefulset_name: "builder".to_string(),
        service_name: "builder".to_string(),
        port_name: "builder".to_string(),
        daemon_port: 9000,
        controller_id: "ctrl-a".to_string(),
        max_idle: Duration::from_secs(600),
        endpoint_watch_timeout: Duration::from_millis(50),
        scale_watch_timeout: Duration::from_millis(50),
    }
}

fn ok_json(body: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(200)
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("timeout waiting on the mock apiserver")
        .expect("scenario task panicked");
}

/// Covers the "endpoint lag" scenario named in the spec's testable-scenario
/// list when it never resolves: the scale-up path finds no leasable pod, a
/// scale-up is requested, but the statefulset never reports ready replicas
/// before `scale_watch_timeout`. `drive_queue` must deliver that `NoCapacity`
/// to the blocked `acquire` caller instead of leaving its channel unanswered.
#[tokio::test]
async fn no_capacity_after_a_stalled_scale_up_reaches_the_blocked_caller() {
    let (client, mut handle) = testcontext();
    let manager = LeaseManager::new(client, test_config());

    let server = tokio::spawn(async move {
        // 1. list_observations: fleet is empty.
        let (request, send) = handle.next_request().await.expect("expected a pod list call");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(ok_json(json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": [],
        })));

        // 2. Scaler reads the current replica count off the scale subresource.
        let (request, send) = handle.next_request().await.expect("expected a get_scale call");
        assert!(request.uri().path().ends_with("/scale"));
        send.send_response(ok_json(json!({
            "apiVersion": "autoscaling/v1",
            "kind": "Scale",
            "metadata": { "name": "builder" },
            "spec": { "replicas": 0 },
            "status": { "replicas": 0 },
        })));

        // 3. Scaler patches the replica count up to 1.
        let (request, send) = handle.next_request().await.expect("expected a patch_scale call");
        assert_eq!(request.method(), http::Method::PATCH);
        send.send_response(ok_json(json!({
            "apiVersion": "autoscaling/v1",
            "kind": "Scale",
            "metadata": { "name": "builder" },
            "spec": { "replicas": 1 },
            "status": { "replicas": 0 },
        })));

        // 4. `wait_ready`'s watcher issues its own initial list of the
        // statefulset before it would start watching. Leave it unanswered:
        // the 50ms `scale_watch_timeout` is what's meant to end the wait.
        let (request, _send) = handle.next_request().await.expect("expected the watcher's initial list");
        assert_eq!(request.method(), http::Method::GET);
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let ctx = CancellationToken::new();
    let result = manager.acquire(&ctx, "owner-a").await;
    assert!(
        matches!(result, Err(Error::NoCapacity(_))),
        "expected NoCapacity, got {result:?}"
    );

    timeout_after_1s(server).await;
}

/// Covers the spec's "Endpoint lag" scenario: a leasable pod exists, the
/// lease annotation is applied, but the pod's endpoint never shows up before
/// `endpoint_watch_timeout`. The lease must be rolled back (annotations
/// cleared) rather than left stamped on a pod nobody holds.
#[tokio::test]
async fn a_stalled_endpoint_rolls_back_the_lease_it_just_applied() {
    let (client, mut handle) = testcontext();
    let manager = LeaseManager::new(client, test_config());

    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": { "name": "builder-0", "namespace": "default" },
        "spec": { "containers": [] },
        "status": {
            "phase": "Running",
            "conditions": [
                { "type": "PodScheduled", "status": "True" },
                { "type": "Initialized", "status": "True" },
                { "type": "ContainersReady", "status": "True" },
                { "type": "Ready", "status": "True" },
            ],
        },
    });

    let server = tokio::spawn(async move {
        // 1. list_observations: one leasable pod.
        let (request, send) = handle.next_request().await.expect("expected a pod list call");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(ok_json(json!({
            "apiVersion": "v1",
            "kind": "PodList",
            "metadata": {},
            "items": [pod.clone()],
        })));

        // 2. try_satisfy re-checks the candidate under the apply lock.
        let (request, send) = handle.next_request().await.expect("expected a get-pod call");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(ok_json(pod.clone()));

        // 3. The lease annotation is applied.
        let (request, send) = handle.next_request().await.expect("expected an apply-lease patch");
        assert_eq!(request.method(), http::Method::PATCH);
        send.send_response(ok_json(pod.clone()));

        // 4. resolve_address's initial EndpointSlice list comes up empty.
        let (request, send) = handle.next_request().await.expect("expected an endpointslice list call");
        assert_eq!(request.method(), http::Method::GET);
        send.send_response(ok_json(json!({
            "apiVersion": "discovery.k8s.io/v1",
            "kind": "EndpointSliceList",
            "metadata": {},
            "items": [],
        })));

        // 5. The watcher's own initial list of EndpointSlices is left
        // unanswered; endpoint_watch_timeout (50ms) is what's meant to end
        // the wait.
        let (request, _send) = handle.next_request().await.expect("expected the watcher's initial list");
        assert_eq!(request.method(), http::Method::GET);
        tokio::time::sleep(Duration::from_millis(200)).await;

        // 6. The lease must be rolled back before NoCapacity reaches the caller.
        let (request, send) = handle.next_request().await.expect("expected a rollback patch");
        assert_eq!(request.method(), http::Method::PATCH);
        send.send_response(ok_json(pod.clone()));
    });

    let ctx = CancellationToken::new();
    let result = manager.acquire(&ctx, "owner-a").await;
    assert!(result.is_err(), "expected the stalled resolve to surface as an error, got {result:?}");

    timeout_after_1s(server).await;
}
