use prometheus::{HistogramVec, IntCounterVec, register_histogram_vec, register_int_counter_vec};
use std::convert::Infallible;
use std::net::SocketAddr;

/// Per-controller reconcile/action metrics, registered once and labeled by
/// name/namespace/action at observation time.
pub struct ControllerMetrics {
    pub reconcile_counter: IntCounterVec,
    pub action_counter: IntCounterVec,
    pub read_histogram: HistogramVec,
    pub write_histogram: HistogramVec,
}

impl ControllerMetrics {
    pub fn new(controller: &str) -> Self {
        let reconcile_counter = register_int_counter_vec!(
            format!("{controller}_reconcile_total"),
            "Number of times the reconciler has run for a resource.",
            &["name", "namespace"]
        )
        .unwrap();
        let action_counter = register_int_counter_vec!(
            format!("{controller}_action_total"),
            "Number of times a given action has been taken.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        let read_histogram = register_histogram_vec!(
            format!("{controller}_read_seconds"),
            "Time spent determining which action to take.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        let write_histogram = register_histogram_vec!(
            format!("{controller}_write_seconds"),
            "Time spent applying the determined action.",
            &["name", "namespace", "action"]
        )
        .unwrap();
        ControllerMetrics {
            reconcile_counter,
            action_counter,
            read_histogram,
            write_histogram,
        }
    }
}

async fn serve(_req: hyper::Request<hyper::Body>) -> Result<hyper::Response<hyper::Body>, Infallible> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    Ok(hyper::Response::new(hyper::Body::from(buffer)))
}

/// Runs a minimal metrics server on the given port until the process exits.
pub async fn run_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = hyper::service::make_service_fn(|_conn| async {
        Ok::<_, Infallible>(hyper::service::service_fn(serve))
    });
    if let Err(e) = hyper::Server::bind(&addr).serve(make_svc).await {
        eprintln!("metrics server error: {e}");
    }
}
