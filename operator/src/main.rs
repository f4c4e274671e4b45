use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::client::Client;

mod arbiter;
mod cancel;
mod dispatcher;
mod engine;
mod lease;
mod util;

use dispatcher::RunConfig;
use engine::EngineClient;
use engine::grpc::GrpcEngineClient;
use lease::LeaseManagerConfig;

/// Top-level CLI configuration for the binary. Any command line
/// flags should go in here.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Prometheus metrics server scrape port. Disabled by default.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,
}

/// List of subcommands for the binary. Clap will convert the
/// name of each enum variant to kebab-case for the CLI.
#[derive(Subcommand)]
enum Command {
    /// Runs the `BuildRequest` controller.
    Run {
        /// Namespace the builder statefulset, its headless service, and every
        /// watched `BuildRequest` live in.
        #[arg(long, env = "NAMESPACE", default_value = "default")]
        namespace: String,

        /// Label selector matching every pod in the builder fleet.
        #[arg(long, env = "BUILDER_LABEL_SELECTOR", default_value = "app=buildctl-builder")]
        builder_label_selector: String,

        /// Name of the builder `StatefulSet` this controller scales.
        #[arg(long, env = "BUILDER_STATEFULSET", default_value = "buildctl-builder")]
        builder_statefulset: String,

        /// Name of the headless `Service` fronting the builder fleet.
        #[arg(long, env = "BUILDER_SERVICE", default_value = "buildctl-builder")]
        builder_service: String,

        /// Name of the named port the build daemon listens on.
        #[arg(long, env = "BUILDER_PORT_NAME", default_value = "daemon")]
        builder_port_name: String,

        /// Numeric port the build daemon listens on.
        #[arg(long, env = "BUILDER_DAEMON_PORT", default_value_t = 9000)]
        builder_daemon_port: u16,

        /// How long an unleased or not-yet-ready builder pod is kept before
        /// the arbiter considers it reapable.
        #[arg(long, env = "BUILDER_MAX_IDLE_SECS", default_value_t = 600)]
        builder_max_idle_secs: u64,

        /// Bound on how long Acquire waits for a freshly-leased pod's
        /// endpoint to appear before rolling the lease back.
        #[arg(long, env = "ENDPOINT_WATCH_TIMEOUT_SECS", default_value_t = 180)]
        endpoint_watch_timeout_secs: u64,

        /// Bound on how long a scale-up waits for `readyReplicas` to catch up.
        #[arg(long, env = "SCALE_WATCH_TIMEOUT_SECS", default_value_t = 180)]
        scale_watch_timeout_secs: u64,

        /// Address of the build engine's gRPC endpoint.
        #[arg(long, env = "BUILD_ENGINE_ENDPOINT", required = true)]
        build_engine_endpoint: String,

        /// Upper bound on how many builds run their engine RPC concurrently.
        #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 8)]
        max_concurrent_reconciles: u16,
    },
}

/// Secondary entrypoint that connects to the build engine and runs the
/// `BuildRequest` controller.
async fn run(client: Client) {
    let cli = Cli::parse();

    #[cfg(feature = "metrics")]
    if let Some(metrics_port) = cli.metrics_port {
        tokio::spawn(util::metrics::run_server(metrics_port));
    }

    match cli.command {
        Command::Run {
            namespace,
            builder_label_selector,
            builder_statefulset,
            builder_service,
            builder_port_name,
            builder_daemon_port,
            builder_max_idle_secs,
            endpoint_watch_timeout_secs,
            scale_watch_timeout_secs,
            build_engine_endpoint,
            max_concurrent_reconciles,
        } => {
            let engine: Arc<dyn EngineClient> = Arc::new(
                GrpcEngineClient::connect(build_engine_endpoint)
                    .await
                    .expect("failed to connect to the build engine"),
            );

            let config = RunConfig {
                lease_manager: LeaseManagerConfig {
                    namespace,
                    label_selector: builder_label_selector,
                    statefulset_name: builder_statefulset,
                    service_name: builder_service,
                    port_name: builder_port_name,
                    daemon_port: builder_daemon_port,
                    controller_id: uuid::Uuid::new_v4().to_string(),
                    max_idle: Duration::from_secs(builder_max_idle_secs),
                    endpoint_watch_timeout: Duration::from_secs(endpoint_watch_timeout_secs),
                    scale_watch_timeout: Duration::from_secs(scale_watch_timeout_secs),
                },
                max_concurrent_reconciles,
            };

            dispatcher::run(client, config, engine).await.unwrap();
        }
    }

    panic!("exited unexpectedly");
}

/// Main entrypoint that sets up the environment before running the secondary entrypoint `run`.
#[tokio::main]
async fn main() {
    buildctl_common::init();

    // Set the panic hook to exit the process with a non-zero exit code
    // when a panic occurs on any thread. This is desired behavior when
    // running in a container, as the metrics server or controller may
    // panic and we always want to restart the container in that case.
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    // Create a kubernetes client using the default configuration.
    // In-cluster, the kubeconfig will be set by the service account.
    let client: Client = Client::try_default()
        .await
        .expect("Expected a valid KUBECONFIG environment variable.");

    // Run the secondary entrypoint.
    run(client).await;

    // This is an unreachable branch. The controller should never exit
    // without a panic.
    panic!("exited prematurely");
}
