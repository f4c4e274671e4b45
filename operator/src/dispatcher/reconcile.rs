use std::sync::Arc;

use buildctl_types::*;
use futures::stream::StreamExt;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, WatchStreamExt, controller::Action, watcher},
};
use kube_leader_election::{LeaseLock, LeaseLockParams};
use owo_colors::OwoColorize;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::cancel::CancellationMap;
use crate::engine::EngineClient;
use crate::lease::{LeaseManager, LeaseManagerConfig};
use crate::util::{
    Error,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Static configuration for one controller run, gathered from CLI flags.
pub struct RunConfig {
    pub lease_manager: LeaseManagerConfig,
    pub max_concurrent_reconciles: u16,
}

/// Context injected with each `reconcile` and `on_error` invocation.
pub struct ContextData {
    pub(crate) client: Client,
    pub(crate) lease_manager: LeaseManager,
    pub(crate) cancel_map: Arc<CancellationMap>,
    pub(crate) engine: Arc<dyn EngineClient>,
    /// Bounds how many builds run their engine RPC concurrently.
    pub(crate) reconcile_limiter: tokio::sync::Semaphore,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    pub fn new(client: Client, lease_manager: LeaseManager, engine: Arc<dyn EngineClient>, max_concurrent_reconciles: u16) -> Self {
        let reconcile_limiter = tokio::sync::Semaphore::new(max_concurrent_reconciles.max(1) as usize);
        #[cfg(feature = "metrics")]
        {
            ContextData {
                client,
                lease_manager,
                cancel_map: Arc::new(CancellationMap::new()),
                engine,
                reconcile_limiter,
                metrics: ControllerMetrics::new("builds"),
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                lease_manager,
                cancel_map: Arc::new(CancellationMap::new()),
                engine,
                reconcile_limiter,
            }
        }
    }
}

/// Entrypoint for the `BuildRequest` controller: leader election, the
/// delete-broadcaster, and the `kube_runtime::Controller` loop.
pub async fn run(client: Client, config: RunConfig, engine: Arc<dyn EngineClient>) -> Result<(), Error> {
    println!("{}", "Starting BuildRequest controller...".green());

    let max_concurrent_reconciles = config.max_concurrent_reconciles;
    let lease_manager = LeaseManager::new(client.clone(), config.lease_manager);
    let _reaper = lease_manager.spawn_reaper();

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), lease_manager, engine, max_concurrent_reconciles));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("buildctl-operator-{}", uuid::Uuid::new_v4()));
    let lease_name = "buildctl-operator-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        buildctl_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    buildctl_common::signal_ready();

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut router_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                if let Some(task) = router_task.take() {
                    task.abort();
                }
                context.lease_manager.close().await;
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                if let Some(task) = router_task.take() {
                    task.abort();
                }
                continue;
            }
        };
        if lease.acquired_lease {
            if controller_task.is_none() {
                println!("acquired leadership; starting controller");
                buildctl_common::signal_ready();

                let (delete_tx, delete_rx) = mpsc::unbounded_channel();
                router_task = Some(crate::cancel::spawn_router(context.cancel_map.clone(), delete_rx));
                let delete_watch_client = client.clone();
                tokio::spawn(async move {
                    watch_deletes(delete_watch_client, delete_tx).await;
                });

                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let crd_api: Api<BuildRequest> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "BuildRequest controller started.".green());
                    Controller::new(crd_api, watcher::Config::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
            if let Some(task) = router_task.take() {
                task.abort();
            }
        }
    }
}

/// Watches for `BuildRequest` deletions and forwards `(namespace, name)`
/// keys to the cancellation router. Runs only on the leader.
async fn watch_deletes(client: Client, tx: mpsc::UnboundedSender<crate::cancel::Key>) {
    let api: Api<BuildRequest> = Api::all(client);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()).touched_objects());
    loop {
        match stream.next().await {
            Some(Ok(obj)) => {
                if obj.metadata.deletion_timestamp.is_some() {
                    if let Some(ns) = obj.namespace() {
                        let _ = tx.send((ns, obj.name_any()));
                    }
                }
            }
            Some(Err(e)) => eprintln!("delete watch error: {e}"),
            None => break,
        }
    }
}

/// Action to be taken upon a `BuildRequest` during reconciliation.
#[derive(Debug, PartialEq)]
enum DispatchAction {
    /// Brand-new request: `status` has never been written.
    Initialize,
    /// `Initializing`/`Running` with no live cancellation handle: this
    /// controller restarted mid-build.
    Recover,
    /// Already being driven by an in-flight reconcile for this key.
    NoOp,
}

impl DispatchAction {
    fn to_str(&self) -> &str {
        match self {
            DispatchAction::Initialize => "Initialize",
            DispatchAction::Recover => "Recover",
            DispatchAction::NoOp => "NoOp",
        }
    }
}

async fn reconcile(instance: Arc<BuildRequest>, context: Arc<ContextData>) -> Result<Action, Error> {
    let namespace: String = match instance.namespace() {
        None => {
            return Err(Error::InvalidInput(
                "BuildRequest resource must be namespaced".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();
    let key = (namespace.clone(), name.clone());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(&context, &key, &instance);

    if action != DispatchAction::NoOp {
        println!(
            "{}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " ACTION: ".color(FG1),
            action.to_str().color(FG2),
        );
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action {
        DispatchAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        DispatchAction::NoOp => Action::await_change(),
        DispatchAction::Recover => {
            actions::recover(context.client.clone(), &instance).await?;
            Action::await_change()
        }
        DispatchAction::Initialize => {
            actions::run_build(context.clone(), instance.clone(), key).await?;
            Action::await_change()
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

fn determine_action(context: &ContextData, key: &crate::cancel::Key, instance: &BuildRequest) -> DispatchAction {
    match &instance.status {
        None => DispatchAction::Initialize,
        Some(status) if status.phase.is_terminal() => DispatchAction::NoOp,
        Some(_) if context.cancel_map.contains(key) => DispatchAction::NoOp,
        Some(_) => DispatchAction::Recover,
    }
}

fn on_error(instance: Arc<BuildRequest>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("reconciliation error for '{}': {error}", instance.name_any()).red()
    );
    if error.is_fatal() {
        Action::requeue(Duration::from_secs(300))
    } else {
        Action::requeue(Duration::from_secs(5))
    }
}
