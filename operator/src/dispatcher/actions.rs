//! Per-phase actions for the `BuildRequest` state machine: the crash
//! recovery transition, and the full happy/unhappy path driven by
//! `run_build`.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::Engine as _;
use buildctl_types::*;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};

use super::reconcile::ContextData;
use crate::cancel::Key;
use crate::engine::{BuildInvocation, BuildOutcome, CONTEXT_CANCELED_MARKER};
use crate::util::{Error, messages, patch::patch_status};

/// Crash-recovery rule: a `BuildRequest` observed `Initializing`/`Running`
/// with no live cancellation handle was orphaned by a controller restart.
pub async fn recover(client: Client, instance: &BuildRequest) -> Result<(), Error> {
    fail(client, instance, "NotRunning", messages::NOT_RUNNING.to_string()).await?;
    Ok(())
}

/// Drives one build from scratch: registers a cancellation handle,
/// transitions through `Initializing`/`Running`, materializes
/// credentials, acquires a lease, invokes the build engine, releases the
/// lease, and publishes the terminal phase. Always removes the
/// cancellation handle on the way out.
pub async fn run_build(context: Arc<ContextData>, instance: Arc<BuildRequest>, key: Key) -> Result<(), Error> {
    let cancel = context.cancel_map.register(key.clone());
    let client = context.client.clone();

    let _permit = context
        .reconcile_limiter
        .acquire()
        .await
        .expect("reconcile limiter semaphore is never closed");

    let instance = transition(client.clone(), &instance, BuildPhase::Initializing, messages::INITIALIZING.to_string()).await?;

    let credentials = match materialize_credentials(client.clone(), &instance).await {
        Ok(c) => c,
        Err(e) => {
            fail(client.clone(), &instance, "CredentialsError", e.to_string()).await?;
            context.cancel_map.remove(&key);
            return Ok(());
        }
    };

    let worker_url = match context.lease_manager.acquire(&cancel, &instance.spec.owner_id).await {
        Ok(url) => url,
        Err(e) => {
            fail(client.clone(), &instance, "CapacityError", e.to_string()).await?;
            context.cancel_map.remove(&key);
            return Ok(());
        }
    };

    let instance = transition(client.clone(), &instance, BuildPhase::Running, messages::running(&worker_url)).await?;

    let invocation = BuildInvocation {
        context_url: instance.spec.context_url.clone(),
        images: instance.spec.images.clone(),
        build_args: instance.spec.build_args.clone(),
        disable_cache: instance.spec.disable_cache,
        auth_dir: credentials.auth_dir.path().to_string_lossy().into_owned(),
        secrets: credentials.secrets,
    };

    let started_at = chrono::Utc::now();
    let outcome = context.engine.build(invocation, cancel.clone()).await;

    if let Err(e) = context.lease_manager.release(&worker_url).await {
        eprintln!("failed to release lease for '{worker_url}': {e}");
    }

    match outcome {
        Ok(BuildOutcome { image_size }) => {
            succeed(client.clone(), &instance, image_size, chrono::Utc::now() - started_at).await?;
        }
        Err(e) if cancel.is_cancelled() && e.to_string().contains(CONTEXT_CANCELED_MARKER) => {
            // The BuildRequest was deleted mid-build; the broadcaster already
            // cancelled our context. No terminal phase to publish here.
        }
        Err(e) => {
            // Either the engine reported a real failure, or the pod backing
            // the lease was deleted out from under us without our own
            // context being cancelled; both are surfaced the same way.
            fail(client.clone(), &instance, "EngineError", e.to_string()).await?;
        }
    }

    context.cancel_map.remove(&key);
    Ok(())
}

/// Appends a `PhaseTransition` (when the phase actually changes) and
/// updates `status.phase`/`status.message`.
async fn transition(client: Client, instance: &BuildRequest, new_phase: BuildPhase, message: String) -> Result<BuildRequest, Error> {
    let updated = patch_status(client, instance, |status: &mut BuildRequestStatus| {
        let previous = status.phase;
        if previous != new_phase {
            status.transitions.push(PhaseTransition {
                previous,
                current: new_phase,
                occurred_at: chrono::Utc::now().to_rfc3339(),
                processed: false,
            });
        }
        status.phase = new_phase;
        status.message = Some(message);
    })
    .await?;
    Ok(updated)
}

async fn fail(client: Client, instance: &BuildRequest, reason: &str, message: String) -> Result<BuildRequest, Error> {
    let reason = reason.to_string();
    let updated = patch_status(client, instance, |status: &mut BuildRequestStatus| {
        let previous = status.phase;
        if previous != BuildPhase::Failed {
            status.transitions.push(PhaseTransition {
                previous,
                current: BuildPhase::Failed,
                occurred_at: chrono::Utc::now().to_rfc3339(),
                processed: false,
            });
        }
        status.phase = BuildPhase::Failed;
        status.message = Some(message.clone());
        status.conditions.push(Condition {
            type_: "Failed".to_string(),
            status: "True".to_string(),
            reason,
            message,
            last_transition_time: chrono::Utc::now().to_rfc3339(),
        });
    })
    .await?;
    Ok(updated)
}

async fn succeed(client: Client, instance: &BuildRequest, image_size: i64, build_time: chrono::Duration) -> Result<BuildRequest, Error> {
    let message = messages::succeeded(image_size);
    let updated = patch_status(client, instance, |status: &mut BuildRequestStatus| {
        let previous = status.phase;
        if previous != BuildPhase::Succeeded {
            status.transitions.push(PhaseTransition {
                previous,
                current: BuildPhase::Succeeded,
                occurred_at: chrono::Utc::now().to_rfc3339(),
                processed: false,
            });
        }
        status.phase = BuildPhase::Succeeded;
        status.message = Some(message);
        status.image_size = Some(image_size);
        status.build_time = Some(humantime::format_duration(build_time.to_std().unwrap_or_default()).to_string());
    })
    .await?;
    Ok(updated)
}

/// Materialized registry credentials and plain secret values for one build,
/// torn down (the temp directory removed) when dropped.
struct Credentials {
    auth_dir: tempfile::TempDir,
    secrets: BTreeMap<String, String>,
}

/// Fetches every `Secret` named by `spec.registryCredentials` and
/// `spec.secrets`, writing a Docker-style `config.json` into a fresh
/// temporary directory and collecting plain key/value secrets for the
/// engine invocation. The directory and its contents are removed when the
/// returned guard is dropped, i.e. once the build finishes.
async fn materialize_credentials(client: Client, instance: &BuildRequest) -> Result<Credentials, Error> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::InvalidInput("BuildRequest resource must be namespaced".to_string()))?;
    let api: Api<Secret> = Api::namespaced(client, &namespace);

    let mut auths = serde_json::Map::new();
    for cred in &instance.spec.registry_credentials {
        let secret = api
            .get(&cred.secret_ref.name)
            .await
            .map_err(|e| Error::Fatal(format!("fetching registry credential secret '{}': {e}", cred.secret_ref.name)))?;
        let username = secret_string(&secret, "username")?;
        let password = secret_string(&secret, "password")?;
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"));
        auths.insert(
            cred.registry.clone(),
            serde_json::json!({ "auth": auth }),
        );
    }

    let auth_dir = tempfile::tempdir().map_err(|e| Error::Fatal(format!("creating credentials directory: {e}")))?;
    let config = serde_json::json!({ "auths": auths });
    std::fs::write(auth_dir.path().join("config.json"), config.to_string())
        .map_err(|e| Error::Fatal(format!("writing docker config: {e}")))?;

    let mut secrets = BTreeMap::new();
    for secret_ref in &instance.spec.secrets {
        let secret = api
            .get(&secret_ref.name)
            .await
            .map_err(|e| Error::Fatal(format!("fetching secret '{}': {e}", secret_ref.name)))?;
        let value = secret_string(&secret, &secret_ref.key)?;
        secrets.insert(secret_ref.key.clone(), value);
    }

    Ok(Credentials { auth_dir, secrets })
}

fn secret_string(secret: &Secret, key: &str) -> Result<String, Error> {
    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .ok_or_else(|| Error::Fatal(format!("secret '{}' has no key '{key}'", secret.name_any())))?;
    String::from_utf8(bytes.0.clone()).map_err(|e| Error::Fatal(format!("secret value for '{key}' is not valid UTF-8: {e}")))
}
