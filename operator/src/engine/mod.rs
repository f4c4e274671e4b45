//! The build engine seam: a small `async_trait` client the dispatcher
//! invokes to actually run a build. The production implementation talks
//! to a remote daemon over a `tonic` channel; tests use an in-memory fake.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::util::Error;

/// Everything the build engine needs to run one build.
#[derive(Debug, Clone)]
pub struct BuildInvocation {
    pub context_url: String,
    pub images: Vec<String>,
    pub build_args: BTreeMap<String, String>,
    pub disable_cache: bool,
    /// Path to a directory holding materialized registry credentials
    /// (e.g. a `.docker/config.json`), prepared by the dispatcher before
    /// the engine is invoked.
    pub auth_dir: String,
    pub secrets: BTreeMap<String, String>,
}

/// The outcome of a successful build.
#[derive(Debug, Clone, Copy)]
pub struct BuildOutcome {
    pub image_size: i64,
}

/// Substring the build engine's transport is documented to include in a
/// context-cancellation error; the dispatcher uses this, not the error's
/// type, to distinguish "caller cancelled" from "the build failed".
pub const CONTEXT_CANCELED_MARKER: &str = "context canceled";

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Runs a build to completion or failure. `cancel` is observed for the
    /// duration of the call; on cancellation the call unwinds with an
    /// error whose message contains [`CONTEXT_CANCELED_MARKER`].
    async fn build(&self, invocation: BuildInvocation, cancel: CancellationToken) -> Result<BuildOutcome, Error>;
}

pub mod grpc;

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// A scripted engine for dispatcher tests: returns a fixed outcome,
    /// error, or waits for cancellation, depending on configuration.
    pub enum Script {
        Succeed(BuildOutcome),
        Fail(String),
        /// Waits for the supplied `CancellationToken` to cancel, then
        /// returns an error containing [`CONTEXT_CANCELED_MARKER`].
        WaitForCancellation,
    }

    pub struct FakeEngine {
        script: Mutex<Option<Script>>,
    }

    impl FakeEngine {
        pub fn new(script: Script) -> Self {
            FakeEngine {
                script: Mutex::new(Some(script)),
            }
        }
    }

    #[async_trait]
    impl EngineClient for FakeEngine {
        async fn build(&self, _invocation: BuildInvocation, cancel: CancellationToken) -> Result<BuildOutcome, Error> {
            let script = self.script.lock().unwrap().take();
            match script {
                Some(Script::Succeed(outcome)) => Ok(outcome),
                Some(Script::Fail(message)) => Err(Error::Fatal(message)),
                Some(Script::WaitForCancellation) | None => {
                    cancel.cancelled().await;
                    Err(Error::Transient(CONTEXT_CANCELED_MARKER.to_string()))
                }
            }
        }
    }
}
