/// Error taxonomy used throughout the operator. Each variant corresponds to
/// one of the five error kinds that drive retry/terminal-failure policy:
/// `Cancelled` and `Transient` are retried, `NoCapacity` is surfaced to the
/// lease caller, `InvalidInput`/`Fatal` end the build.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// The calling context was cancelled before the operation completed.
    #[error("operation cancelled")]
    Cancelled,

    /// A transient failure from the orchestrator or an internal race that
    /// the next tick or retry is expected to resolve.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A scale-up was attempted but no usable pod appeared before the
    /// configured deadline.
    #[error("no builder capacity available: {0}")]
    NoCapacity(String),

    /// The caller supplied something malformed: an address, a URL, a spec
    /// field. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The build itself failed, or preparing to run it failed
    /// unrecoverably. Terminal for the owning `BuildRequest`.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("duration out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("failed to parse url: {source}")]
    Url {
        #[from]
        source: url::ParseError,
    },

    #[error("build engine call failed: {source}")]
    Engine {
        #[from]
        source: tonic::Status,
    },
}

impl Error {
    /// Whether retrying the same reconcile is pointless — the input itself
    /// is wrong rather than the cluster being in a transient state. Used to
    /// back the requeue interval off instead of hot-looping on an error that
    /// will never clear on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Fatal(_) | Error::InvalidInput(_))
    }
}
