use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// A reference to a single key in a `Secret`, mirroring the shape of
/// `k8s_openapi::api::core::v1::SecretKeySelector` without pulling in
/// an optional field for the selector's own optionality.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// A single registry credential to materialize before invoking the build
/// engine. `registry` is matched against the image reference's host.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct RegistryCredentialRef {
    pub registry: String,

    #[serde(rename = "secretRef")]
    pub secret_ref: SecretKeyRef,
}

/// Overrides for the phase-transition broker a downstream collaborator
/// consumes. The operator only stamps these through; it never dials out.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct BrokerOverrides {
    pub topic: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "buildctl.io",
    version = "v1",
    kind = "BuildRequest",
    plural = "buildrequests",
    derive = "PartialEq",
    status = "BuildRequestStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.phase\", \"name\": \"PHASE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastUpdated\", \"name\": \"AGE\", \"type\": \"date\" }"
)]
pub struct BuildRequestSpec {
    /// Caller-supplied identity stamped onto the lease this build holds,
    /// for audit purposes. Not interpreted by the controller otherwise.
    #[serde(rename = "ownerId")]
    pub owner_id: String,

    /// URL of the build context (tarball or git ref) that the build engine fetches.
    #[serde(rename = "contextUrl")]
    pub context_url: String,

    /// Fully qualified image references to tag and push on success.
    pub images: Vec<String>,

    /// Build arguments forwarded verbatim to the build engine.
    #[serde(rename = "buildArgs", default)]
    pub build_args: BTreeMap<String, String>,

    /// Registry credentials to materialize before the build starts.
    #[serde(rename = "registryCredentials", default)]
    pub registry_credentials: Vec<RegistryCredentialRef>,

    #[serde(rename = "brokerOverrides", default)]
    pub broker_overrides: Option<BrokerOverrides>,

    /// Arbitrary secret key/value pairs to mount for the duration of the build.
    #[serde(default)]
    pub secrets: Vec<SecretKeyRef>,

    #[serde(rename = "disableCache", default)]
    pub disable_cache: bool,
}

/// One entry in a [`BuildRequestStatus`]'s condition list, following the
/// conventional Kubernetes condition shape.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: String,
}

/// A single entry in the append-only phase transition log. `processed`
/// is left `false` until an external collaborator acknowledges having
/// published the transition; the controller itself never reads it back.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct PhaseTransition {
    pub previous: BuildPhase,
    pub current: BuildPhase,
    #[serde(rename = "occurredAt")]
    pub occurred_at: String,
    #[serde(default)]
    pub processed: bool,
}

/// Status object for the [`BuildRequest`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct BuildRequestStatus {
    /// A short description of the [`BuildRequest`] resource's current state.
    #[serde(default)]
    pub phase: BuildPhase,

    /// A human-readable message indicating details about why the
    /// [`BuildRequest`] is in this phase.
    pub message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Append-only log of every phase transition this resource has undergone.
    #[serde(default)]
    pub transitions: Vec<PhaseTransition>,

    /// Wall-clock duration of the build, set once it reaches a terminal phase.
    #[serde(rename = "buildTime")]
    pub build_time: Option<String>,

    /// Size in bytes of the produced image, set on success.
    #[serde(rename = "imageSize")]
    pub image_size: Option<i64>,

    /// Timestamp of when the [`BuildRequestStatus`] object was last updated.
    #[serde(rename = "lastUpdated")]
    pub last_updated: Option<String>,
}

/// A short description of the [`BuildRequest`] resource's current state.
///
/// The empty phase (`∅` in design notes) is represented by the absence of a
/// `status` subresource entirely, not by a variant of this enum: a freshly
/// created [`BuildRequest`] has `status: None`, and [`BuildPhase::default`]
/// (`Initializing`) is only ever observed once the controller has written
/// a status for the first time.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum BuildPhase {
    #[default]
    Initializing,

    Running,

    Succeeded,

    Failed,
}

impl BuildPhase {
    /// Whether this phase is terminal; no further transitions may be appended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildPhase::Succeeded | BuildPhase::Failed)
    }
}

impl FromStr for BuildPhase {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initializing" => Ok(BuildPhase::Initializing),
            "Running" => Ok(BuildPhase::Running),
            "Succeeded" => Ok(BuildPhase::Succeeded),
            "Failed" => Ok(BuildPhase::Failed),
            _ => Err(()),
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Initializing => write!(f, "Initializing"),
            BuildPhase::Running => write!(f, "Running"),
            BuildPhase::Succeeded => write!(f, "Succeeded"),
            BuildPhase::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_its_string_form() {
        for phase in [
            BuildPhase::Initializing,
            BuildPhase::Running,
            BuildPhase::Succeeded,
            BuildPhase::Failed,
        ] {
            let s = phase.to_string();
            assert_eq!(BuildPhase::from_str(&s).unwrap(), phase);
        }
    }

    #[test]
    fn only_succeeded_and_failed_are_terminal() {
        assert!(!BuildPhase::Initializing.is_terminal());
        assert!(!BuildPhase::Running.is_terminal());
        assert!(BuildPhase::Succeeded.is_terminal());
        assert!(BuildPhase::Failed.is_terminal());
    }
}
