use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;
pub(crate) mod messages;

mod error;

pub use error::*;

/// The default interval for requeuing a managed resource.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Name of the kubernetes resource manager, used as the field-manager
/// identity on every server-side-apply call this controller issues.
pub(crate) const MANAGER_NAME: &str = "buildctl-operator";

/// Domain label prefix shared by every annotation this controller owns.
pub(crate) const GROUP: &str = "buildctl.io";
