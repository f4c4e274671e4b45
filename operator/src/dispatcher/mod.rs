//! The `BuildRequest` reconciler: sequences credential materialization,
//! lease acquisition, the build-engine call, lease release, and phase
//! publication for a single build, and owns the process-wide leader
//! election / controller bootstrap loop.

pub mod actions;
pub mod reconcile;

pub use reconcile::{ContextData, RunConfig, run};
