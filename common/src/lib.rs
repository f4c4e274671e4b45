pub mod shutdown;

use std::path::Path;

/// Path to the readiness file a Kubernetes `exec`/`httpGet` probe can
/// check for. Written once by [`signal_ready`] after the process has
/// completed whatever startup handshake it needs.
const READY_FILE: &str = "/tmp/ready";

/// Performs process-wide setup that every binary in this workspace wants:
/// disables ANSI colors when requested via `NO_COLOR`/`DISABLE_COLORS`, and
/// makes sure an inherited readiness file from a previous container run
/// doesn't make a fresh, not-yet-ready process look live.
pub fn init() {
    if std::env::var_os("NO_COLOR").is_some() || std::env::var_os("DISABLE_COLORS").is_some() {
        owo_colors::set_override(false);
    }
    let _ = std::fs::remove_file(READY_FILE);
}

/// Marks the process as ready by creating [`READY_FILE`]. Idempotent and
/// safe to call more than once (e.g. on every successful leader-election
/// acquisition).
pub fn signal_ready() {
    if Path::new(READY_FILE).parent().is_some_and(|p| p.exists()) {
        let _ = std::fs::write(READY_FILE, b"ok");
    }
}
