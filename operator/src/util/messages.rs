/// `status.message` when a build is marked `Failed` because the controller
/// restarted while it was `Initializing`/`Running` and holds no live
/// cancellation handle for it.
pub const NOT_RUNNING: &str = "No active build found for this resource; it was likely orphaned by a controller restart.";

/// `status.message` while a build is acquiring a lease and materializing credentials.
pub const INITIALIZING: &str = "Acquiring a builder and preparing credentials.";

/// `status.message` once the build engine has been invoked.
pub fn running(worker_url: &str) -> String {
    format!("Build is running on '{worker_url}'.")
}

/// `status.message` on success.
pub fn succeeded(image_size: i64) -> String {
    format!("Build succeeded, produced image of {image_size} bytes.")
}
