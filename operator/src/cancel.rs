//! Process-wide cancellation map keyed by `(namespace, name)`, and the
//! router that consumes delete notifications and cancels the matching
//! in-flight build, if any.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type Key = (String, String);

/// Holds one cancellation handle per in-flight build. A miss (the key was
/// never registered, or already removed) is not an error: a delete signal
/// can legitimately arrive after the build already finished.
#[derive(Default)]
pub struct CancellationMap {
    handles: Mutex<HashMap<Key, CancellationToken>>,
}

impl CancellationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh cancellation handle for `key`, returning it.
    pub fn register(&self, key: Key) -> CancellationToken {
        let token = CancellationToken::new();
        self.handles.lock().unwrap().insert(key, token.clone());
        token
    }

    /// Whether a build is currently registered for `key`. Used by the
    /// crash-recovery check: a resource observed `Initializing`/`Running`
    /// with no live handle was orphaned by a controller restart.
    pub fn contains(&self, key: &Key) -> bool {
        self.handles.lock().unwrap().contains_key(key)
    }

    /// Removes and cancels the handle for `key`, if present. Idempotent.
    pub fn cancel(&self, key: &Key) {
        if let Some(token) = self.handles.lock().unwrap().remove(key) {
            token.cancel();
        }
    }

    /// Removes the handle for `key` without cancelling it, once a build
    /// has run to completion on its own.
    pub fn remove(&self, key: &Key) {
        self.handles.lock().unwrap().remove(key);
    }
}

/// Spawns the router task: consumes `(namespace, name)` keys emitted
/// whenever a `BuildRequest` is observed deleted, and cancels the matching
/// in-flight build if one is registered.
pub fn spawn_router(map: std::sync::Arc<CancellationMap>, mut deletes: mpsc::UnboundedReceiver<Key>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(key) = deletes.recv().await {
            map.cancel(&key);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancelling_an_unknown_key_is_a_harmless_no_op() {
        let map = CancellationMap::new();
        map.cancel(&("ns".to_string(), "missing".to_string()));
    }

    #[tokio::test]
    async fn registered_handle_observes_cancellation() {
        let map = CancellationMap::new();
        let key = ("ns".to_string(), "build-a".to_string());
        let token = map.register(key.clone());
        assert!(map.contains(&key));
        map.cancel(&key);
        assert!(token.is_cancelled());
        assert!(!map.contains(&key));
    }

    #[tokio::test]
    async fn router_cancels_the_matching_handle() {
        let map = std::sync::Arc::new(CancellationMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let task = spawn_router(map.clone(), rx);
        let key = ("ns".to_string(), "build-a".to_string());
        let token = map.register(key.clone());
        tx.send(key).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), token.cancelled())
            .await
            .expect("router should cancel the handle promptly");
        drop(tx);
        task.await.unwrap();
    }
}
