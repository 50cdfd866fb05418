use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Live link between one session's broadcast channel and a client callback.
///
/// Dropping the subscription has the same effect as `unsubscribe`: the
/// forwarding task and anything spawned alongside it stop at their next
/// await point.
pub struct Subscription {
    session_id: String,
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(session_id: String, cancel_token: CancellationToken) -> Self {
        Self {
            session_id,
            cancel_token,
            handles: Vec::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    /// Run `task` for as long as this subscription lives. The task receives a
    /// token that fires on unsubscribe.
    pub fn spawn_linked<F, Fut>(&mut self, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(self.cancel_token.child_token()));
        self.handles.push(handle);
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        self.cancel_token.cancel();
        // Handles are detached, not aborted: a callback already running
        // finishes, but no new snapshot is delivered.
        self.handles.clear();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
