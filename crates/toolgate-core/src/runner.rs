//! Cancellable task ownership: a spawned task paired with its cancellation
//! token, joined deterministically on shutdown.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned task bound to a [`CancellationToken`]. Dropping the runner does
/// not abort the task; call [`TaskRunner::stop_and_join`] to cancel and wait
/// for an orderly exit.
pub struct TaskRunner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl TaskRunner {
    /// Spawns `task`, handing it a clone of `token`. The task is expected to
    /// watch the token at its suspend points and return promptly once it is
    /// cancelled.
    pub fn spawn<F, Fut>(token: CancellationToken, task: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task(token.clone()));
        Self { token, handle }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Trips the token and awaits the task.
    pub async fn stop_and_join(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
