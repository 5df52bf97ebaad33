//! Event handler spawning with panic containment.

use std::future::Future;

use tracing::error;

/// Run one event handler on its own task. A panicking handler takes down
/// only itself; the dispatcher keeps draining its subscription.
pub(crate) fn spawn_handler<F>(name: &'static str, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(handler = name, error = %e, "Event handler panicked");
            }
        }
    });
}
