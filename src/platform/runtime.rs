use std::future::Future;
use std::time::Duration;

use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};

static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(err) => {
            log::error!("failed to build background tokio runtime: {err}");
            None
        }
    }
});

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when called from inside one and a lazily
/// built shared runtime otherwise.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

/// Yields to the scheduler once so other queued tasks can make progress.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}
