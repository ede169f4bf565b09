//! Helpers for running blocking work off the async loop.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run `f` on the blocking thread pool and wait for it.
///
/// State persistence takes a file lock and does file I/O, so the scheduler
/// never calls it on the thread that polls task bodies.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
