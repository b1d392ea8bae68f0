//! Bounded fan-out of independent tasks.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Run `task` for every item with at most `workers` running at once.
///
/// Each task yields `Some(result)` or `None`; a panicking task counts as
/// `None` and never affects its siblings. Results are returned in completion
/// order once all tasks have finished. `on_done` is called after each task.
pub async fn fan_out<I, T, R, F, Fut>(items: I, workers: usize, task: F, mut on_done: impl FnMut()) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Option<R>> + Send + 'static,
    R: Send + 'static,
{
    let permits = Arc::new(Semaphore::new(workers.max(1)));
    let mut set = JoinSet::new();

    for item in items {
        let permits = Arc::clone(&permits);
        let fut = task(item);
        set.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            fut.await
        });
    }

    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        on_done();
        match joined {
            Ok(Some(result)) => results.push(result),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "worker task aborted"),
        }
    }
    results
}
