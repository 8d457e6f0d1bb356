use crate::cache::DistributedCacheService;
use crate::error::Result;
use crate::sync::SyncReport;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

/// Retry `action` until `predicate` accepts its result or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(20);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        sleep(interval).await;
    }
    None
}

/// Wait for an async condition with timeout.
pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    wait_for_result(&mut condition, |ok| *ok, timeout).await.is_some()
}

/// Run a synchronization pass that starts now.
///
/// A background pass may already be running; keep asking until ours runs.
pub async fn synchronize_now(cache: &DistributedCacheService) -> Result<SyncReport> {
    loop {
        if let Some(report) = cache.synchronize().await? {
            return Ok(report);
        }
        sleep(Duration::from_millis(10)).await;
    }
}
