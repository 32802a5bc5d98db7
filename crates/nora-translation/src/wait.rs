//! Bounded polling shared by the readiness wait and the owner-kill wait.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Evaluate `predicate` until it returns `true` or `patience` runs out.
///
/// The predicate is always evaluated at least once, and once more after the
/// last sleep, so a zero patience still gets a single check. Sleeps never
/// overshoot the remaining budget. Returns whether the predicate succeeded.
pub async fn poll_until<F, Fut>(mut predicate: F, patience: Duration, interval: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    loop {
        if predicate().await {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= patience {
            return false;
        }
        tokio::time::sleep(interval.min(patience - elapsed)).await;
    }
}
