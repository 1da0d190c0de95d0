use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::time::Instant;

const FIRST_DELAY: Duration = Duration::from_millis(25);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Calls `check` until it yields a value, backing off from 25ms to 1s
/// between calls. Errors from `check` end the wait immediately.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let mut delay = FIRST_DELAY;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(value) = check().await.with_context(|| format!("check {what}"))? {
            return Ok(value);
        }
        let elapsed = started.elapsed();
        anyhow::ensure!(
            elapsed < timeout,
            "timed out after {elapsed:?} ({attempts} checks) waiting for {what}"
        );
        tokio::time::sleep(delay.min(timeout - elapsed)).await;
        delay = (delay * 2).min(MAX_DELAY);
    }
}
