use std::fmt::Display;
use std::future::Future;

use tracing::{debug, warn};

use chatline_gateway::backoff::RetryPolicy;

/// Last error of an operation that used up its retries.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    /// Total attempts made, the first one included.
    pub attempts: u32,
}

/// Runs `f` until it succeeds or `policy.max_retries` retries have failed,
/// sleeping with jittered exponential backoff in between.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: &str, mut f: F) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(op, retries = attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) if attempt >= policy.max_retries => {
                return Err(Exhausted {
                    error,
                    attempts: attempt.saturating_add(1),
                });
            }
            Err(error) => {
                attempt += 1;
                let delay = policy.jittered(attempt);
                warn!(op, attempt, ?delay, "attempt failed: {}", error);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
