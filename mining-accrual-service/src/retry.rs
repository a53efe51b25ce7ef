use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff with a little jitter. The last error is
/// returned once attempts are exhausted; the caller decides what exhaustion
/// means for its own state machine.
pub async fn retry_with_backoff<T, E, F, Fut>(
    op_name: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts {
                    warn!(
                        "{} failed after {} attempts: {}",
                        op_name, max_attempts, error
                    );
                    return Err(error);
                }
                let backoff = base_delay * 2u32.saturating_pow(attempt - 1);
                let jitter_ceiling = (backoff.as_millis() as u64 / 4).max(1);
                let jitter = rand::thread_rng().gen_range(0..jitter_ceiling);
                warn!(
                    "{} attempt {} failed: {}; retrying in {:?}",
                    op_name, attempt, error, backoff
                );
                sleep(backoff + Duration::from_millis(jitter)).await;
            }
        }
    }
}
