use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::transport::TransportError;

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; grows with every call.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.config.initial_backoff_ms as f64
            * self.config.multiplier.max(1.0).powi(self.attempt.min(32) as i32);
        let capped = base.min(self.config.max_backoff_ms as f64) as u64;
        self.attempt = self.attempt.saturating_add(1);
        jittered(capped, self.config.jitter_ratio)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Shave a random fraction (up to `ratio`) off `delay_ms`.
fn jittered(delay_ms: u64, ratio: f64) -> Duration {
    let spread = (delay_ms as f64 * ratio.clamp(0.0, 1.0)) as u64;
    if spread == 0 {
        return Duration::from_millis(delay_ms);
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(delay_ms - rng.gen_range(0..=spread))
}

#[derive(Debug)]
pub enum RetryError {
    /// Shutdown was requested before the call succeeded.
    Cancelled,
    /// The peer answered with an error retrying cannot fix.
    Permanent(TransportError),
}

/// Call `op` until it succeeds, fails permanently, or `token` is cancelled.
/// Transient failures are retried after a backoff delay.
pub async fn retry_transient<T, F, Fut>(
    what: &str,
    config: &RetryConfig,
    token: &CancellationToken,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut backoff = Backoff::new(config.clone());
    loop {
        if token.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    call = what,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Call failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(RetryError::Permanent(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryConfig {
        RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut backoff = Backoff::new(RetryConfig {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            multiplier: 2.0,
            jitter_ratio: 0.0,
        });
        let delays: Vec<u64> = (0..6).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        for _ in 0..100 {
            let d = jittered(1_000, 0.2).as_millis();
            assert!((800..=1_000).contains(&d), "delay {} out of range", d);
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result = retry_transient("test", &fast(), &token, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(TransportError::Timeout {
                        url: "http://m/".to_string(),
                    })
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<(), _> = retry_transient("test", &fast(), &token, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(TransportError::Status {
                    url: "http://m/".to_string(),
                    status: 400,
                    body: "bad".to_string(),
                })
            }
        })
        .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_retrying() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<(), _> = retry_transient("test", &fast(), &token, || async {
            Err(TransportError::Timeout {
                url: "http://m/".to_string(),
            })
        })
        .await;
        assert!(matches!(result, Err(RetryError::Cancelled)));
    }
}
