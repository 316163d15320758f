//! Retry policy for transient failures.
//!
//! Only source acquisition retries. Everything else fails fast.

use std::future::Future;
use std::time::Duration;

/// Attempts, backoff between attempts, and a cleanup hook run after each
/// failed attempt (before the backoff sleep).
pub struct RetryPolicy<'a> {
    pub attempts: u32,
    pub backoff: Box<dyn Fn(u32) -> Duration + Send + Sync + 'a>,
    pub cleanup: Box<dyn Fn(u32) + Send + Sync + 'a>,
}

/// Last error plus the number of attempts used.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: E,
}

impl<'a> RetryPolicy<'a> {
    /// `attempts` tries with linear backoff of `attempt × step`.
    pub fn linear(attempts: u32, step: Duration) -> Self {
        RetryPolicy {
            attempts: attempts.max(1),
            backoff: Box::new(move |attempt| step * attempt),
            cleanup: Box::new(|_| {}),
        }
    }

    /// Policy for fetching the runtime source: 3 attempts, 2s × attempt.
    pub fn source_acquisition() -> Self {
        Self::linear(3, Duration::from_secs(2))
    }

    pub fn with_cleanup(mut self, cleanup: impl Fn(u32) + Send + Sync + 'a) -> Self {
        self.cleanup = Box::new(cleanup);
        self
    }

    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'a) -> Self {
        self.backoff = Box::new(backoff);
        self
    }

    /// Run `op` until it succeeds or attempts run out. `op` receives the
    /// 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<(T, u32), RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if attempt >= self.attempts => {
                    log::error!(
                        "[Retry] [{}] attempt {}/{} failed: {}",
                        label,
                        attempt,
                        self.attempts,
                        e
                    );
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: e,
                    });
                }
                Err(e) => {
                    let wait = (self.backoff)(attempt);
                    log::warn!(
                        "[Retry] [{}] attempt {}/{} failed: {} (retrying in {}s)",
                        label,
                        attempt,
                        self.attempts,
                        e,
                        wait.as_secs()
                    );
                    (self.cleanup)(attempt);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
