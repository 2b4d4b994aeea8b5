//! Bounded retry with a fixed pause between attempts.
//!
//! Used by every probe that is allowed to try more than once: name
//! resolution, wake-on-lan, the ssh port and the ssh handshake.

use std::future::Future;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,

    /// Pause after a failed attempt.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Same policy with no pause between attempts.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self::fixed(max_attempts, Duration::ZERO)
    }

    pub const fn with_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Run `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// when every attempt failed. A policy with zero attempts still runs `op`
    /// once.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => return Err(e),
                Err(_) => {
                    debug!(attempt, max_attempts = attempts, delay_ms = self.delay.as_millis() as u64, "Attempt failed, retrying");
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
