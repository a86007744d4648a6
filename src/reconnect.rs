//! Delay/retry policy shared by the upstream link and the downstream listener.
//!
//! The default shape is one fixed delay followed by exactly one attempt. Each
//! independent failure re-enters the same cycle; nothing here counts how often
//! that happens. [`Reconnector::attempts`] and [`Reconnector::capped_backoff`]
//! widen the policy when configured, without changing the default.

use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::BridgeError;

pub const DEFAULT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Reconnector {
    delay: Duration,
    attempts: u32,
    max_delay: Option<Duration>,
}

impl Default for Reconnector {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY)
    }
}

impl Reconnector {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            attempts: 1,
            max_delay: None,
        }
    }

    /// Attempts made per failure. Values below one are treated as one.
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Double the delay after every failed attempt, never exceeding `max_delay`.
    pub fn capped_backoff(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay.max(self.delay));
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Delay before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.max_delay {
            None => self.delay,
            Some(max) => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                self.delay.saturating_mul(factor).min(max)
            }
        }
    }

    /// Sleep for the base delay. Returns `false` if cancelled first.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }

    /// Run `op` after the policy's delay, up to the configured number of attempts.
    ///
    /// Returns `None` once every attempt failed or `cancel` fired. Failures are
    /// logged here; the caller decides what a give-up means.
    pub async fn retry<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        for attempt in 0..self.attempts {
            let wait = self.delay_for(attempt);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                wait,
                attempt + 1,
                self.attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(wait) => {}
            }

            match op().await {
                Ok(value) => return Some(value),
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt + 1, e),
            }
        }
        None
    }
}
