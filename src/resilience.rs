// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff for transient failures.
//!
//! Source reads are retried forever. [`RetryConfig`] bounds the delay, never
//! the number of attempts.
//!
//! # Backoff Schedule (defaults)
//!
//! ```text
//! Attempt  Delay
//! -------  -----
//! 1        100ms
//! 2        200ms
//! 3        400ms
//! ...
//! 10+      30s (cap)
//! ```

use std::time::Duration;
use tokio::sync::watch;

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Fast retry for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(20),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }

        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Sleep for `delay` unless the shutdown flag is raised first.
///
/// Returns `false` when woken by shutdown.
pub async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    tokio::select! {
        biased;
        changed = shutdown.changed() => {
            // A dropped sender counts as shutdown.
            changed.is_ok() && !*shutdown.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}
