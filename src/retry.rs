//! Bounded retry with exponential backoff for piece I/O.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Retry policy applied to piece download and decode.
///
/// Only transient errors (I/O, storage, Parquet decode) are retried. When
/// attempts run out the last error is wrapped in
/// [`Error::PieceUnavailable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// attempts are exhausted.
    ///
    /// # Errors
    ///
    /// Non-transient errors are returned unchanged. Transient errors that
    /// persist through every attempt become [`Error::PieceUnavailable`].
    pub fn run<T>(&self, piece: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let max_attempts = self.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.base_delay_ms);
        let max_backoff = Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms));
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(piece, attempt, error = %e, "giving up on piece");
                    return Err(Error::piece_unavailable(piece, attempt, e));
                }
                Err(e) => {
                    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
                    let delay = backoff.mul_f64(jitter);
                    tracing::warn!(
                        "Piece '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                        piece,
                        attempt,
                        max_attempts,
                        delay.as_millis(),
                        e
                    );
                    std::thread::sleep(delay);
                    backoff = std::cmp::min(backoff * 2, max_backoff);
                }
            }
        }
    }
}
