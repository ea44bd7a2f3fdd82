//! # Retry Policy
//!
//! Per-event exponential backoff for hub delivery.
//!
//! ```text
//!   attempt:   1     2     3     4     5    ...    n
//!   ceiling:   b    2b    4b    8b   16b   ...  min(cap, b·2^(n-1))
//!   delay:     ceiling/2 + jitter·ceiling/2
//! ```
//!
//! Jitter is passed in as a sample in `[0, 1)` so the arithmetic stays
//! deterministic under test; the agent draws it from `rand`.

use std::time::Duration;

/// Exponential backoff with a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            base,
            cap: cap.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// Upper bound of the delay after the `attempt`-th failed attempt.
    ///
    /// `attempt` is 1-based; 0 is treated as 1.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;

        self.base
            .checked_mul(factor)
            .map_or(self.cap, |delay| delay.min(self.cap))
    }

    /// Delay after the `attempt`-th failure, with `jitter` in `[0, 1)`.
    ///
    /// Half of the ceiling is fixed and half is jittered, so the delay never
    /// collapses to zero while devices restarted together still spread out.
    pub fn delay(&self, attempt: u32, jitter: f64) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter = jitter.clamp(0.0, 1.0);

        half + half.mul_f64(jitter)
    }
}
