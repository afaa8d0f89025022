//! Retry and polling budgets.

use std::time::Duration;

use anyhow::{Result, anyhow};

/// Delay before retry `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exp).unwrap_or(max).min(max)
}

/// Bounded counter for CI polls and fix attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    label: &'static str,
    limit: u32,
    used: u32,
}

impl Budget {
    pub fn new(label: &'static str, limit: u32) -> Self {
        Self {
            label,
            limit,
            used: 0,
        }
    }

    /// Consume one unit, erroring once the limit is exhausted.
    pub fn spend(&mut self) -> Result<u32> {
        if self.used >= self.limit {
            return Err(anyhow!("{} budget exhausted after {}", self.label, self.limit));
        }
        self.used += 1;
        Ok(self.used)
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}
