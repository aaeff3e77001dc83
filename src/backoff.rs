//! Deterministic exponential backoff.
//!
//! The delay before retry `n` (1-based) is `start * 2^(n-1)`, capped at `max`.
//! There is no randomization, so a policy always produces the same sequence.

use std::time::Duration;

const MAX_EXPONENT: u32 = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    start: Duration,
    max: Duration,
    budget: Option<Duration>,
}

impl Backoff {
    pub const MULTIPLIER: u32 = 2;

    pub fn new(start: Duration, max: Duration) -> Self {
        let start = start.max(Duration::from_millis(1));
        Self {
            start,
            max: max.max(start),
            budget: None,
        }
    }

    /// Total elapsed time after which the sequence reports exhaustion.
    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn start(&self) -> Duration {
        self.start
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn budget(&self) -> Option<Duration> {
        self.budget
    }

    /// Delay before the given 1-based retry, ignoring the budget.
    pub fn delay(&self, retry: usize) -> Duration {
        let exponent = (retry.saturating_sub(1) as u64).min(MAX_EXPONENT as u64) as u32;
        self.start
            .saturating_mul(Self::MULTIPLIER.saturating_pow(exponent))
            .min(self.max)
    }

    /// Delay before the given 1-based retry, or `None` once waiting it would
    /// push the elapsed time past the budget.
    pub fn next_delay(&self, retry: usize, elapsed: Duration) -> Option<Duration> {
        let delay = self.delay(retry);
        match self.budget {
            Some(budget) if elapsed.saturating_add(delay) > budget => None,
            _ => Some(delay),
        }
    }

    /// The unbounded delay sequence, starting with retry 1.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..).map(|retry| self.delay(retry))
    }
}
