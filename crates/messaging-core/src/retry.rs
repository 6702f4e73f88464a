use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms: max_delay_ms.max(base_delay_ms),
        }
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32, retry_after_hint_ms: Option<u64>) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        let hinted = retry_after_hint_ms.unwrap_or(0);
        let bounded = calculated.max(hinted).min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000)
    }
}

/// Failure bookkeeping for one chat session under an explicit retry policy.
#[derive(Debug, Clone, Default)]
pub struct SessionBackoff {
    failures: u32,
    not_before: Option<Instant>,
}

impl SessionBackoff {
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Whether the session may be fetched at `now`.
    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|deadline| now >= deadline)
    }

    /// Record a transient failure and return how long the session sits out.
    pub fn record_failure(
        &mut self,
        policy: &RetryPolicy,
        now: Instant,
        retry_after_hint_ms: Option<u64>,
    ) -> Duration {
        let delay = policy.delay_for_attempt(self.failures, retry_after_hint_ms);
        self.failures = self.failures.saturating_add(1);
        self.not_before = Some(now + delay);
        delay
    }
}
