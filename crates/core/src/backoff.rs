//! Exponential backoff with jitter, capped.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// `None` retries forever (while the caller's context is live).
    pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { base: Duration::from_millis(250), cap: Duration::from_secs(30), max_attempts: None }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    /// Never exceeds `policy.cap`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        let exp = self.attempt.min(20);
        self.attempt = self.attempt.saturating_add(1);
        let raw = self.policy.base.saturating_mul(1u32 << exp);
        let capped = raw.min(self.policy.cap);
        let half = capped / 2;
        let spread = (capped - half).as_millis() as u64;
        let jitter = if spread == 0 { 0 } else { rand::rng().random_range(0..=spread) };
        Some((half + Duration::from_millis(jitter)).min(self.policy.cap))
    }

    /// Sleep for the next delay unless the token fires first.
    pub async fn wait(&mut self, token: &CancellationToken) -> Result<()> {
        let delay = self
            .next_delay()
            .ok_or_else(|| Error::TransientApi(format!("retries exhausted after {} attempts", self.attempt)))?;
        tokio::select! {
            _ = token.cancelled() => Err(Error::ContextCancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_cap() {
        let policy = BackoffPolicy { base: Duration::from_millis(100), cap: Duration::from_secs(2), max_attempts: None };
        let mut b = Backoff::new(policy);
        for _ in 0..200 {
            let d = b.next_delay().unwrap();
            assert!(d <= Duration::from_secs(2), "delay {:?} exceeded cap", d);
        }
    }

    #[test]
    fn delay_grows_until_cap() {
        let policy = BackoffPolicy { base: Duration::from_millis(100), cap: Duration::from_secs(30), max_attempts: None };
        let mut b = Backoff::new(policy);
        let first = b.next_delay().unwrap();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));
        for _ in 0..4 {
            b.next_delay();
        }
        // attempt 5: raw 3.2s, jittered into [1.6s, 3.2s]
        let later = b.next_delay().unwrap();
        assert!(later >= Duration::from_millis(1600) && later <= Duration::from_millis(3200));
    }

    #[test]
    fn attempts_exhaust() {
        let mut b = Backoff::new(BackoffPolicy::default().with_max_attempts(2));
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_none());
        b.reset();
        assert!(b.next_delay().is_some());
    }

    #[tokio::test]
    async fn wait_observes_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let mut b = Backoff::new(BackoffPolicy { base: Duration::from_secs(10), cap: Duration::from_secs(10), max_attempts: None });
        assert_eq!(b.wait(&token).await, Err(Error::ContextCancelled));
    }
}
