// retry.rs — RetryPolicy: retry-with-backoff vs. permanent failure.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Why an attempt failed. Drives whether a retry is worth making.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The execution exceeded its timeout.
    Timeout,
    /// A resource the execution needed was unavailable or broke.
    Resource,
    /// The executor reported a failure.
    Execution,
    /// The attempt's outcome is unknown (the scheduler stopped while it ran).
    Interrupted,
    /// The work can never succeed as specified. Never retried.
    Validation,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Validation)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Resource => write!(f, "resource"),
            FailureKind::Execution => write!(f, "execution"),
            FailureKind::Interrupted => write!(f, "interrupted"),
            FailureKind::Validation => write!(f, "validation"),
        }
    }
}

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the subgoal; it may be dispatched again after `after`.
    Retry { after: Duration },
    /// Mark the subgoal permanently failed.
    GiveUp,
}

/// Retry configuration shared by every subgoal the scheduler drives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Each further retry waits this many times longer than the previous.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Optional jitter fraction in [0, 1]: the delay is scaled by a random
    /// factor in [1 - jitter, 1 + jitter].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter.clamp(0.0, 1.0));
        self
    }

    /// Decide what happens after the `attempt_count`-th attempt failed.
    ///
    /// `attempt_count` is the number of attempts made so far, including the
    /// one that just failed.
    pub fn decide(&self, attempt_count: u32, kind: FailureKind) -> RetryDecision {
        if !kind.is_retryable() || attempt_count >= self.max_attempts.max(1) {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            after: self.delay_for(attempt_count),
        }
    }

    /// Backoff delay after the n-th failed attempt (n starts at 1).
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        let mut millis = raw.min(self.max_delay_ms as f64);
        if let Some(jitter) = self.jitter.filter(|j| *j > 0.0) {
            let jitter = jitter.min(1.0);
            let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
            millis *= factor;
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter: None,
        }
    }

    #[test]
    fn transient_failures_retry_until_max_attempts() {
        let p = policy();
        assert_eq!(
            p.decide(1, FailureKind::Timeout),
            RetryDecision::Retry {
                after: Duration::from_millis(100)
            }
        );
        assert_eq!(
            p.decide(2, FailureKind::Resource),
            RetryDecision::Retry {
                after: Duration::from_millis(200)
            }
        );
        assert_eq!(p.decide(3, FailureKind::Execution), RetryDecision::GiveUp);
        assert_eq!(p.decide(7, FailureKind::Execution), RetryDecision::GiveUp);
    }

    #[test]
    fn validation_failures_give_up_immediately() {
        let p = policy();
        assert_eq!(p.decide(1, FailureKind::Validation), RetryDecision::GiveUp);
    }

    #[test]
    fn delay_is_capped() {
        let p = policy();
        assert_eq!(p.delay_for(10), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = policy().with_jitter(0.5);
        for _ in 0..50 {
            let d = p.delay_for(1).as_millis();
            assert!((50..=150).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn no_retry_policy_gives_up_on_first_failure() {
        assert_eq!(
            RetryPolicy::no_retry().decide(1, FailureKind::Timeout),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn policy_parses_from_toml_with_defaults() {
        let p: RetryPolicy = toml::from_str("max_attempts = 5").unwrap();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay_ms, 1_000);
        assert!(p.jitter.is_none());
    }
}
