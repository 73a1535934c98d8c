//! Retry policy.
//!
//! # Responsibilities
//! - Decide whether a failed attempt is worth repeating
//! - Compute the delay before the next attempt
//!
//! # Design Decisions
//! - No response at all (connect error, timeout) is always retryable
//! - Status codes are retried only when listed in `retryable_status_codes`
//! - The attempt budget counts the first attempt

use std::collections::BTreeSet;
use std::time::Duration;

use axum::http::StatusCode;

use crate::config::RetryConfig;
use crate::resilience::backoff::{calculate_backoff, with_jitter};

/// Why an attempt produced no usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// The target answered with a failing status.
    Status(StatusCode),
    /// The attempt exceeded its deadline.
    Timeout,
    /// Connection-level failure; the message comes from the HTTP client.
    Network(String),
}

impl AttemptFailure {
    /// Short label for metrics.
    pub fn label(&self) -> String {
        match self {
            AttemptFailure::Status(status) => status.as_u16().to_string(),
            AttemptFailure::Timeout => "timeout".to_string(),
            AttemptFailure::Network(_) => "network".to_string(),
        }
    }
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptFailure::Status(status) => write!(f, "status {status}"),
            AttemptFailure::Timeout => write!(f, "timed out"),
            AttemptFailure::Network(e) => write!(f, "network error: {e}"),
        }
    }
}

/// Retry policy for one target.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    retryable: BTreeSet<u16>,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            retryable: config.retryable_status_codes.iter().copied().collect(),
            jitter: config.jitter,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// True if `status` is in the retryable set.
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retryable.contains(&status.as_u16())
    }

    /// True if this failure kind may be retried at all.
    pub fn is_retryable(&self, failure: &AttemptFailure) -> bool {
        match failure {
            AttemptFailure::Status(status) => self.is_retryable_status(*status),
            AttemptFailure::Timeout | AttemptFailure::Network(_) => true,
        }
    }

    /// True if another attempt should follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32, failure: &AttemptFailure) -> bool {
        attempt < self.max_attempts && self.is_retryable(failure)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let delay = calculate_backoff(retry, self.base_delay_ms, self.max_delay_ms);
        if self.jitter {
            with_jitter(delay)
        } else {
            delay
        }
    }
}
