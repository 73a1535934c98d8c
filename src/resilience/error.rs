//! Error types for outbound calls.

use crate::resilience::client::OutboundResponse;
use crate::resilience::retries::AttemptFailure;

/// Terminal outcome of a failed outbound call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    /// The target's breaker refused the call; nothing was sent for the refused attempt.
    #[error("circuit open for `{target}`")]
    CircuitOpen {
        target: String,
        /// Attempts sent before the breaker refused.
        attempts: u32,
    },

    /// Every permitted attempt failed with a retryable failure.
    #[error("call to `{target}` failed after {attempts} attempt(s): {failure}")]
    RetriesExhausted {
        target: String,
        attempts: u32,
        failure: AttemptFailure,
    },

    /// The target answered with a failing status that is not retried.
    #[error("call to `{target}` failed with non-retryable status {}", .response.status)]
    NonRetryable {
        target: String,
        response: Box<OutboundResponse>,
    },

    /// The request could not be built.
    #[error("invalid request to `{target}`: {reason}")]
    InvalidRequest { target: String, reason: String },
}

impl CallError {
    /// True when the target is being protected; callers may fall back.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, CallError::CircuitOpen { .. })
    }

    /// True when the failure was transient (retried until the budget ran out).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::RetriesExhausted { .. })
    }

    pub fn target(&self) -> &str {
        match self {
            CallError::CircuitOpen { target, .. }
            | CallError::RetriesExhausted { target, .. }
            | CallError::NonRetryable { target, .. }
            | CallError::InvalidRequest { target, .. } => target,
        }
    }

    /// Attempts that reached the network.
    pub fn attempts(&self) -> u32 {
        match self {
            CallError::CircuitOpen { attempts, .. } | CallError::RetriesExhausted { attempts, .. } => {
                *attempts
            }
            CallError::NonRetryable { response, .. } => response.attempts,
            CallError::InvalidRequest { .. } => 0,
        }
    }

    /// Metrics label for the final status.
    pub fn status_label(&self) -> String {
        match self {
            CallError::CircuitOpen { .. } => "circuit_open".to_string(),
            CallError::RetriesExhausted { failure, .. } => failure.label(),
            CallError::NonRetryable { response, .. } => response.status.as_u16().to_string(),
            CallError::InvalidRequest { .. } => "invalid_request".to_string(),
        }
    }
}

/// Failure to construct clients from configuration.
#[derive(Debug, thiserror::Error)]
pub enum ClientBuildError {
    #[error("invalid base URL for target `{target}`: {source}")]
    InvalidBaseUrl {
        target: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to build HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}
