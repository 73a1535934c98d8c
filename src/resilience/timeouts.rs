//! Timeout enforcement.
//!
//! Every outbound attempt has a deadline. An expired deadline is reported as
//! its own error so the retry policy can treat it as "no response".

use std::future::Future;
use std::time::Duration;

/// The deadline passed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {0:?}")]
pub struct Elapsed(pub Duration);

/// Run `future` with a deadline.
pub async fn with_deadline<F: Future>(deadline: Duration, future: F) -> Result<F::Output, Elapsed> {
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| Elapsed(deadline))
}
