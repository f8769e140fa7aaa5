//! Retry Transport
//!
//! Bounded retries with exponential backoff for outbound provider calls. Only the
//! transient statuses 429, 503 and 504 are retried; every other status is a definitive
//! outcome and is handed back to the caller untouched.

use crate::error::TransportError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP statuses that signal transient provider unavailability.
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 503, 504];

/// Retry configuration for one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay inserted after the zero-indexed `attempt`: `base_delay * 2^attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
        }
    }
}

/// Outcome of a single send attempt, recorded in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Retryable,
    NonRetryable,
    Cancelled,
}

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

pub fn classify_status(status: u16) -> AttemptOutcome {
    if is_retryable_status(status) {
        AttemptOutcome::Retryable
    } else if (200..300).contains(&status) {
        AttemptOutcome::Success
    } else {
        AttemptOutcome::NonRetryable
    }
}

/// Anything that carries an HTTP status code.
pub trait StatusResponse {
    fn status_code(&self) -> u16;
}

impl StatusResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }
}

/// Send with bounded retries.
///
/// `send` is invoked once per attempt with the zero-indexed attempt number and must
/// build an independent copy of the request each time. A persistently retryable
/// response yields exactly `max_retries + 1` invocations followed by
/// [`TransportError::RetriesExhausted`]. Cancellation during a backoff wait aborts with
/// [`TransportError::Cancelled`] without sending again.
pub async fn send_with_retry<R, F, Fut>(
    mut send: F,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<R, TransportError>
where
    R: StatusResponse,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<R, TransportError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let response = send(attempt).await?;
        let status = response.status_code();
        let outcome = classify_status(status);

        if outcome != AttemptOutcome::Retryable {
            debug!(attempt, status, outcome = ?outcome, "Provider request settled");
            return Ok(response);
        }

        if attempt >= policy.max_retries {
            warn!(
                attempts = attempt + 1,
                status, "Provider request retries exhausted"
            );
            return Err(TransportError::RetriesExhausted {
                attempts: attempt + 1,
                last_status: status,
            });
        }

        let delay = policy.backoff_delay(attempt);
        debug!(
            attempt,
            status,
            delay_ms = delay.as_millis() as u64,
            "Retryable provider status, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(attempt, outcome = ?AttemptOutcome::Cancelled, "Backoff interrupted by cancellation");
                return Err(TransportError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

/// `reqwest` specialization: the builder is cloned for every attempt.
pub async fn send_request_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<reqwest::Response, TransportError> {
    send_with_retry(
        |_attempt| {
            let copy = request.try_clone();
            async move {
                let copy = copy.ok_or(TransportError::NotReplayable)?;
                copy.send().await.map_err(map_send_error)
            }
        },
        policy,
        cancel,
    )
    .await
}

fn map_send_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Http(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        TransportError::Http(format!("Connection error: {}", error))
    } else {
        TransportError::Http(error.to_string())
    }
}
