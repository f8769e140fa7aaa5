//! Property-based tests for retry classification and backoff

use proptest::prelude::*;
use quizgen::transport::{classify_status, AttemptOutcome, RetryPolicy, RETRYABLE_STATUSES};
use std::time::Duration;

/// Only 429, 503 and 504 are ever retried
#[test]
fn test_only_transient_statuses_are_retryable() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(100u16..600), |status| {
            let outcome = classify_status(status);
            if RETRYABLE_STATUSES.contains(&status) {
                prop_assert_eq!(outcome, AttemptOutcome::Retryable);
            } else if (200..300).contains(&status) {
                prop_assert_eq!(outcome, AttemptOutcome::Success);
            } else {
                prop_assert_eq!(outcome, AttemptOutcome::NonRetryable);
            }
            Ok(())
        })
        .unwrap();
}

/// Each backoff is exactly twice the previous one
#[test]
fn test_backoff_doubles() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(0u64..5_000, 0u32..12), |(base_ms, attempt)| {
            let policy = RetryPolicy::new(3, Duration::from_millis(base_ms));
            prop_assert_eq!(policy.backoff_delay(0), Duration::from_millis(base_ms));
            prop_assert_eq!(
                policy.backoff_delay(attempt + 1),
                policy.backoff_delay(attempt) * 2
            );
            Ok(())
        })
        .unwrap();
}

/// Total wait before giving up is base * (2^max_retries - 1)
#[test]
fn test_total_backoff_is_geometric_sum() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&(1u64..1_000, 0u32..8), |(base_ms, max_retries)| {
            let policy = RetryPolicy::new(max_retries, Duration::from_millis(base_ms));
            let total: Duration = (0..max_retries).map(|k| policy.backoff_delay(k)).sum();
            let expected = Duration::from_millis(base_ms * ((1u64 << max_retries) - 1));
            prop_assert_eq!(total, expected);
            Ok(())
        })
        .unwrap();
}

/// Huge attempt numbers saturate instead of overflowing
#[test]
fn test_backoff_saturates() {
    let policy = RetryPolicy::new(3, Duration::from_secs(1));
    assert!(policy.backoff_delay(40) >= policy.backoff_delay(31));
    let _ = policy.backoff_delay(u32::MAX);
}
