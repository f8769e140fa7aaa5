//! Property-based tests for pipeline invariants

mod retry_policy;
