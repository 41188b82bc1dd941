//! Shared storage integration tests.
//!
//! Tests the ChangesetStore and ContextStore interfaces against all
//! implementations. Each implementation module imports these test functions
//! and runs them.

pub mod changeset_store_tests;
pub mod context_store_tests;
