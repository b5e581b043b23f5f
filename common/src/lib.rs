pub mod config;

/// Common utilities shared across the sandbox workspace
///
/// This crate provides shared functionality used by the `sandbox` engine and
/// the `shop` fixture crate, including:
///
/// - Configuration loading (YAML file or environment)
/// - Shared test utilities (database URLs, in-memory connections, tracing setup)
/// - A unified test error type and result alias

// Test helpers module - available for both development and test builds
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

// Re-export commonly used test utilities for easier access
#[cfg(any(test, feature = "test-helpers"))]
pub use test_helpers::{
    TestError, TestResult, connect_in_memory, get_test_database_url,
    get_test_in_memory_database_url, init_test_tracing, postgres_test_url,
};
