//! Testing utilities for minitask pipelines.
//!
//! This module provides:
//! - Chunk transforms and sentinel stages for building test pipelines
//! - Temporary-directory fixtures for cache tests
//! - Assertions over produced files

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_file_contents, assert_file_missing, assert_utf8_eq};
pub use fixtures::{CacheFixture, SharedBuffer};
pub use mocks::{
    counting_stage, delayed_text_stage, failing_stage, ByteCount, Passthrough, Uppercase, Wrap,
};
