//! Shared test utilities for jobsync integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring a file-backed database, queue, tracker and a stub
//!   fetcher in a temp directory
//! - Builders for RSS payloads and normalized items

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{StubFetcher, TestHarness};
