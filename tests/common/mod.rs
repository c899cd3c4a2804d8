//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Schema and data fixtures on in-memory stores
//! - A flaky source that injects read failures
//! - A recording destination that logs commit order and injects commit failures

#![allow(dead_code)]

pub mod fixtures;
pub mod stores;

pub use fixtures::*;
pub use stores::*;
