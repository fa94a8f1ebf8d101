//! Common test utilities for worker integration tests
//!
//! This module provides shared test infrastructure for integration tests,
//! including on-disk music libraries, recording sinks and scripted encoders.

#![allow(unused_imports)]
#![allow(dead_code)]

pub mod fixtures;
pub mod mocks;

pub use fixtures::*;
pub use mocks::*;
