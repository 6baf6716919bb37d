//! Deterministic, pure logic shared by the pipeline runner.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod commands;
pub mod fallback;
pub mod strategy;
pub mod types;
