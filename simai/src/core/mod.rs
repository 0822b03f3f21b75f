//! Deterministic, pure logic shared by the orchestration layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod patch_rules;
pub mod resources;
pub mod topology;
pub mod units;
pub mod workload;
