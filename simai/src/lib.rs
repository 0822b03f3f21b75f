//! Orchestration layer for the SimAI simulation backends.
//!
//! The crate locates externally-built simulator binaries and vendored data,
//! runs them in disposable working directories, and adapts topology files to
//! each backend's input dialect. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (unit conversion, topology
//!   parsing/rendering, resource descriptors, workload parameters, patch rules).
//! - **[`io`]**: Side-effecting operations (filesystem probing, process
//!   execution, sandbox sessions, config and topology files).
//!
//! Orchestration modules ([`backends`], [`generate`], [`bench`], [`install`])
//! compose both layers into the CLI commands.

#![recursion_limit = "256"]

pub mod backends;
pub mod bench;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod generate;
pub mod install;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, Result};
