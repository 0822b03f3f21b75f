//! Error taxonomy shared by resolution, sandboxed execution, patching, and
//! format adaptation.
//!
//! Orchestration code wraps these in `anyhow` with the operation being
//! attempted; `main` downcasts to pick a stable exit code.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::core::resources::{Candidate, ResourceKind};
use crate::exit_codes;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot find {kind} `{name}`; tried:\n{}", render_candidates(.candidates))]
    ResourceNotFound {
        kind: ResourceKind,
        name: String,
        /// Every probed path, in tier order.
        candidates: Vec<Candidate>,
    },

    #[error("failed to launch {}: {source}", .binary.display())]
    LaunchFailed {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{} exited with {}:\n{stderr}",
        .binary.display(),
        render_exit_code(.exit_code)
    )]
    ExecutionFailed {
        binary: PathBuf,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("{} was cancelled: {reason}", .binary.display())]
    Cancelled { binary: PathBuf, reason: String },

    #[error("patch target missing in {}: {reason}", .path.display())]
    PatchTargetMissing { path: PathBuf, reason: MissingTarget },

    #[error("malformed {field} `{value}`{}: {reason}", render_location(.file, .line))]
    MalformedValue {
        field: String,
        value: String,
        reason: String,
        file: Option<PathBuf>,
        line: Option<usize>,
    },

    #[error("optional dependency `{module}` is not installed (required by {operation})")]
    DependencyUnavailable { module: String, operation: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a patch could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingTarget {
    /// The artifact itself does not exist.
    File,
    /// The artifact exists but the expected literal/pattern is absent.
    Pattern(String),
}

impl fmt::Display for MissingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingTarget::File => write!(f, "file does not exist"),
            MissingTarget::Pattern(pattern) => write!(f, "expected `{pattern}` not found"),
        }
    }
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn malformed(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::MalformedValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
            file: None,
            line: None,
        }
    }

    /// Attach a file/line location to a `MalformedValue`; other variants pass through.
    pub fn at(self, path: &Path, line_no: usize) -> Self {
        match self {
            Error::MalformedValue {
                field,
                value,
                reason,
                ..
            } => Error::MalformedValue {
                field,
                value,
                reason,
                file: Some(path.to_path_buf()),
                line: Some(line_no),
            },
            other => other,
        }
    }

    /// Stable CLI exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ResourceNotFound { .. } => exit_codes::RESOURCE_NOT_FOUND,
            Error::LaunchFailed { .. } => exit_codes::LAUNCH_FAILED,
            Error::ExecutionFailed { .. } => exit_codes::EXECUTION_FAILED,
            Error::Cancelled { .. } => exit_codes::CANCELLED,
            Error::PatchTargetMissing { .. } => exit_codes::PATCH_TARGET_MISSING,
            Error::MalformedValue { .. } => exit_codes::MALFORMED_VALUE,
            Error::DependencyUnavailable { .. } => exit_codes::DEPENDENCY_UNAVAILABLE,
            Error::Io { .. } => exit_codes::INVALID,
        }
    }
}

fn render_candidates(candidates: &[Candidate]) -> String {
    if candidates.is_empty() {
        return "  (no candidate locations apply; set SIMAI_BIN_PATH or SIMAI_PATH)".to_string();
    }
    candidates
        .iter()
        .map(|c| format!("  - [{}] {}", c.tier, c.path.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "a signal".to_string(),
    }
}

fn render_location(file: &Option<PathBuf>, line: &Option<usize>) -> String {
    match (file, line) {
        (Some(file), Some(line)) => format!(" at {}:{line}", file.display()),
        (Some(file), None) => format!(" in {}", file.display()),
        _ => String::new(),
    }
}
