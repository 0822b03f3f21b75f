//! Stable exit codes for `simai` CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid configuration, or any error outside the taxonomy below.
pub const INVALID: i32 = 1;
/// Command-line usage error (reported by clap).
pub const USAGE: i32 = 2;
/// No resolution tier produced the requested binary or data file.
pub const RESOURCE_NOT_FOUND: i32 = 3;
/// A resolved binary exists but could not be started.
pub const LAUNCH_FAILED: i32 = 4;
/// An external binary ran and exited non-zero.
pub const EXECUTION_FAILED: i32 = 5;
/// An expected patch target (file or literal) was missing.
pub const PATCH_TARGET_MISSING: i32 = 6;
/// A topology or workload field could not be parsed.
pub const MALFORMED_VALUE: i32 = 7;
/// An optional dependency required by the invoked operation is missing.
pub const DEPENDENCY_UNAVAILABLE: i32 = 8;
/// The external run was interrupted or hit the caller-level timeout.
pub const CANCELLED: i32 = 130;

/// Exit code for an error chain: the first [`crate::Error`] in it decides.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<crate::Error>())
        .map_or(INVALID, crate::Error::exit_code)
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::*;

    #[test]
    fn wrapped_errors_keep_their_code() {
        let inner: crate::Result<()> = Err(crate::Error::DependencyUnavailable {
            module: "torch".to_string(),
            operation: "live compute profiling".to_string(),
        });
        let err = inner.context("generate workload").unwrap_err();
        assert_eq!(for_error(&err), DEPENDENCY_UNAVAILABLE);
        assert_eq!(for_error(&anyhow::anyhow!("bad flag")), INVALID);
    }
}
