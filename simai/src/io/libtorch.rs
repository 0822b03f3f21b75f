//! Locating a LibTorch installation for the m4 backend.

use std::path::PathBuf;
use std::process::Command;

use tracing::debug;

use crate::core::resources::EnvSource;
use crate::error::Result;
use crate::io::process::{CancelToken, RunLimits, run_command};

pub const LIBTORCH_DIR_VAR: &str = "LIBTORCH_DIR";

const TORCH_PROBE: &str = "import os, torch; print(os.path.dirname(torch.__file__))";

/// LibTorch root: `$LIBTORCH_DIR`, else the installed `torch` package directory.
///
/// `Ok(None)` means neither is available. Only a failure to launch the
/// interpreter is an error.
pub fn locate(env: &dyn EnvSource, python: &str, cancel: &CancelToken) -> Result<Option<PathBuf>> {
    if let Some(dir) = env.var_os(LIBTORCH_DIR_VAR).filter(|v| !v.is_empty()) {
        return Ok(Some(PathBuf::from(dir)));
    }
    let mut cmd = Command::new(python);
    cmd.arg("-c").arg(TORCH_PROBE);
    let output = run_command(cmd, &RunLimits::default(), cancel, false)?;
    if !output.status.success() {
        debug!(stderr = %output.stderr_text(), "torch is not importable");
        return Ok(None);
    }
    let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Ok((!root.is_empty()).then(|| PathBuf::from(root)))
}

/// Directory holding the LibTorch shared libraries, when it exists.
pub fn lib_dir(env: &dyn EnvSource, python: &str, cancel: &CancelToken) -> Result<Option<PathBuf>> {
    Ok(locate(env, python, cancel)?
        .map(|root| root.join("lib"))
        .filter(|dir| dir.is_dir()))
}
