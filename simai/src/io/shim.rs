//! Scoped placeholders for optional Python dependencies of the vendored generators.
//!
//! For each requested module that the interpreter cannot import, a placeholder
//! package is written into a private directory that the caller prepends to
//! `PYTHONPATH`. Import-time attribute access succeeds; any call raises an
//! `ImportError` tagged with [`STUB_MARKER`]. The directory exists only for the
//! duration of [`with_stubs`].
//!
//! Rust-side code paths that need a dependency for real ask the scope through
//! [`StubScope::require`] instead of discovering the placeholder at run time.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::process::Command;

use minijinja::{Environment, context};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::io::process::{CancelToken, RunLimits, run_command};

/// Prefix of the error a placeholder raises when called.
pub const STUB_MARKER: &str = "simai-stub: dependency unavailable:";

const PLACEHOLDER_TEMPLATE: &str = include_str!("templates/placeholder_module.py");

const PROBE_SCRIPT: &str = "\
import importlib.util, sys
for name in sys.argv[1:]:
    try:
        found = importlib.util.find_spec(name) is not None
    except (ImportError, ValueError):
        found = False
    if not found:
        print(name)
";

/// Answers which of a set of modules cannot be imported.
pub trait ModuleProbe {
    fn missing(&self, names: &BTreeSet<String>) -> Result<BTreeSet<String>>;
}

/// Asks a Python interpreter via `importlib.util.find_spec`.
#[derive(Debug, Clone)]
pub struct PythonProbe {
    pub python: String,
    pub cancel: CancelToken,
}

impl ModuleProbe for PythonProbe {
    fn missing(&self, names: &BTreeSet<String>) -> Result<BTreeSet<String>> {
        if names.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut cmd = Command::new(&self.python);
        cmd.arg("-c").arg(PROBE_SCRIPT).args(names);
        let output = run_command(cmd, &RunLimits::default(), &self.cancel, false)?;
        if !output.status.success() {
            return Err(Error::ExecutionFailed {
                binary: self.python.clone().into(),
                exit_code: output.status.code(),
                stderr: output.stderr_text(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

/// Live placeholder directory. Removed on drop.
#[derive(Debug)]
pub struct StubScope {
    dir: tempfile::TempDir,
    stubbed: BTreeSet<String>,
}

impl StubScope {
    /// Write placeholder packages for `missing` under `parent`.
    pub fn install(missing: &BTreeSet<String>, parent: Option<&Path>) -> Result<Self> {
        let parent = parent.map_or_else(std::env::temp_dir, Path::to_path_buf);
        fs::create_dir_all(&parent)
            .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        let dir = tempfile::Builder::new()
            .prefix("simai_stubs_")
            .tempdir_in(&parent)
            .map_err(|e| Error::io(format!("create stub dir in {}", parent.display()), e))?;

        let mut env = Environment::new();
        env.add_template("placeholder", PLACEHOLDER_TEMPLATE)
            .map_err(|e| template_error(&e))?;
        let template = env.get_template("placeholder").map_err(|e| template_error(&e))?;

        let mut stubbed = BTreeSet::new();
        for name in missing {
            let top = top_level(name);
            if !stubbed.insert(top.to_string()) {
                continue;
            }
            let rendered = template
                .render(context! { module => top, marker => STUB_MARKER })
                .map_err(|e| template_error(&e))?;
            let package = dir.path().join(top);
            fs::create_dir_all(&package)
                .map_err(|e| Error::io(format!("create {}", package.display()), e))?;
            let init = package.join("__init__.py");
            fs::write(&init, rendered + "\n")
                .map_err(|e| Error::io(format!("write {}", init.display()), e))?;
        }
        if !stubbed.is_empty() {
            info!(modules = ?stubbed, "optional dependencies stubbed");
        }
        Ok(Self { dir, stubbed })
    }

    /// Directory to prepend to `PYTHONPATH`.
    pub fn python_path(&self) -> &Path {
        self.dir.path()
    }

    pub fn stubbed(&self) -> &BTreeSet<String> {
        &self.stubbed
    }

    pub fn is_stubbed(&self, module: &str) -> bool {
        self.stubbed.contains(top_level(module))
    }

    /// Fail with `DependencyUnavailable` if `module` is only a placeholder.
    pub fn require(&self, module: &str, operation: &str) -> Result<()> {
        if self.is_stubbed(module) {
            return Err(Error::DependencyUnavailable {
                module: module.to_string(),
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| Error::io(format!("remove {}", path.display()), e))
    }
}

/// Run `body` with placeholders installed for every name `probe` reports missing.
///
/// The placeholder directory is removed when `body` returns, whatever the outcome.
pub fn with_stubs<P, F, T, E>(
    names: &BTreeSet<String>,
    probe: &P,
    parent: Option<&Path>,
    body: F,
) -> std::result::Result<T, E>
where
    P: ModuleProbe + ?Sized,
    F: FnOnce(&StubScope) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let missing = probe.missing(names)?;
    debug!(requested = ?names, missing = ?missing, "probed optional dependencies");
    let scope = StubScope::install(&missing, parent)?;
    let result = body(&scope);
    if let Err(e) = scope.close() {
        warn!(err = %e, "failed to remove stub directory");
    }
    result
}

/// The module named by a placeholder's `ImportError`, if `stderr` carries one.
pub fn dependency_from_stderr(stderr: &str) -> Option<String> {
    let rest = &stderr[stderr.find(STUB_MARKER)? + STUB_MARKER.len()..];
    rest.split_whitespace().next().map(str::to_string)
}

fn top_level(module: &str) -> &str {
    module.split('.').next().unwrap_or(module)
}

fn template_error(err: &minijinja::Error) -> Error {
    Error::io(
        "render placeholder module",
        std::io::Error::other(err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe(BTreeSet<String>);

    impl ModuleProbe for FixedProbe {
        fn missing(&self, names: &BTreeSet<String>) -> Result<BTreeSet<String>> {
            Ok(names.intersection(&self.0).cloned().collect())
        }
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn only_missing_modules_are_stubbed_and_removed_afterwards() {
        let temp = tempfile::tempdir().expect("tempdir");
        let probe = FixedProbe(set(&["torch", "deep_gemm"]));
        let mut seen_dir = None;
        let result: Result<()> = with_stubs(
            &set(&["torch.cuda", "numpy", "deep_gemm"]),
            &probe,
            Some(temp.path()),
            |scope| {
                seen_dir = Some(scope.python_path().to_path_buf());
                assert!(scope.python_path().join("deep_gemm/__init__.py").is_file());
                assert!(!scope.python_path().join("numpy").exists());
                assert_eq!(scope.stubbed(), &set(&["deep_gemm"]));
                Ok(())
            },
        );
        result.expect("body");
        assert!(!seen_dir.expect("body ran").exists());
    }

    #[test]
    fn dotted_names_stub_their_top_level_package() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scope = StubScope::install(&set(&["torch.cuda", "torch"]), Some(temp.path()))
            .expect("install");
        let init = fs::read_to_string(scope.python_path().join("torch/__init__.py")).expect("read");
        assert!(init.contains("_MODULE = \"torch\""));
        assert!(init.contains(STUB_MARKER));
        assert!(scope.is_stubbed("torch.cuda.amp"));
    }

    #[test]
    fn require_reports_dependency_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let scope = StubScope::install(&set(&["torch"]), Some(temp.path())).expect("install");
        let err = scope.require("torch", "live compute profiling").unwrap_err();
        assert_eq!(
            err.to_string(),
            "optional dependency `torch` is not installed (required by live compute profiling)"
        );
        scope.require("numpy", "anything").expect("not stubbed");
    }

    #[test]
    fn body_error_still_removes_scope() {
        let temp = tempfile::tempdir().expect("tempdir");
        let probe = FixedProbe(set(&["apex"]));
        let result: Result<()> = with_stubs(&set(&["apex"]), &probe, Some(temp.path()), |_| {
            Err(Error::malformed("x", "y", "z"))
        });
        assert!(result.is_err());
        let leftovers = fs::read_dir(temp.path()).expect("read_dir").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn marker_in_stderr_names_the_module() {
        let stderr = "Traceback (most recent call last):\nImportError: simai-stub: dependency unavailable: torch (called torch.cuda.synchronize)\n";
        assert_eq!(dependency_from_stderr(stderr).as_deref(), Some("torch"));
        assert_eq!(dependency_from_stderr("ValueError: boom"), None);
    }
}
