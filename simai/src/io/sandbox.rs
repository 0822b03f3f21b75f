//! Disposable, uniquely named working directories for external binaries.
//!
//! One [`SandboxSession`] per run: inputs are staged first, the binary runs with
//! the session directory as its cwd, and declared outputs are relocated only
//! after a clean exit. The directory is removed on every exit path; staged
//! links are removed without touching their targets.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::io::config::SimaiConfig;
use crate::io::process::{CancelToken, CommandOutput, RunLimits, run_command};

#[cfg(target_os = "macos")]
pub const LIBRARY_PATH_VAR: &str = "DYLD_LIBRARY_PATH";
#[cfg(not(target_os = "macos"))]
pub const LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    /// Private copy; the binary may mutate it.
    Copy,
    /// Symbolic link; the binary only reads it.
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedInput {
    pub source: PathBuf,
    /// Path relative to the session directory.
    pub dest: PathBuf,
    pub mode: StageMode,
}

impl StagedInput {
    pub fn copy(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: StageMode::Copy,
        }
    }

    pub fn link(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            mode: StageMode::Link,
        }
    }
}

/// Glob patterns (relative to the session directory) naming a backend's outputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputSpec {
    /// Pattern of the single primary output, used when the destination is a file.
    pub primary: Option<String>,
    pub patterns: Vec<String>,
}

impl OutputSpec {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary: None,
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_primary(mut self, pattern: impl Into<String>) -> Self {
        self.primary = Some(pattern.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Primary output renamed to this path; others placed beside it.
    File(PathBuf),
    /// All outputs moved inside, keeping their names.
    Directory(PathBuf),
}

impl Destination {
    /// A path with an extension that is not an existing directory names a file.
    pub fn infer(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if path.extension().is_some() && !path.is_dir() {
            Destination::File(path)
        } else {
            Destination::Directory(path)
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Destination::File(path) | Destination::Directory(path) => path,
        }
    }
}

/// Everything needed for one sandboxed execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub label: String,
    pub binary: PathBuf,
    pub args: Vec<OsString>,
    pub stage: Vec<StagedInput>,
    /// Empty files the binary expects to exist.
    pub touch: Vec<PathBuf>,
    /// Empty directories the binary writes into.
    pub dirs: Vec<PathBuf>,
    pub env: BTreeMap<String, OsString>,
    /// Prepended to the library search path after the binary's own directory.
    pub library_dirs: Vec<PathBuf>,
    pub outputs: OutputSpec,
    pub destination: Destination,
}

impl RunRequest {
    pub fn new(label: impl Into<String>, binary: impl Into<PathBuf>, destination: Destination) -> Self {
        Self {
            label: label.into(),
            binary: binary.into(),
            args: Vec::new(),
            stage: Vec::new(),
            touch: Vec::new(),
            dirs: Vec::new(),
            env: BTreeMap::new(),
            library_dirs: Vec::new(),
            outputs: OutputSpec::default(),
            destination,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn stage(mut self, input: StagedInput) -> Self {
        self.stage.push(input);
        self
    }

    pub fn touch(mut self, rel: impl Into<PathBuf>) -> Self {
        self.touch.push(rel.into());
        self
    }

    pub fn create_dir(mut self, rel: impl Into<PathBuf>) -> Self {
        self.dirs.push(rel.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.env.insert(key.into(), value.as_ref().to_os_string());
        self
    }

    pub fn library_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.library_dirs.push(dir.into());
        self
    }

    pub fn outputs(mut self, outputs: OutputSpec) -> Self {
        self.outputs = outputs;
        self
    }
}

/// What a successful run produced.
#[derive(Debug)]
pub struct RunReport {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    /// Final locations of every relocated output.
    pub relocated: Vec<PathBuf>,
    /// Final location of the primary output when the destination was a file.
    pub primary: Option<PathBuf>,
}

/// One live working directory. Dropping it removes the directory.
#[derive(Debug)]
pub struct SandboxSession {
    dir: tempfile::TempDir,
}

impl SandboxSession {
    /// Create `simai_<label>_<pid>_<random>` under `parent` (system temp dir if `None`).
    pub fn create(parent: Option<&Path>, label: &str) -> Result<Self> {
        let parent = match parent {
            Some(parent) => parent.to_path_buf(),
            None => std::env::temp_dir(),
        };
        fs::create_dir_all(&parent)
            .map_err(|e| Error::io(format!("create sandbox root {}", parent.display()), e))?;
        let prefix = format!("simai_{label}_{}_", std::process::id());
        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .rand_bytes(10)
            .tempdir_in(&parent)
            .map_err(|e| Error::io(format!("create sandbox in {}", parent.display()), e))?;
        debug!(path = %dir.path().display(), "sandbox created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn stage(&self, input: &StagedInput) -> Result<()> {
        let source = std::path::absolute(&input.source)
            .map_err(|e| Error::io(format!("absolutize {}", input.source.display()), e))?;
        if !source.exists() {
            return Err(Error::io(
                format!("stage {}", source.display()),
                std::io::Error::new(std::io::ErrorKind::NotFound, "input does not exist"),
            ));
        }
        let dest = self.join(&input.dest);
        ensure_parent(&dest)?;
        match input.mode {
            StageMode::Copy => copy_path(&source, &dest),
            StageMode::Link => link_path(&source, &dest),
        }
    }

    pub fn touch(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.join(rel);
        ensure_parent(&path)?;
        fs::File::create(&path).map_err(|e| Error::io(format!("create {}", path.display()), e))?;
        Ok(path)
    }

    pub fn create_dir(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let path = self.join(rel);
        fs::create_dir_all(&path)
            .map_err(|e| Error::io(format!("create {}", path.display()), e))?;
        Ok(path)
    }

    /// Every non-link entry matching any pattern, sorted and deduplicated.
    pub fn matches(&self, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let base = glob::Pattern::escape(&self.path().to_string_lossy());
        let mut found = BTreeSet::new();
        for pattern in patterns {
            let full = format!("{base}/{pattern}");
            let entries = glob::glob(&full)
                .map_err(|e| Error::malformed("output pattern", pattern.as_str(), e.to_string()))?;
            for entry in entries {
                let path = entry.map_err(|e| {
                    let path = e.path().to_path_buf();
                    Error::io(format!("scan {}", path.display()), e.into_error())
                })?;
                let is_link = fs::symlink_metadata(&path)
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if !is_link {
                    found.insert(path);
                }
            }
        }
        Ok(found.into_iter().collect())
    }

    /// Move declared outputs to `destination`. Returns `(all, primary)` final paths.
    pub fn collect(
        &self,
        outputs: &OutputSpec,
        destination: &Destination,
    ) -> Result<(Vec<PathBuf>, Option<PathBuf>)> {
        let found = self.matches(&outputs.patterns)?;
        if found.is_empty() {
            warn!(patterns = ?outputs.patterns, "no result files generated");
            return Ok((Vec::new(), None));
        }

        let mut relocated = Vec::with_capacity(found.len());
        match destination {
            Destination::Directory(dir) => {
                fs::create_dir_all(dir)
                    .map_err(|e| Error::io(format!("create {}", dir.display()), e))?;
                let mut taken = BTreeSet::new();
                for path in &found {
                    let Some(name) = claim_name(&mut taken, path)? else {
                        continue;
                    };
                    let target = dir.join(name);
                    replace_path(path, &target)?;
                    relocated.push(target);
                }
                Ok((relocated, None))
            }
            Destination::File(file) => {
                let primary = self.pick_primary(outputs, &found)?;
                ensure_parent(file)?;
                replace_path(&primary, file)?;
                relocated.push(file.clone());
                let beside = file.parent().unwrap_or_else(|| Path::new("."));
                let mut taken: BTreeSet<OsString> =
                    file.file_name().map(OsStr::to_os_string).into_iter().collect();
                for path in found.iter().filter(|p| **p != primary) {
                    let Some(name) = claim_name(&mut taken, path)? else {
                        continue;
                    };
                    let target = beside.join(name);
                    replace_path(path, &target)?;
                    relocated.push(target);
                }
                Ok((relocated, Some(file.clone())))
            }
        }
    }

    fn pick_primary(&self, outputs: &OutputSpec, found: &[PathBuf]) -> Result<PathBuf> {
        if let Some(pattern) = &outputs.primary
            && let Some(first) = self.matches(std::slice::from_ref(pattern))?.into_iter().next()
        {
            return Ok(first);
        }
        let fallback = found[0].clone();
        if outputs.primary.is_some() {
            warn!(
                primary = ?outputs.primary,
                using = %fallback.display(),
                "primary output missing; using first match"
            );
        }
        Ok(fallback)
    }

    /// Remove the working directory now, reporting failures.
    pub fn close(self) -> Result<()> {
        let path = self.path().to_path_buf();
        self.dir
            .close()
            .map_err(|e| Error::io(format!("remove sandbox {}", path.display()), e))
    }
}

/// Runs [`RunRequest`]s in fresh sessions.
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    root: Option<PathBuf>,
    limits: RunLimits,
    cancel: CancelToken,
    echo: bool,
    extra_env: BTreeMap<String, String>,
}

impl Sandbox {
    pub fn new(limits: RunLimits, cancel: CancelToken) -> Self {
        Self {
            limits,
            cancel,
            ..Self::default()
        }
    }

    pub fn from_config(cfg: &SimaiConfig, cancel: CancelToken, echo: bool) -> Self {
        Self {
            root: cfg.sandbox_root.clone(),
            limits: RunLimits {
                timeout: cfg.timeout(),
                output_limit_bytes: cfg.output_limit_bytes,
            },
            cancel,
            echo,
            extra_env: cfg.env.clone(),
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn run(&self, request: RunRequest) -> Result<RunReport> {
        self.run_prepared(request, |_| Ok(()))
    }

    /// Like [`Self::run`], calling `prepare` after staging and before launch.
    #[instrument(skip_all, fields(label = %request.label, binary = %request.binary.display()))]
    pub fn run_prepared<F>(&self, request: RunRequest, prepare: F) -> Result<RunReport>
    where
        F: FnOnce(&SandboxSession) -> Result<()>,
    {
        let session = SandboxSession::create(self.root.as_deref(), &request.label)?;
        let result = self.run_in(&session, &request, prepare);
        if let Err(e) = session.close() {
            warn!(err = %e, "sandbox cleanup failed");
        }
        result
    }

    fn run_in<F>(&self, session: &SandboxSession, request: &RunRequest, prepare: F) -> Result<RunReport>
    where
        F: FnOnce(&SandboxSession) -> Result<()>,
    {
        for input in &request.stage {
            session.stage(input)?;
        }
        for rel in &request.touch {
            session.touch(rel)?;
        }
        for rel in &request.dirs {
            session.create_dir(rel)?;
        }
        prepare(session)?;

        let cmd = self.command(session, request)?;
        info!(cwd = %session.path().display(), "launching");
        let output = run_command(cmd, &self.limits, &self.cancel, self.echo)?;
        check_status(&request.binary, &output, self.limits.timeout)?;

        let (relocated, primary) = session.collect(&request.outputs, &request.destination)?;
        Ok(RunReport {
            status: output.status,
            stdout: output.stdout,
            relocated,
            primary,
        })
    }

    fn command(&self, session: &SandboxSession, request: &RunRequest) -> Result<Command> {
        let mut cmd = Command::new(&request.binary);
        cmd.args(&request.args).current_dir(session.path());
        for (key, value) in &self.extra_env {
            cmd.env(key, value);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let mut lib_dirs: Vec<PathBuf> = request
            .binary
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .into_iter()
            .collect();
        lib_dirs.extend(request.library_dirs.iter().cloned());
        let inherited = request
            .env
            .get(LIBRARY_PATH_VAR)
            .cloned()
            .or_else(|| self.extra_env.get(LIBRARY_PATH_VAR).map(OsString::from))
            .or_else(|| std::env::var_os(LIBRARY_PATH_VAR));
        if let Some(existing) = inherited {
            lib_dirs.extend(std::env::split_paths(&existing));
        }
        let joined = std::env::join_paths(&lib_dirs).map_err(|e| {
            Error::malformed(LIBRARY_PATH_VAR, format!("{lib_dirs:?}"), e.to_string())
        })?;
        cmd.env(LIBRARY_PATH_VAR, joined);
        Ok(cmd)
    }
}

fn check_status(binary: &Path, output: &CommandOutput, timeout: Option<std::time::Duration>) -> Result<()> {
    if output.cancelled {
        return Err(Error::Cancelled {
            binary: binary.to_path_buf(),
            reason: "interrupted".to_string(),
        });
    }
    if output.timed_out {
        let reason = match timeout {
            Some(t) => format!("timed out after {t:?}"),
            None => "timed out".to_string(),
        };
        return Err(Error::Cancelled {
            binary: binary.to_path_buf(),
            reason,
        });
    }
    if !output.status.success() {
        return Err(Error::ExecutionFailed {
            binary: binary.to_path_buf(),
            exit_code: output.status.code(),
            stderr: output.stderr_text(),
        });
    }
    Ok(())
}

fn file_name(path: &Path) -> Result<&OsStr> {
    path.file_name().ok_or_else(|| {
        Error::malformed("output path", path.display().to_string(), "has no file name")
    })
}

/// Reserve `path`'s file name in `taken`. A name already taken is skipped with a warning.
fn claim_name<'a>(taken: &mut BTreeSet<OsString>, path: &'a Path) -> Result<Option<&'a OsStr>> {
    let name = file_name(path)?;
    if taken.insert(name.to_os_string()) {
        return Ok(Some(name));
    }
    warn!(path = %path.display(), "another output already has this file name, leaving it behind");
    Ok(None)
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("create {}", parent.display()), e)),
        _ => Ok(()),
    }
}

#[cfg(unix)]
fn link_path(source: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(source, dest).map_err(|e| {
        Error::io(
            format!("link {} -> {}", dest.display(), source.display()),
            e,
        )
    })
}

#[cfg(not(unix))]
fn link_path(source: &Path, dest: &Path) -> Result<()> {
    copy_path(source, dest)
}

fn copy_path(source: &Path, dest: &Path) -> Result<()> {
    if !source.is_dir() {
        fs::copy(source, dest).map_err(|e| {
            Error::io(
                format!("copy {} -> {}", source.display(), dest.display()),
                e,
            )
        })?;
        return Ok(());
    }
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| {
            let context = format!("walk {}", source.display());
            Error::io(context, e.into())
        })?;
        let rel = entry.path().strip_prefix(source).unwrap_or(entry.path());
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::io(format!("create {}", target.display()), e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::io(
                    format!("copy {} -> {}", entry.path().display(), target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Move `source` to `target`, replacing whatever is there.
fn replace_path(source: &Path, target: &Path) -> Result<()> {
    if let Ok(meta) = fs::symlink_metadata(target) {
        let removed = if meta.is_dir() {
            fs::remove_dir_all(target)
        } else {
            fs::remove_file(target)
        };
        removed.map_err(|e| Error::io(format!("replace {}", target.display()), e))?;
    }
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }
    // Cross-device: copy then remove.
    copy_path(source, target)?;
    let removed = if source.is_dir() {
        fs::remove_dir_all(source)
    } else {
        fs::remove_file(source)
    };
    removed.map_err(|e| Error::io(format!("remove {}", source.display()), e))
}
