//! `simai install m4`: build `SimAI_m4` from source and install it beside the executable.
//!
//! The flow capacity constant in the m4 source is patched before compiling and
//! restored afterwards, including when the build fails.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context as _, Result, anyhow, bail};
use tracing::{info, instrument, warn};

use crate::backends::Context;
use crate::core::patch_rules::{DEFAULT_M4_FLOW_CAPACITY, M4_SOURCE_FILE, m4_flow_capacity};
use crate::core::resources::{self, EnvSource, M4_BINARY};
use crate::error::Error;
use crate::io::config::SimaiConfig;
use crate::io::libtorch::{self, LIBTORCH_DIR_VAR};
use crate::io::patcher::PatchGuard;
use crate::io::process::{CancelToken, RunLimits, run_command};

pub const M4_GIT_URL: &str = "https://github.com/liecn/SimAI.git";
const CMAKE_SOURCE: &str = "astra-sim-alibabacloud/build/simai_m4";
const BUILT_BINARY: &str = "simai_m4/SimAI_m4";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    /// Source checkout; located or cloned when unset.
    pub src: Option<PathBuf>,
    pub git_url: String,
    pub force: bool,
    pub n_flows_max: u64,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            src: None,
            git_url: M4_GIT_URL.to_string(),
            force: false,
            n_flows_max: DEFAULT_M4_FLOW_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyInstalled(PathBuf),
    Installed(PathBuf),
}

/// External programs used by the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub cc: PathBuf,
    pub cxx: PathBuf,
    pub cmake: PathBuf,
    pub make: PathBuf,
}

impl Toolchain {
    /// `gcc-9`/`g++-9` when present, else `gcc`/`g++`; `cmake` and `make` from `PATH`.
    pub fn detect() -> Result<Self> {
        let first = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| which::which(name).ok())
                .ok_or_else(|| anyhow!("none of {} found on PATH", names.join(", ")))
        };
        Ok(Self {
            cc: first(&["gcc-9", "gcc"]).context("locate C compiler")?,
            cxx: first(&["g++-9", "g++"]).context("locate C++ compiler")?,
            cmake: first(&["cmake"])?,
            make: first(&["make"])?,
        })
    }
}

/// Runs build steps with the configured limits, echoing their output.
#[derive(Debug, Clone)]
pub struct StepRunner {
    pub limits: RunLimits,
    pub cancel: CancelToken,
}

impl StepRunner {
    pub fn from_config(cfg: &SimaiConfig, cancel: CancelToken) -> Self {
        Self {
            limits: RunLimits {
                timeout: cfg.timeout(),
                output_limit_bytes: cfg.output_limit_bytes,
            },
            cancel,
        }
    }

    fn run(&self, cmd: Command) -> crate::Result<()> {
        let program = PathBuf::from(cmd.get_program());
        let output = run_command(cmd, &self.limits, &self.cancel, true)?;
        if output.interrupted() {
            return Err(Error::Cancelled {
                binary: program,
                reason: if output.cancelled { "interrupted" } else { "timed out" }.to_string(),
            });
        }
        if !output.status.success() {
            return Err(Error::ExecutionFailed {
                binary: program,
                exit_code: output.status.code(),
                stderr: output.stderr_text(),
            });
        }
        Ok(())
    }
}

pub fn cmake_args(toolchain: &Toolchain, libtorch: &Path, cmake_source: &Path) -> Vec<String> {
    vec![
        format!("-DCMAKE_C_COMPILER={}", toolchain.cc.display()),
        format!("-DCMAKE_CXX_COMPILER={}", toolchain.cxx.display()),
        "-DCMAKE_BUILD_TYPE=Release".to_string(),
        "-DCMAKE_CXX_FLAGS_RELEASE=-O3 -march=native -DNDEBUG".to_string(),
        "-DCMAKE_CUDA_ARCHITECTURES=80".to_string(),
        "-DUSE_ANALYTICAL=TRUE".to_string(),
        format!("-DTorch_DIR={}", libtorch.join("share/cmake/Torch").display()),
        "-DCMAKE_EXE_LINKER_FLAGS=-Wl,--allow-shlib-undefined".to_string(),
        cmake_source.display().to_string(),
    ]
}

#[instrument(skip_all, fields(force = opts.force, n_flows_max = opts.n_flows_max))]
pub fn m4<E: EnvSource>(ctx: &Context<'_, E>, opts: &InstallOptions) -> Result<InstallOutcome> {
    let bin_dir = ctx
        .resolver
        .layout()
        .package_root
        .as_ref()
        .map(|root| root.join("_binaries"))
        .context("cannot determine the install directory of this executable")?;
    let installed = bin_dir.join(M4_BINARY);
    if !opts.force && installed.is_file() {
        return Ok(InstallOutcome::AlreadyInstalled(installed));
    }

    let runner = StepRunner::from_config(ctx.config, ctx.sandbox.cancel_token().clone());
    let src = locate_source(ctx, opts, &runner)?;
    let libtorch = libtorch::locate(
        ctx.resolver.env(),
        &ctx.config.python,
        ctx.sandbox.cancel_token(),
    )?
    .with_context(|| {
        format!("torch is not installed; install PyTorch or set {LIBTORCH_DIR_VAR} to a LibTorch directory")
    })?;
    info!(libtorch = %libtorch.display(), "using LibTorch");
    let toolchain = Toolchain::detect()?;

    let dest = build(&src, &bin_dir, &toolchain, &libtorch, opts.n_flows_max, &runner)?;
    Ok(InstallOutcome::Installed(dest))
}

fn locate_source<E: EnvSource>(
    ctx: &Context<'_, E>,
    opts: &InstallOptions,
    runner: &StepRunner,
) -> Result<PathBuf> {
    if let Some(src) = &opts.src {
        if !src.is_dir() {
            bail!("m4 source directory does not exist: {}", src.display());
        }
        return Ok(src.clone());
    }
    match ctx.resolver.resolve(&resources::m4_source()) {
        Ok(path) => return Ok(path),
        Err(e) => info!("{e}"),
    }
    let cache = ctx
        .resolver
        .layout()
        .cache_root
        .as_ref()
        .map(|root| root.join("simai-m4"))
        .context("no user cache directory to clone m4 source into")?;
    clone_source(&opts.git_url, &cache, runner)?;
    Ok(cache)
}

fn clone_source(url: &str, dest: &Path, runner: &StepRunner) -> Result<()> {
    info!(url, dest = %dest.display(), "cloning m4 source");
    if dest.exists() {
        fs::remove_dir_all(dest).with_context(|| format!("remove stale {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut cmd = Command::new("git");
    cmd.args(["clone", "--recurse-submodules", "--shallow-submodules", url])
        .arg(dest);
    runner.run(cmd).context("clone m4 source")?;
    Ok(())
}

/// Patch, configure, compile, restore, then copy the binary into `bin_dir`.
pub fn build(
    src: &Path,
    bin_dir: &Path,
    toolchain: &Toolchain,
    libtorch: &Path,
    n_flows_max: u64,
    runner: &StepRunner,
) -> Result<PathBuf> {
    let guard = PatchGuard::apply(&src.join(M4_SOURCE_FILE), &m4_flow_capacity(n_flows_max))?;

    let cmake_source = src.join(CMAKE_SOURCE);
    let build_dir = cmake_source.join("build");
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)
            .with_context(|| format!("remove stale {}", build_dir.display()))?;
    }
    fs::create_dir_all(&build_dir).with_context(|| format!("create {}", build_dir.display()))?;

    info!(dir = %build_dir.display(), "building SimAI_m4");
    let mut cmake = Command::new(&toolchain.cmake);
    cmake
        .args(cmake_args(toolchain, libtorch, &cmake_source))
        .current_dir(&build_dir)
        .env(LIBTORCH_DIR_VAR, libtorch);
    runner.run(cmake).context("configure SimAI_m4")?;

    let jobs = std::thread::available_parallelism().map_or(1, |n| n.get());
    let mut make = Command::new(&toolchain.make);
    make.arg(format!("-j{jobs}"))
        .current_dir(&build_dir)
        .env(LIBTORCH_DIR_VAR, libtorch);
    runner.run(make).context("compile SimAI_m4")?;

    if let Err(e) = guard.finish() {
        warn!(err = %e, "m4 source left patched");
    }

    let built = build_dir.join(BUILT_BINARY);
    if !built.is_file() {
        bail!("build finished but binary not found at {}", built.display());
    }
    fs::create_dir_all(bin_dir).with_context(|| format!("create {}", bin_dir.display()))?;
    let dest = bin_dir.join(M4_BINARY);
    fs::copy(&built, &dest)
        .with_context(|| format!("copy {} -> {}", built.display(), dest.display()))?;
    make_executable(&dest)?;
    info!(path = %dest.display(), "SimAI_m4 installed");
    Ok(dest)
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .with_context(|| format!("stat {}", path.display()))?
        .permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(path, perms).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::write_executable;

    const M4_CC: &str = "int32_t M4::n_flows_max = 50000;\n";

    fn fixture(make_body: &str) -> (tempfile::TempDir, PathBuf, Toolchain) {
        let temp = tempfile::tempdir().expect("tempdir");
        let src = temp.path().join("simai-m4");
        let cc = src.join(M4_SOURCE_FILE);
        fs::create_dir_all(cc.parent().expect("parent")).expect("mkdir");
        fs::write(&cc, M4_CC).expect("write");
        fs::create_dir_all(src.join(CMAKE_SOURCE)).expect("mkdir");

        let tools = temp.path().join("tools");
        // Records the flow capacity seen at build time.
        let make_script = format!("grep n_flows_max {} > seen.txt\n{make_body}", cc.display());
        write_executable(&tools.join("cmake"), "exit 0");
        write_executable(&tools.join("make"), &make_script);
        let toolchain = Toolchain {
            cc: PathBuf::from("/usr/bin/gcc"),
            cxx: PathBuf::from("/usr/bin/g++"),
            cmake: tools.join("cmake"),
            make: tools.join("make"),
        };
        (temp, src, toolchain)
    }

    fn runner() -> StepRunner {
        StepRunner {
            limits: RunLimits::default(),
            cancel: CancelToken::new(),
        }
    }

    #[test]
    fn successful_build_installs_binary_and_restores_source() {
        let (temp, src, toolchain) =
            fixture("mkdir -p simai_m4 && printf 'bin' > simai_m4/SimAI_m4");
        let bin_dir = temp.path().join("pkg/_binaries");
        let dest = build(&src, &bin_dir, &toolchain, Path::new("/opt/torch"), 500_000, &runner())
            .expect("build");

        assert_eq!(dest, bin_dir.join("SimAI_m4"));
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            fs::metadata(&dest).expect("stat").permissions().mode()
        };
        assert_ne!(mode & 0o111, 0);
        let seen = fs::read_to_string(src.join(CMAKE_SOURCE).join("build/seen.txt")).expect("seen");
        assert!(seen.contains("= 500000;"), "{seen}");
        assert_eq!(fs::read_to_string(src.join(M4_SOURCE_FILE)).expect("read"), M4_CC);
    }

    #[test]
    fn failed_build_still_restores_source() {
        let (temp, src, toolchain) = fixture("echo 'undefined reference' >&2\nexit 2");
        let err = build(
            &src,
            &temp.path().join("bin"),
            &toolchain,
            Path::new("/opt/torch"),
            1_000,
            &runner(),
        )
        .unwrap_err();

        let inner = err.downcast_ref::<Error>().expect("simai error");
        assert!(matches!(inner, Error::ExecutionFailed { exit_code: Some(2), .. }));
        assert_eq!(fs::read_to_string(src.join(M4_SOURCE_FILE)).expect("read"), M4_CC);
        assert!(!temp.path().join("bin/SimAI_m4").exists());
    }

    #[test]
    fn drifted_source_fails_before_building() {
        let (temp, src, toolchain) = fixture("exit 0");
        fs::write(src.join(M4_SOURCE_FILE), "int32_t n_flows = 1;\n").expect("write");
        let err = build(&src, temp.path(), &toolchain, Path::new("/t"), 10, &runner()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::PatchTargetMissing { .. })
        ));
        assert!(!src.join(CMAKE_SOURCE).join("build").exists());
    }

    #[test]
    fn cmake_args_pin_torch_and_compilers() {
        let toolchain = Toolchain {
            cc: PathBuf::from("/usr/bin/gcc-9"),
            cxx: PathBuf::from("/usr/bin/g++-9"),
            cmake: PathBuf::from("cmake"),
            make: PathBuf::from("make"),
        };
        let args = cmake_args(&toolchain, Path::new("/opt/torch"), Path::new("/s/build/simai_m4"));
        assert_eq!(args[0], "-DCMAKE_C_COMPILER=/usr/bin/gcc-9");
        assert!(args.contains(&"-DTorch_DIR=/opt/torch/share/cmake/Torch".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/s/build/simai_m4"));
    }
}
