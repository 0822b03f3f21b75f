//! Flow-level m4 backend (`SimAI_m4`), which drives learned models through LibTorch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::{instrument, warn};

use super::{Context, SimulationOutcome, destination, validated_metadata, workload_path};
use crate::core::resources::{self, EnvSource, M4_BINARY, M4_MODELS_REL};
use crate::core::units::Convention;
use crate::error::Error;
use crate::io::libtorch;
use crate::io::sandbox::{OutputSpec, RunRequest, StagedInput};
use crate::io::topology_store::load_topology;

pub const DEFAULT_THREADS: usize = 1;

const TOPOLOGY_FILE: &str = "topology_m4";
const OUTPUT_DIR: &str = "output";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M4Options {
    pub workload: PathBuf,
    pub topology: PathBuf,
    pub threads: usize,
    pub output: Option<PathBuf>,
}

impl Default for M4Options {
    fn default() -> Self {
        Self {
            workload: PathBuf::new(),
            topology: PathBuf::new(),
            threads: DEFAULT_THREADS,
            output: None,
        }
    }
}

/// Results land in `output/`; some builds write them into the cwd instead.
pub fn outputs() -> OutputSpec {
    OutputSpec::new([format!("{OUTPUT_DIR}/*"), "*.csv".to_string(), "*.txt".to_string()])
}

pub fn build_args(workload: &Path, threads: usize) -> Vec<String> {
    vec![
        "-t".to_string(),
        threads.to_string(),
        "-w".to_string(),
        workload.display().to_string(),
        "-n".to_string(),
        TOPOLOGY_FILE.to_string(),
        "-o".to_string(),
        OUTPUT_DIR.to_string(),
    ]
}

#[instrument(skip_all, fields(workload = %opts.workload.display()))]
pub fn run<E: EnvSource>(ctx: &Context<'_, E>, opts: &M4Options) -> Result<SimulationOutcome> {
    let workload = workload_path(&opts.workload)?;
    validated_metadata(&workload, &opts.topology)?;
    let rendered = load_topology(&opts.topology)?.render(Convention::Suffixed);
    let binary = ctx.resolver.resolve_binary(M4_BINARY).context("simulate m4")?;
    let dest = destination(opts.output.as_deref())?;

    let mut request = RunRequest::new("m4", binary, dest.clone())
        .args(build_args(&workload, opts.threads))
        .create_dir(OUTPUT_DIR)
        .outputs(outputs());
    match ctx.resolve_optional(&resources::m4_models()) {
        Some(models) => request = request.stage(StagedInput::link(models, M4_MODELS_REL)),
        None => warn!("m4 model files not found; the binary may fail to load them (set SIMAI_PATH)"),
    }
    match libtorch::lib_dir(ctx.resolver.env(), &ctx.config.python, ctx.sandbox.cancel_token()) {
        Ok(Some(dir)) => request = request.library_dir(dir),
        Ok(None) => warn!("LibTorch not found; relying on the system library path"),
        Err(e) => warn!(err = %e, "could not probe for LibTorch; relying on the system library path"),
    }

    let report = ctx
        .sandbox
        .run_prepared(request, |session| {
            let path = session.join(TOPOLOGY_FILE);
            fs::write(&path, &rendered)
                .map_err(|e| Error::io(format!("write {}", path.display()), e))
        })
        .context("simulate m4")?;
    Ok(SimulationOutcome::from_report(&dest, report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_use_session_relative_topology_and_output() {
        assert_eq!(
            build_args(Path::new("/w/wl.txt"), DEFAULT_THREADS),
            ["-t", "1", "-w", "/w/wl.txt", "-n", "topology_m4", "-o", "output"]
        );
    }

    #[test]
    fn outputs_prefer_output_dir_but_accept_cwd_files() {
        let spec = outputs();
        assert_eq!(spec.patterns, ["output/*", "*.csv", "*.txt"]);
        assert_eq!(spec.primary, None);
    }
}
