//! Packet-level ns-3 backend (`SimAI_simulator`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::{info, instrument};

use super::{Context, SimulationOutcome, destination, validated_metadata, workload_path};
use crate::core::patch_rules::sandbox_config_paths;
use crate::core::resources::{self, EnvSource, NS3_BINARY};
use crate::core::units::Convention;
use crate::error::{Error, MissingTarget};
use crate::io::patcher;
use crate::io::sandbox::{OutputSpec, RunRequest, SandboxSession, StagedInput};
use crate::io::topology_store::load_topology;

pub const DEFAULT_THREADS: usize = 8;

const CONFIG_FILE: &str = "SimAI.conf";
const TOPOLOGY_FILE: &str = "topology";
/// Inputs the runtime config references that must exist even when unused.
const PLACEHOLDER_INPUTS: [&str; 2] = ["flow1.txt", "trace1.txt"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ns3Options {
    pub workload: PathBuf,
    pub topology: PathBuf,
    /// Runtime config; the bundled `SimAI.conf` when unset.
    pub config: Option<PathBuf>,
    pub threads: usize,
    /// Send latency in microseconds.
    pub send_latency: Option<u64>,
    pub nvls: bool,
    pub pxn: bool,
    pub output: Option<PathBuf>,
}

impl Default for Ns3Options {
    fn default() -> Self {
        Self {
            workload: PathBuf::new(),
            topology: PathBuf::new(),
            config: None,
            threads: DEFAULT_THREADS,
            send_latency: None,
            nvls: false,
            pxn: false,
            output: None,
        }
    }
}

pub fn outputs() -> OutputSpec {
    OutputSpec::new([
        "*.csv", "fct.txt", "pfc.txt", "qlen.txt", "bw.txt", "rate.txt", "cnp.txt", "*.tr",
    ])
    .with_primary("*EndToEnd.csv")
}

/// Command line; topology and config are the sandbox-local copies.
pub fn build_args(workload: &Path, threads: usize) -> Vec<String> {
    vec![
        "-w".to_string(),
        workload.display().to_string(),
        "-n".to_string(),
        TOPOLOGY_FILE.to_string(),
        "-c".to_string(),
        CONFIG_FILE.to_string(),
        "-t".to_string(),
        threads.to_string(),
    ]
}

/// `AS_*` variables read by the simulator.
pub fn build_env(opts: &Ns3Options) -> Vec<(&'static str, String)> {
    // AS_LOG_LEVEL=0 stops the binary from opening /etc/astra-sim/SimAI.log.
    let mut env = vec![("AS_LOG_LEVEL", "0".to_string())];
    if let Some(latency) = opts.send_latency {
        env.push(("AS_SEND_LAT", latency.to_string()));
    }
    if opts.nvls {
        env.push(("AS_NVLS_ENABLE", "1".to_string()));
    }
    if opts.pxn {
        env.push(("AS_PXN_ENABLE", "1".to_string()));
    }
    env
}

#[instrument(skip_all, fields(workload = %opts.workload.display()))]
pub fn run<E: EnvSource>(ctx: &Context<'_, E>, opts: &Ns3Options) -> Result<SimulationOutcome> {
    let workload = workload_path(&opts.workload)?;
    validated_metadata(&workload, &opts.topology)?;
    let rendered = load_topology(&opts.topology)?.render(Convention::Raw);

    let (config, strict) = match &opts.config {
        Some(path) => (path.clone(), false),
        None => (
            ctx.resolver
                .resolve(&resources::simai_conf())
                .context("locate default SimAI.conf; pass --config or set SIMAI_PATH")?,
            true,
        ),
    };
    let binary = ctx.resolver.resolve_binary(NS3_BINARY).context("simulate ns3")?;
    let dest = destination(opts.output.as_deref())?;

    let mut request = RunRequest::new("ns3", binary, dest.clone())
        .args(build_args(&workload, opts.threads))
        .stage(StagedInput::copy(config, CONFIG_FILE))
        .outputs(outputs());
    for name in PLACEHOLDER_INPUTS {
        request = request.touch(name);
    }
    for (key, value) in build_env(opts) {
        request = request.env(key, value);
    }

    let report = ctx
        .sandbox
        .run_prepared(request, |session| prepare(session, &rendered, strict))
        .context("simulate ns3")?;
    Ok(SimulationOutcome::from_report(&dest, report))
}

/// Write the raw topology and point the config's output paths at the session.
fn prepare(session: &SandboxSession, topology: &str, strict: bool) -> crate::Result<()> {
    let topo_path = session.join(TOPOLOGY_FILE);
    fs::write(&topo_path, topology)
        .map_err(|e| Error::io(format!("write {}", topo_path.display()), e))?;

    // The config lives in the session, so the backup is never restored.
    match patcher::patch(&session.join(CONFIG_FILE), &sandbox_config_paths()) {
        Ok(record) => {
            drop(record);
            Ok(())
        }
        Err(Error::PatchTargetMissing {
            reason: MissingTarget::Pattern(prefix),
            ..
        }) if !strict => {
            info!(%prefix, "config has no absolute output prefix; using it unchanged");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
