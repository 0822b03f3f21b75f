//! Analytical backend (`SimAI_analytical`).
//!
//! The binary reads ratio tables from `./astra-sim-alibabacloud/inputs/ratio/`
//! and writes into `./results/`, so both are provided inside the sandbox.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::instrument;

use super::{Context, SimulationOutcome, destination, validated_metadata, workload_path};
use crate::core::resources::{self, ANALYTICAL_BINARY, ASTRA_SIM_DIR, EnvSource};
use crate::core::topology::TopologyMetadata;
use crate::io::sandbox::{OutputSpec, RunRequest, StagedInput};

pub const RESULTS_DIR: &str = "results";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticalOptions {
    pub workload: PathBuf,
    pub topology: PathBuf,
    pub output: Option<PathBuf>,
    /// Bus-bandwidth table.
    pub busbw: Option<PathBuf>,
    pub dp_overlap: Option<f64>,
    pub tp_overlap: Option<f64>,
    pub ep_overlap: Option<f64>,
    pub pp_overlap: Option<f64>,
    /// Result file prefix; defaults to the workload file stem.
    pub result_prefix: Option<String>,
}

pub fn outputs() -> OutputSpec {
    OutputSpec::new(["results/*"]).with_primary("results/*EndToEnd.csv")
}

/// Command line for the analytical binary.
///
/// `-r` is always passed: the binary's own prefix derivation fails on
/// workload names outside its expected pattern.
pub fn build_args(
    opts: &AnalyticalOptions,
    workload: &Path,
    busbw: Option<&Path>,
    meta: &TopologyMetadata,
) -> Vec<String> {
    let mut args = vec![
        "-w".to_string(),
        workload.display().to_string(),
        "-g".to_string(),
        meta.num_gpus.to_string(),
        "-g_p_s".to_string(),
        meta.gpus_per_server.to_string(),
    ];
    let mut push = |flag: &str, value: Option<String>| {
        if let Some(value) = value {
            args.push(flag.to_string());
            args.push(value);
        }
    };
    push("-nv", meta.nvlink_bandwidth_gbps.map(|v| v.to_string()));
    push("-nic", meta.nic_bandwidth_gbps.map(|v| v.to_string()));
    push("-n_p_s", meta.nics_per_switch.map(|v| v.to_string()));
    push("-busbw", busbw.map(|p| p.display().to_string()));
    push("-g_type", meta.gpu_type.clone());
    push("-dp_o", opts.dp_overlap.map(|v| v.to_string()));
    push("-tp_o", opts.tp_overlap.map(|v| v.to_string()));
    push("-ep_o", opts.ep_overlap.map(|v| v.to_string()));
    push("-pp_o", opts.pp_overlap.map(|v| v.to_string()));

    let prefix = opts.result_prefix.clone().unwrap_or_else(|| {
        workload
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    });
    push("-r", Some(prefix));
    args
}

#[instrument(skip_all, fields(workload = %opts.workload.display()))]
pub fn run<E: EnvSource>(ctx: &Context<'_, E>, opts: &AnalyticalOptions) -> Result<SimulationOutcome> {
    let workload = workload_path(&opts.workload)?;
    let meta = validated_metadata(&workload, &opts.topology)?;
    let busbw = opts
        .busbw
        .as_deref()
        .map(|p| std::path::absolute(p).with_context(|| format!("absolutize {}", p.display())))
        .transpose()?;
    let binary = ctx
        .resolver
        .resolve_binary(ANALYTICAL_BINARY)
        .context("simulate analytical")?;
    let dest = destination(opts.output.as_deref())?;

    let mut request = RunRequest::new("analytical", binary, dest.clone())
        .args(build_args(opts, &workload, busbw.as_deref(), &meta))
        .create_dir(RESULTS_DIR)
        .outputs(outputs());
    if let Some(data) = ctx.resolve_optional(&resources::astra_sim_root()) {
        request = request.stage(StagedInput::link(data, ASTRA_SIM_DIR));
    }

    let report = ctx.sandbox.run(request).context("simulate analytical")?;
    Ok(SimulationOutcome::from_report(&dest, report))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn args_include_metadata_and_default_prefix() {
        let meta = TopologyMetadata {
            kind: "Spectrum-X".to_string(),
            num_gpus: 16,
            gpus_per_server: 8,
            gpu_type: Some("H100".to_string()),
            nic_bandwidth_gbps: Some(400.0),
            nvlink_bandwidth_gbps: Some(2880.0),
            nics_per_switch: Some(64),
            extra: BTreeMap::new(),
        };
        let opts = AnalyticalOptions {
            dp_overlap: Some(0.5),
            ..AnalyticalOptions::default()
        };
        let args = build_args(&opts, Path::new("/w/gpt_13b.txt"), None, &meta);
        assert_eq!(
            args,
            [
                "-w", "/w/gpt_13b.txt", "-g", "16", "-g_p_s", "8", "-nv", "2880", "-nic", "400",
                "-n_p_s", "64", "-g_type", "H100", "-dp_o", "0.5", "-r", "gpt_13b",
            ]
        );
    }

    #[test]
    fn explicit_prefix_wins() {
        let meta = TopologyMetadata {
            kind: "DCN+".to_string(),
            num_gpus: 8,
            gpus_per_server: 8,
            gpu_type: None,
            nic_bandwidth_gbps: None,
            nvlink_bandwidth_gbps: None,
            nics_per_switch: None,
            extra: BTreeMap::new(),
        };
        let opts = AnalyticalOptions {
            result_prefix: Some("run1".to_string()),
            ..AnalyticalOptions::default()
        };
        let args = build_args(&opts, Path::new("wl.txt"), Some(Path::new("/b/busbw.yaml")), &meta);
        assert_eq!(&args[6..], ["-busbw", "/b/busbw.yaml", "-r", "run1"]);
    }
}
