//! `simai generate`: workload traces via AICB and topology directories via the
//! upstream topology generator. Both run through the configured Python inside
//! a sandbox.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use minijinja::{Environment, context};
use tracing::{info, instrument, warn};

use crate::backends::Context;
use crate::core::resources::{self, EnvSource};
use crate::core::topology::Topology;
use crate::core::units::{Quantity, parse_quantity};
use crate::core::workload::{ComputeProfile, WorkloadParams, normalise_output};
use crate::error::Error;
use crate::io::sandbox::{Destination, OutputSpec, RunRequest, StagedInput};
use crate::io::shim::{PythonProbe, dependency_from_stderr, with_stubs};
use crate::io::topology_store::{TOPOLOGY_FILE, write_metadata};

const ENTRY_TEMPLATE: &str = include_str!("io/templates/workload_entry.py");
const ENTRY_FILE: &str = "simai_workload_entry.py";
const PARAMS_FILE: &str = "params.json";
const OUTPUT_STEM: &str = "workload";
const STAGED_PROFILE: &str = "compute_profile.txt";
const DEFAULT_WORKLOAD_DIR: &str = "results/workload";

/// Topology templates understood by the upstream generator.
pub const TOPOLOGY_KINDS: [&str; 3] = ["Spectrum-X", "AlibabaHPN", "DCN+"];

/// Final workload path: `--output` with a single `.txt`, else the default name.
pub fn workload_output(params: &WorkloadParams, output: Option<&Path>) -> PathBuf {
    match output {
        Some(path) => normalise_output(path),
        None => Path::new(DEFAULT_WORKLOAD_DIR).join(params.default_file_name()),
    }
}

pub fn render_entry() -> Result<String> {
    let mut env = Environment::new();
    env.add_template("workload_entry", ENTRY_TEMPLATE)
        .context("add workload entry template")?;
    let template = env
        .get_template("workload_entry")
        .context("get workload entry template")?;
    template
        .render(context! {
            params_file => PARAMS_FILE,
            output_stem => OUTPUT_STEM,
        })
        .context("render workload entry")
}

/// Generate a workload file. Returns its final path.
#[instrument(skip_all, fields(world_size = params.world_size, framework = %params.framework))]
pub fn workload<E: EnvSource>(
    ctx: &Context<'_, E>,
    params: &WorkloadParams,
    output: Option<&Path>,
) -> Result<PathBuf> {
    params.validate()?;
    let target = std::path::absolute(workload_output(params, output))
        .context("absolutize workload output")?;
    let aicb = ctx.resolver.resolve(&resources::aicb_root()).context("generate workload")?;

    let mut config = params.generator_config();
    let mut request = RunRequest::new(
        "workload",
        PathBuf::from(&ctx.config.python),
        Destination::File(target.clone()),
    )
    .arg(ENTRY_FILE)
    .outputs(OutputSpec::new([format!("{OUTPUT_STEM}.txt")]).with_primary(format!("{OUTPUT_STEM}.txt")));
    if let ComputeProfile::File(profile) = &params.compute_profile {
        request = request.stage(StagedInput::copy(profile, STAGED_PROFILE));
        config["comp_filepath"] = STAGED_PROFILE.into();
    }
    let entry = render_entry()?;
    let params_json = serde_json::to_string_pretty(&config).context("serialize workload params")?;

    let probe = PythonProbe {
        python: ctx.config.python.clone(),
        cancel: ctx.sandbox.cancel_token().clone(),
    };
    let names = ctx.config.stub_modules.iter().cloned().collect();
    with_stubs(&names, &probe, ctx.config.sandbox_root.as_deref(), |scope| -> Result<()> {
        if params.compute_profile == ComputeProfile::Live {
            scope.require("torch", "live compute profiling")?;
        }
        let python_path = python_path(&[scope.python_path(), aicb.as_path()])?;
        let request = request.env("PYTHONPATH", python_path);
        let outcome = ctx.sandbox.run_prepared(request, |session| {
            for (name, body) in [(ENTRY_FILE, &entry), (PARAMS_FILE, &params_json)] {
                let path = session.join(name);
                fs::write(&path, body).map_err(|e| Error::io(format!("write {}", path.display()), e))?;
            }
            Ok(())
        });
        match outcome {
            Ok(report) if report.primary.is_none() => {
                bail!("workload generator exited cleanly but wrote no {OUTPUT_STEM}.txt")
            }
            Ok(_) => Ok(()),
            Err(e) => Err(stub_failure(e, "workload generation")),
        }
    })?;

    info!(path = %target.display(), "workload generated");
    Ok(target)
}

/// A placeholder's `ImportError` in stderr becomes `DependencyUnavailable`.
pub(crate) fn stub_failure(err: Error, operation: &str) -> anyhow::Error {
    if let Error::ExecutionFailed { stderr, .. } = &err
        && let Some(module) = dependency_from_stderr(stderr)
    {
        return Error::DependencyUnavailable {
            module,
            operation: operation.to_string(),
        }
        .into();
    }
    anyhow::Error::new(err).context(operation.to_string())
}

/// `PYTHONPATH` with `dirs` first, then whatever the caller already had.
pub(crate) fn python_path(dirs: &[&Path]) -> Result<OsString> {
    let mut entries: Vec<PathBuf> = dirs.iter().map(|d| d.to_path_buf()).collect();
    if let Some(existing) = std::env::var_os("PYTHONPATH") {
        entries.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(entries).context("build PYTHONPATH")
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopologyOptions {
    pub kind: String,
    pub num_gpus: Option<usize>,
    pub gpus_per_server: Option<usize>,
    pub gpu_type: Option<String>,
    pub nic_bandwidth: Option<String>,
    pub nvlink_bandwidth: Option<String>,
    pub nics_per_switch: Option<usize>,
    pub aggregate_switches: Option<usize>,
    pub pod_switches: Option<usize>,
    pub aggregate_bandwidth: Option<String>,
    pub switches_per_pod: Option<usize>,
    pub nv_switches_per_server: Option<usize>,
    pub nvlink_latency: Option<String>,
    pub nic_latency: Option<String>,
    pub error_rate: Option<String>,
    pub dual_tor: bool,
    pub dual_plane: bool,
    pub output: Option<PathBuf>,
}

impl TopologyOptions {
    /// Reject unknown kinds and unparsable quantities before launching Python.
    pub fn validate(&self) -> Result<()> {
        if !TOPOLOGY_KINDS.contains(&self.kind.as_str()) {
            bail!(
                "unknown topology type `{}` (expected one of {})",
                self.kind,
                TOPOLOGY_KINDS.join(", ")
            );
        }
        let quantities = [
            (&self.nic_bandwidth, Quantity::Bandwidth),
            (&self.nvlink_bandwidth, Quantity::Bandwidth),
            (&self.aggregate_bandwidth, Quantity::Bandwidth),
            (&self.nvlink_latency, Quantity::Latency),
            (&self.nic_latency, Quantity::Latency),
            (&self.error_rate, Quantity::ErrorRate),
        ];
        for (value, quantity) in quantities {
            if let Some(text) = value {
                parse_quantity(text, quantity)?;
            }
        }
        Ok(())
    }

    /// Arguments for the upstream generator script.
    pub fn generator_args(&self) -> Vec<String> {
        let mut args = vec!["--topology".to_string(), self.kind.clone()];
        let numbers = [
            ("--gpu", self.num_gpus),
            ("--gpu_per_server", self.gpus_per_server),
            ("--nics_per_aswitch", self.nics_per_switch),
            ("--asw_switch_num", self.aggregate_switches),
            ("--psw_switch_num", self.pod_switches),
            ("--asw_per_psw", self.switches_per_pod),
            ("--nv_switch_per_server", self.nv_switches_per_server),
        ];
        for (flag, value) in numbers {
            if let Some(value) = value {
                args.extend([flag.to_string(), value.to_string()]);
            }
        }
        let texts = [
            ("--gpu_type", &self.gpu_type),
            ("--bandwidth", &self.nic_bandwidth),
            ("--nvlink_bw", &self.nvlink_bandwidth),
            ("--ap_bandwidth", &self.aggregate_bandwidth),
            ("--nv_latency", &self.nvlink_latency),
            ("--latency", &self.nic_latency),
            ("--error_rate", &self.error_rate),
        ];
        for (flag, value) in texts {
            if let Some(value) = value {
                args.extend([flag.to_string(), value.clone()]);
            }
        }
        if self.dual_tor {
            args.push("--dt".to_string());
        }
        if self.dual_plane {
            args.push("--dp".to_string());
        }
        args
    }
}

/// Generate a topology directory (`topology` + `metadata.json`). Returns the directory.
#[instrument(skip_all, fields(kind = %opts.kind))]
pub fn topology<E: EnvSource>(ctx: &Context<'_, E>, opts: &TopologyOptions) -> Result<PathBuf> {
    opts.validate()?;
    let script = ctx
        .resolver
        .resolve(&resources::topology_generator())
        .context("generate topology")?;

    let landing_parent = match &opts.output {
        Some(out) => std::path::absolute(out)
            .context("absolutize topology output")?
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&landing_parent)
        .with_context(|| format!("create {}", landing_parent.display()))?;
    let landing = tempfile::Builder::new()
        .prefix(".simai_topo_")
        .tempdir_in(&landing_parent)
        .with_context(|| format!("create staging dir in {}", landing_parent.display()))?;

    let request = RunRequest::new(
        "topo",
        PathBuf::from(&ctx.config.python),
        Destination::Directory(landing.path().to_path_buf()),
    )
    .arg(&script)
    .args(opts.generator_args())
    .outputs(OutputSpec::new(["*"]));
    let report = ctx.sandbox.run(request).context("generate topology")?;

    let generated = match report.relocated.as_slice() {
        [] => bail!("topology generation produced no output file"),
        [only] => only.clone(),
        [first, rest @ ..] => {
            warn!(extra = rest.len(), using = %first.display(), "generator wrote several files");
            first.clone()
        }
    };
    let out_dir = match &opts.output {
        Some(out) => std::path::absolute(out).context("absolutize topology output")?,
        None => {
            let name = generated
                .file_name()
                .context("generated topology has no file name")?;
            std::path::absolute(name).context("absolutize topology output")?
        }
    };

    let text = fs::read_to_string(&generated)
        .with_context(|| format!("read {}", generated.display()))?;
    let metadata = Topology::parse(&text, Some(&generated))?.derive_metadata(&opts.kind);

    fs::create_dir_all(&out_dir).with_context(|| format!("create {}", out_dir.display()))?;
    let dest = out_dir.join(TOPOLOGY_FILE);
    fs::rename(&generated, &dest).with_context(|| format!("move topology to {}", dest.display()))?;
    write_metadata(&out_dir, &metadata)?;
    landing.close().context("remove topology staging dir")?;

    info!(dir = %out_dir.display(), gpus = metadata.num_gpus, "topology generated");
    Ok(out_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_output_gets_single_txt_suffix() {
        let params = WorkloadParams::default();
        assert_eq!(
            workload_output(&params, Some(Path::new("out/gpt"))),
            PathBuf::from("out/gpt.txt")
        );
        assert_eq!(
            workload_output(&params, Some(Path::new("out/gpt.txt"))),
            PathBuf::from("out/gpt.txt")
        );
        let default = workload_output(&params, None);
        assert!(default.starts_with(DEFAULT_WORKLOAD_DIR));
        assert!(default.to_string_lossy().ends_with("flash_attn-False.txt"));
    }

    #[test]
    fn entry_script_names_its_files() {
        let entry = render_entry().expect("render");
        assert!(entry.contains("open(\"params.json\")"));
        assert!(entry.contains("work.dump_file(\"workload\")"));
        assert!(!entry.contains("{{"));
    }

    #[test]
    fn stub_import_error_maps_to_dependency_unavailable() {
        let err = Error::ExecutionFailed {
            binary: PathBuf::from("python3"),
            exit_code: Some(1),
            stderr: "ImportError: simai-stub: dependency unavailable: apex (called apex.amp)\n"
                .to_string(),
        };
        let mapped = stub_failure(err, "workload generation");
        assert!(matches!(
            mapped.downcast_ref::<Error>(),
            Some(Error::DependencyUnavailable { module, .. }) if module == "apex"
        ));

        let plain = Error::ExecutionFailed {
            binary: PathBuf::from("python3"),
            exit_code: Some(2),
            stderr: "boom".to_string(),
        };
        let mapped = stub_failure(plain, "workload generation");
        assert!(matches!(
            mapped.downcast_ref::<Error>(),
            Some(Error::ExecutionFailed { .. })
        ));
    }

    #[test]
    fn topology_args_only_include_given_options() {
        let opts = TopologyOptions {
            kind: "Spectrum-X".to_string(),
            num_gpus: Some(128),
            nic_bandwidth: Some("400Gbps".to_string()),
            dual_tor: true,
            ..TopologyOptions::default()
        };
        opts.validate().expect("valid");
        assert_eq!(
            opts.generator_args(),
            ["--topology", "Spectrum-X", "--gpu", "128", "--bandwidth", "400Gbps", "--dt"]
        );
    }

    #[test]
    fn topology_validation_rejects_bad_input() {
        let unknown = TopologyOptions {
            kind: "Torus".to_string(),
            ..TopologyOptions::default()
        };
        assert!(unknown.validate().unwrap_err().to_string().contains("Torus"));

        let malformed = TopologyOptions {
            kind: "DCN+".to_string(),
            nic_latency: Some("fast".to_string()),
            ..TopologyOptions::default()
        };
        let err = malformed.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MalformedValue { .. })
        ));
    }
}
