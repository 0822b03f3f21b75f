//! `simai bench training`: a distributed AICB training benchmark launched via `torchrun`.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use tracing::{debug, info, instrument};

use crate::backends::{Context, SimulationOutcome};
use crate::core::resources::{self, EnvSource};
use crate::core::workload::{ComputeProfile, WorkloadParams};
use crate::io::sandbox::{Destination, OutputSpec, RunRequest};

pub const DEFAULT_OUTPUT_DIR: &str = "results/bench";
const AICB_SCRIPT: &str = "aicb.py";
const AICB_RESULTS: &str = "results/mocked_workload/*";

/// Node layout for `torchrun`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub nnodes: usize,
    pub node_rank: usize,
    pub nproc_per_node: usize,
    pub master_addr: String,
    pub master_port: u16,
}

impl Default for Cluster {
    fn default() -> Self {
        Self {
            nnodes: 1,
            node_rank: 0,
            nproc_per_node: 1,
            master_addr: "localhost".to_string(),
            master_port: 29500,
        }
    }
}

impl Cluster {
    /// Defaults taken from a SLURM allocation when one is present.
    ///
    /// Unparsable values fall back to the plain defaults.
    pub fn from_env(env: &dyn EnvSource) -> Self {
        let var = |key: &str| env.var_os(key).and_then(|v| v.into_string().ok());
        let int = |key: &str| var(key).and_then(|v| v.trim().parse::<usize>().ok());
        let base = Self::default();
        Self {
            nnodes: int("SLURM_NNODES").unwrap_or(base.nnodes),
            node_rank: int("SLURM_NODEID").unwrap_or(base.node_rank),
            nproc_per_node: int("SLURM_GPUS_PER_NODE")
                .or_else(|| int("SLURM_NTASKS_PER_NODE"))
                .unwrap_or(base.nproc_per_node),
            master_addr: var("MASTER_ADDR").unwrap_or(base.master_addr),
            master_port: var("MASTER_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(base.master_port),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BenchOptions {
    pub cluster: Cluster,
    /// Total GPUs; `nnodes * nproc_per_node` when unset.
    pub world_size: Option<usize>,
    pub model: WorkloadParams,
    pub output: PathBuf,
}

impl BenchOptions {
    pub fn world_size(&self) -> usize {
        self.world_size
            .unwrap_or(self.cluster.nnodes * self.cluster.nproc_per_node)
    }
}

/// Full `torchrun` argument list for `aicb.py`.
pub fn build_args(opts: &BenchOptions, aicb_script: &Path) -> Vec<String> {
    let c = &opts.cluster;
    let m = &opts.model;
    let mut args = vec![
        format!("--nnodes={}", c.nnodes),
        format!("--node_rank={}", c.node_rank),
        format!("--nproc_per_node={}", c.nproc_per_node),
        format!("--master_addr={}", c.master_addr),
        format!("--master_port={}", c.master_port),
        aicb_script.display().to_string(),
    ];
    let values = [
        ("--frame", m.framework.to_string()),
        ("--world_size", opts.world_size().to_string()),
        ("--tensor_model_parallel_size", m.tensor_parallel.to_string()),
        ("--pipeline_model_parallel", m.pipeline_parallel.to_string()),
        ("--expert_model_parallel_size", m.expert_parallel.to_string()),
        ("--global_batch", m.global_batch.to_string()),
        ("--micro_batch", m.micro_batch.to_string()),
        ("--num_layers", m.num_layers.to_string()),
        ("--hidden_size", m.hidden_size.to_string()),
        ("--seq_length", m.seq_length.to_string()),
        (
            "--num_attention_heads",
            m.num_attention_heads.unwrap_or(m.num_layers).to_string(),
        ),
        ("--vocab_size", m.vocab_size.to_string()),
        ("--num_experts", m.num_experts.to_string()),
        ("--moe_router_topk", m.moe_router_topk.to_string()),
        ("--epoch_num", m.iterations.to_string()),
    ];
    for (flag, value) in values {
        args.push(flag.to_string());
        args.push(value);
    }
    let switches = [
        ("--moe_enable", m.moe),
        ("--enable_sequence_parallel", m.sequence_parallel),
        ("--use_flash_attn", m.flash_attn),
        ("--swiglu", m.swiglu),
        ("--use_distributed_optimizer", m.distributed_optimizer),
        ("--aiob_enable", m.compute_profile != ComputeProfile::Disabled),
    ];
    args.extend(
        switches
            .into_iter()
            .filter(|(_, on)| *on)
            .map(|(flag, _)| flag.to_string()),
    );
    if let ComputeProfile::File(path) = &m.compute_profile {
        args.push("--comp_filepath".to_string());
        args.push(path.display().to_string());
    }
    args
}

/// `torchrun` beside the configured interpreter, else the usual binary tiers.
pub fn locate_torchrun<E: EnvSource>(ctx: &Context<'_, E>) -> Result<PathBuf> {
    if let Ok(python) = which::which(&ctx.config.python)
        && let Some(dir) = python.parent()
    {
        let candidate = dir.join("torchrun");
        if candidate.is_file() {
            debug!(path = %candidate.display(), "torchrun found beside python");
            return Ok(candidate);
        }
    }
    ctx.resolver
        .resolve_binary("torchrun")
        .context("locate torchrun; install PyTorch in the configured interpreter")
}

#[instrument(skip_all, fields(world_size = opts.world_size()))]
pub fn training<E: EnvSource>(ctx: &Context<'_, E>, opts: &BenchOptions) -> Result<SimulationOutcome> {
    let torchrun = locate_torchrun(ctx)?;
    let aicb = ctx
        .resolver
        .resolve(&resources::aicb_root())
        .context("bench training")?;
    let output = std::path::absolute(&opts.output)
        .with_context(|| format!("absolutize {}", opts.output.display()))?;
    let mut opts = opts.clone();
    if let ComputeProfile::File(path) = &opts.model.compute_profile {
        let absolute = std::path::absolute(path)
            .with_context(|| format!("absolutize {}", path.display()))?;
        opts.model.compute_profile = ComputeProfile::File(absolute);
    }

    let dest = Destination::Directory(output.clone());
    let request = RunRequest::new("bench", torchrun, dest)
        .args(build_args(&opts, &aicb.join(AICB_SCRIPT)))
        .outputs(OutputSpec::new([AICB_RESULTS]));
    let report = ctx.sandbox.run(request).context("bench training")?;

    info!(files = report.relocated.len(), "benchmark finished");
    Ok(SimulationOutcome {
        destination: output,
        files: report.relocated,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn slurm_variables_provide_defaults() {
        let env = BTreeMap::from([
            ("SLURM_NNODES".to_string(), "4".to_string()),
            ("SLURM_NODEID".to_string(), "2".to_string()),
            ("SLURM_NTASKS_PER_NODE".to_string(), "8".to_string()),
            ("MASTER_PORT".to_string(), "not-a-port".to_string()),
        ]);
        let cluster = Cluster::from_env(&env);
        assert_eq!(cluster.nnodes, 4);
        assert_eq!(cluster.node_rank, 2);
        assert_eq!(cluster.nproc_per_node, 8);
        assert_eq!(cluster.master_addr, "localhost");
        assert_eq!(cluster.master_port, 29500);
    }

    #[test]
    fn args_derive_world_size_and_flags() {
        let opts = BenchOptions {
            cluster: Cluster {
                nnodes: 2,
                nproc_per_node: 8,
                ..Cluster::default()
            },
            world_size: None,
            model: WorkloadParams {
                moe: true,
                sequence_parallel: true,
                compute_profile: ComputeProfile::File(PathBuf::from("/p/h100.txt")),
                ..WorkloadParams::default()
            },
            output: PathBuf::from(DEFAULT_OUTPUT_DIR),
        };
        let args = build_args(&opts, Path::new("/aicb/aicb.py"));
        assert_eq!(args[0], "--nnodes=2");
        assert_eq!(args[5], "/aicb/aicb.py");
        let ws = args.iter().position(|a| a == "--world_size").expect("flag");
        assert_eq!(args[ws + 1], "16");
        let heads = args.iter().position(|a| a == "--num_attention_heads").expect("flag");
        assert_eq!(args[heads + 1], "24");
        assert_eq!(
            &args[args.len() - 5..],
            [
                "--moe_enable",
                "--enable_sequence_parallel",
                "--aiob_enable",
                "--comp_filepath",
                "/p/h100.txt"
            ]
        );
    }
}
