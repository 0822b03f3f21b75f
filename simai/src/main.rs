//! `simai`: run SimAI simulation backends, generate their inputs, and
//! install optional components.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::warn;

use simai::backends::{self, Context, analytical, m4, ns3};
use simai::bench::{self, BenchOptions, Cluster};
use simai::core::resources::ResourceKind;
use simai::core::units::Convention;
use simai::core::workload::{ComputeProfile, Framework, WorkloadParams};
use simai::generate::{self, TopologyOptions};
use simai::install::{self, InstallOptions, InstallOutcome};
use simai::io::config::{load_config, resolve_config_path};
use simai::io::process::CancelToken;
use simai::io::resolver::{ProcessEnv, Resolver};
use simai::io::sandbox::Sandbox;
use simai::io::topology_store::{TOPOLOGY_FILE, convert_topology_file};
use simai::{exit_codes, logging};

#[derive(Parser)]
#[command(name = "simai", version, about = "Run and feed the SimAI simulation backends")]
struct Cli {
    /// Orchestrator config (default: $SIMAI_CONFIG, then ./simai.toml).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at info level and echo backend stdout.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a network simulation.
    #[command(subcommand)]
    Simulate(SimulateCommand),
    /// Generate workloads and topologies.
    #[command(subcommand, visible_alias = "gen")]
    Generate(GenerateCommand),
    /// Work with topology directories.
    #[command(subcommand)]
    Topology(TopologyCommand),
    /// Run benchmarks on real hardware.
    #[command(subcommand)]
    Bench(BenchCommand),
    /// Build and install optional backends.
    #[command(subcommand)]
    Install(InstallCommand),
    /// Print where a binary or data file resolves to.
    Resolve {
        /// binary, data-dir, or config-file.
        kind: ResourceKind,
        name: String,
    },
}

#[derive(Subcommand)]
enum SimulateCommand {
    /// Analytical (fast, bus-bandwidth based) simulation.
    Analytical(AnalyticalArgs),
    /// Packet-level ns-3 simulation.
    Ns3(Ns3Args),
    /// Flow-level m4 simulation.
    M4(M4Args),
}

#[derive(Args)]
struct SimInputs {
    /// Workload file (from `simai generate workload`).
    #[arg(short, long)]
    workload: PathBuf,
    /// Topology directory (from `simai generate topology`).
    #[arg(short = 'n', long)]
    topology: PathBuf,
    /// Result directory, or a file path for the primary result.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct AnalyticalArgs {
    #[command(flatten)]
    inputs: SimInputs,
    /// Bus-bandwidth table.
    #[arg(long)]
    busbw: Option<PathBuf>,
    /// Data-parallel compute/communication overlap ratio.
    #[arg(long)]
    dp_overlap: Option<f64>,
    #[arg(long)]
    tp_overlap: Option<f64>,
    #[arg(long)]
    ep_overlap: Option<f64>,
    #[arg(long)]
    pp_overlap: Option<f64>,
    /// Result file prefix (default: workload file stem).
    #[arg(long)]
    result_prefix: Option<String>,
}

#[derive(Args)]
struct Ns3Args {
    #[command(flatten)]
    inputs: SimInputs,
    /// SimAI runtime config (default: bundled SimAI.conf).
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long, default_value_t = ns3::DEFAULT_THREADS)]
    threads: usize,
    /// Send latency in microseconds.
    #[arg(long)]
    send_latency: Option<u64>,
    /// Enable NVLink Switch.
    #[arg(long)]
    nvls: bool,
    /// Enable PXN.
    #[arg(long)]
    pxn: bool,
}

#[derive(Args)]
struct M4Args {
    #[command(flatten)]
    inputs: SimInputs,
    #[arg(short, long, default_value_t = m4::DEFAULT_THREADS)]
    threads: usize,
}

#[derive(Subcommand)]
enum GenerateCommand {
    /// Generate a training workload file via AICB.
    Workload(WorkloadArgs),
    /// Generate a topology directory.
    #[command(visible_alias = "topo")]
    Topology(TopologyArgs),
}

/// Model shape and parallelism shared by workload generation and benchmarks.
#[derive(Args)]
struct ModelArgs {
    #[arg(short, long, default_value = "Megatron")]
    framework: Framework,
    #[arg(long, visible_alias = "tp", default_value_t = 1)]
    tensor_parallel: usize,
    #[arg(long, visible_alias = "pp", default_value_t = 1)]
    pipeline_parallel: usize,
    #[arg(long, visible_alias = "ep", default_value_t = 1)]
    expert_parallel: usize,
    #[arg(long, default_value_t = 4)]
    global_batch_size: usize,
    #[arg(long, default_value_t = 1)]
    micro_batch_size: usize,
    #[arg(long, default_value_t = 24)]
    num_layers: usize,
    #[arg(long, default_value_t = 1024)]
    hidden_size: usize,
    #[arg(long, visible_alias = "seq", default_value_t = 2048)]
    sequence_length: usize,
    /// Attention heads (default: number of layers).
    #[arg(long)]
    num_heads: Option<usize>,
    #[arg(long, default_value_t = 32000)]
    vocab_size: usize,
    /// Mixture of Experts (requires --sequence-parallel).
    #[arg(long)]
    moe: bool,
    #[arg(long, default_value_t = 1)]
    num_experts: usize,
    /// Experts routed per token.
    #[arg(long, default_value_t = 1)]
    top_k: usize,
    #[arg(long, visible_alias = "sp")]
    sequence_parallel: bool,
    #[arg(long)]
    flash_attention: bool,
    #[arg(long)]
    swiglu: bool,
    #[arg(long)]
    distributed_optimizer: bool,
}

impl ModelArgs {
    fn into_params(self, world_size: usize) -> WorkloadParams {
        WorkloadParams {
            framework: self.framework,
            world_size,
            tensor_parallel: self.tensor_parallel,
            pipeline_parallel: self.pipeline_parallel,
            expert_parallel: self.expert_parallel,
            global_batch: self.global_batch_size,
            micro_batch: self.micro_batch_size,
            num_layers: self.num_layers,
            hidden_size: self.hidden_size,
            seq_length: self.sequence_length,
            num_attention_heads: self.num_heads,
            vocab_size: self.vocab_size,
            moe: self.moe,
            num_experts: self.num_experts,
            moe_router_topk: self.top_k,
            sequence_parallel: self.sequence_parallel,
            flash_attn: self.flash_attention,
            swiglu: self.swiglu,
            distributed_optimizer: self.distributed_optimizer,
            ..WorkloadParams::default()
        }
    }
}

#[derive(Args)]
struct WorkloadArgs {
    /// Total GPUs (world size).
    #[arg(short = 'g', long, default_value_t = 1)]
    num_gpus: usize,
    #[command(flatten)]
    model: ModelArgs,
    /// Training iterations.
    #[arg(long = "iter", default_value_t = 1)]
    iterations: usize,
    /// Measure compute times on the local GPU (needs torch).
    #[arg(long, conflicts_with = "compute_profile")]
    profile_compute: bool,
    /// Precomputed compute profile.
    #[arg(long)]
    compute_profile: Option<PathBuf>,
    #[arg(long)]
    gpu_type: Option<String>,
    /// Output file (`.txt` is appended when missing).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct TopologyArgs {
    /// Spectrum-X, AlibabaHPN, or DCN+.
    #[arg(short = 't', long = "type")]
    kind: String,
    #[arg(short = 'g', long)]
    num_gpus: Option<usize>,
    #[arg(long)]
    gpus_per_server: Option<usize>,
    #[arg(long)]
    gpu_type: Option<String>,
    /// e.g. 400Gbps.
    #[arg(long)]
    nic_bandwidth: Option<String>,
    #[arg(long)]
    nvlink_bandwidth: Option<String>,
    #[arg(long)]
    nics_per_switch: Option<usize>,
    #[arg(long)]
    aggregate_switches: Option<usize>,
    #[arg(long)]
    pod_switches: Option<usize>,
    #[arg(long)]
    aggregate_bandwidth: Option<String>,
    #[arg(long)]
    switches_per_pod: Option<usize>,
    #[arg(long)]
    nv_switches_per_server: Option<usize>,
    /// e.g. 0.000025ms.
    #[arg(long)]
    nvlink_latency: Option<String>,
    #[arg(long)]
    nic_latency: Option<String>,
    #[arg(long)]
    error_rate: Option<String>,
    #[arg(long)]
    dual_tor: bool,
    #[arg(long)]
    dual_plane: bool,
    /// Output directory (default: named after the generated file).
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum TopologyCommand {
    /// Rewrite a topology file into a backend's unit dialect.
    Convert {
        /// Topology directory or file.
        path: PathBuf,
        #[arg(long, value_enum)]
        backend: Backend,
        /// Destination file (default: rewrite in place).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// Bare numbers (bit/s, s).
    Ns3,
    /// Gbps / ms suffixes.
    M4,
}

impl Backend {
    fn convention(self) -> Convention {
        match self {
            Backend::Ns3 => Convention::Raw,
            Backend::M4 => Convention::Suffixed,
        }
    }
}

#[derive(Subcommand)]
enum BenchCommand {
    /// Distributed AICB training benchmark via torchrun (SLURM-aware).
    Training(TrainingArgs),
}

#[derive(Args)]
struct TrainingArgs {
    /// Nodes (default: $SLURM_NNODES or 1).
    #[arg(short = 'N', long)]
    nnodes: Option<usize>,
    /// This node's rank (default: $SLURM_NODEID or 0).
    #[arg(long)]
    node_rank: Option<usize>,
    /// GPUs per node (default: $SLURM_GPUS_PER_NODE, $SLURM_NTASKS_PER_NODE, or 1).
    #[arg(short = 'g', long)]
    nproc_per_node: Option<usize>,
    #[arg(long)]
    master_addr: Option<String>,
    #[arg(long)]
    master_port: Option<u16>,
    /// Total GPUs (default: nnodes x nproc-per-node).
    #[arg(long)]
    world_size: Option<usize>,
    #[command(flatten)]
    model: ModelArgs,
    /// Enable compute/communication overlap.
    #[arg(long)]
    aiob: bool,
    /// Compute profile; implies --aiob.
    #[arg(long)]
    comp_profile: Option<PathBuf>,
    #[arg(long, default_value_t = 1)]
    epochs: usize,
    #[arg(short, long, default_value = bench::DEFAULT_OUTPUT_DIR)]
    output: PathBuf,
}

#[derive(Subcommand)]
enum InstallCommand {
    /// Build SimAI_m4 from source (needs CUDA-enabled PyTorch, cmake, make, gcc).
    M4 {
        /// simai-m4 source checkout.
        #[arg(long)]
        src: Option<PathBuf>,
        #[arg(long, default_value = install::M4_GIT_URL)]
        git_url: String,
        /// Reinstall even if SimAI_m4 already exists.
        #[arg(long)]
        force: bool,
        /// Maximum concurrent flows compiled into the binary.
        #[arg(long, default_value_t = simai::core::patch_rules::DEFAULT_M4_FLOW_CAPACITY)]
        n_flows_max: u64,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("{:#}", err);
        std::process::exit(exit_codes::for_error(&err));
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&resolve_config_path(cli.config.as_deref()))?;
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler_token.cancel()) {
        warn!(err = %e, "could not install Ctrl-C handler");
    }
    let sandbox = Sandbox::from_config(&config, cancel, cli.verbose);
    let resolver = Resolver::from_process();
    let ctx = Context {
        resolver: &resolver,
        sandbox: &sandbox,
        config: &config,
    };

    match cli.command {
        Command::Simulate(cmd) => cmd_simulate(&ctx, cmd),
        Command::Generate(GenerateCommand::Workload(args)) => cmd_generate_workload(&ctx, args),
        Command::Generate(GenerateCommand::Topology(args)) => cmd_generate_topology(&ctx, args),
        Command::Topology(TopologyCommand::Convert {
            path,
            backend,
            output,
        }) => cmd_convert(&path, backend, output.as_deref()),
        Command::Bench(BenchCommand::Training(args)) => cmd_bench(&ctx, args),
        Command::Install(InstallCommand::M4 {
            src,
            git_url,
            force,
            n_flows_max,
        }) => cmd_install(
            &ctx,
            &InstallOptions {
                src,
                git_url,
                force,
                n_flows_max,
            },
        ),
        Command::Resolve { kind, name } => {
            println!("{}", resolver.resolve_named(kind, &name)?.display());
            Ok(())
        }
    }
}

fn cmd_simulate(ctx: &Context<'_, ProcessEnv>, cmd: SimulateCommand) -> Result<()> {
    let outcome = match cmd {
        SimulateCommand::Analytical(args) => analytical::run(
            ctx,
            &analytical::AnalyticalOptions {
                workload: args.inputs.workload,
                topology: args.inputs.topology,
                output: args.inputs.output,
                busbw: args.busbw,
                dp_overlap: args.dp_overlap,
                tp_overlap: args.tp_overlap,
                ep_overlap: args.ep_overlap,
                pp_overlap: args.pp_overlap,
                result_prefix: args.result_prefix,
            },
        )?,
        SimulateCommand::Ns3(args) => ns3::run(
            ctx,
            &ns3::Ns3Options {
                workload: args.inputs.workload,
                topology: args.inputs.topology,
                config: args.config,
                threads: args.threads,
                send_latency: args.send_latency,
                nvls: args.nvls,
                pxn: args.pxn,
                output: args.inputs.output,
            },
        )?,
        SimulateCommand::M4(args) => m4::run(
            ctx,
            &m4::M4Options {
                workload: args.inputs.workload,
                topology: args.inputs.topology,
                threads: args.threads,
                output: args.inputs.output,
            },
        )?,
    };
    report_results(&outcome);
    Ok(())
}

fn report_results(outcome: &backends::SimulationOutcome) {
    if outcome.files.is_empty() {
        println!("Warning: no result files generated");
    }
    println!("Results saved to: {}", outcome.destination.display());
}

fn cmd_generate_workload(ctx: &Context<'_, ProcessEnv>, args: WorkloadArgs) -> Result<()> {
    let compute_profile = match (args.profile_compute, args.compute_profile) {
        (_, Some(path)) => ComputeProfile::File(path),
        (true, None) => ComputeProfile::Live,
        (false, None) => ComputeProfile::Disabled,
    };
    let params = WorkloadParams {
        iterations: args.iterations,
        compute_profile,
        gpu_type: args.gpu_type,
        ..args.model.into_params(args.num_gpus)
    };
    let path = generate::workload(ctx, &params, args.output.as_deref())?;
    println!("Workload saved to: {}", path.display());
    Ok(())
}

fn cmd_generate_topology(ctx: &Context<'_, ProcessEnv>, args: TopologyArgs) -> Result<()> {
    let opts = TopologyOptions {
        kind: args.kind,
        num_gpus: args.num_gpus,
        gpus_per_server: args.gpus_per_server,
        gpu_type: args.gpu_type,
        nic_bandwidth: args.nic_bandwidth,
        nvlink_bandwidth: args.nvlink_bandwidth,
        nics_per_switch: args.nics_per_switch,
        aggregate_switches: args.aggregate_switches,
        pod_switches: args.pod_switches,
        aggregate_bandwidth: args.aggregate_bandwidth,
        switches_per_pod: args.switches_per_pod,
        nv_switches_per_server: args.nv_switches_per_server,
        nvlink_latency: args.nvlink_latency,
        nic_latency: args.nic_latency,
        error_rate: args.error_rate,
        dual_tor: args.dual_tor,
        dual_plane: args.dual_plane,
        output: args.output,
    };
    let dir = generate::topology(ctx, &opts)?;
    println!("Topology saved to: {}", dir.display());
    Ok(())
}

fn cmd_convert(path: &Path, backend: Backend, output: Option<&Path>) -> Result<()> {
    let src = if path.is_dir() {
        path.join(TOPOLOGY_FILE)
    } else {
        path.to_path_buf()
    };
    let dst = output.map_or_else(|| src.clone(), Path::to_path_buf);
    convert_topology_file(&src, &dst, backend.convention())
        .with_context(|| format!("convert {}", src.display()))?;
    println!("Topology written to: {}", dst.display());
    Ok(())
}

fn cmd_bench(ctx: &Context<'_, ProcessEnv>, args: TrainingArgs) -> Result<()> {
    let slurm = Cluster::from_env(&ProcessEnv);
    let cluster = Cluster {
        nnodes: args.nnodes.unwrap_or(slurm.nnodes),
        node_rank: args.node_rank.unwrap_or(slurm.node_rank),
        nproc_per_node: args.nproc_per_node.unwrap_or(slurm.nproc_per_node),
        master_addr: args.master_addr.unwrap_or(slurm.master_addr),
        master_port: args.master_port.unwrap_or(slurm.master_port),
    };
    let compute_profile = match (args.comp_profile, args.aiob) {
        (Some(path), _) => ComputeProfile::File(path),
        (None, true) => ComputeProfile::Live,
        (None, false) => ComputeProfile::Disabled,
    };
    let mut opts = BenchOptions {
        cluster,
        world_size: args.world_size,
        model: args.model.into_params(0),
        output: args.output,
    };
    opts.model.world_size = opts.world_size();
    opts.model.iterations = args.epochs;
    opts.model.compute_profile = compute_profile;

    let outcome = bench::training(ctx, &opts)?;
    report_results(&outcome);
    Ok(())
}

fn cmd_install(ctx: &Context<'_, ProcessEnv>, opts: &InstallOptions) -> Result<()> {
    match install::m4(ctx, opts)? {
        InstallOutcome::AlreadyInstalled(path) => println!(
            "SimAI_m4 is already installed at {}. Use --force to reinstall.",
            path.display()
        ),
        InstallOutcome::Installed(path) => println!("SimAI_m4 installed to {}", path.display()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simulate_ns3_with_backend_config() {
        let cli = Cli::parse_from([
            "simai", "--config", "simai.toml", "simulate", "ns3", "-w", "wl.txt", "-n", "topo",
            "--config", "SimAI.conf", "--nvls",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("simai.toml")));
        let Command::Simulate(SimulateCommand::Ns3(args)) = cli.command else {
            panic!("expected simulate ns3");
        };
        assert_eq!(args.config, Some(PathBuf::from("SimAI.conf")));
        assert_eq!(args.threads, ns3::DEFAULT_THREADS);
        assert!(args.nvls && !args.pxn);
    }

    #[test]
    fn parse_gen_topo_aliases() {
        let cli = Cli::parse_from(["simai", "gen", "topo", "-t", "Spectrum-X", "-g", "128"]);
        let Command::Generate(GenerateCommand::Topology(args)) = cli.command else {
            panic!("expected generate topology");
        };
        assert_eq!(args.kind, "Spectrum-X");
        assert_eq!(args.num_gpus, Some(128));
    }

    #[test]
    fn parse_workload_short_flags() {
        let cli = Cli::parse_from([
            "simai", "generate", "workload", "-g", "16", "--tp", "4", "--seq", "4096", "--sp",
            "--moe", "-f", "deepseek",
        ]);
        let Command::Generate(GenerateCommand::Workload(args)) = cli.command else {
            panic!("expected generate workload");
        };
        let params = args.model.into_params(args.num_gpus);
        assert_eq!(params.world_size, 16);
        assert_eq!(params.tensor_parallel, 4);
        assert_eq!(params.seq_length, 4096);
        assert_eq!(params.framework, Framework::DeepSeek);
        params.validate().expect("moe with sequence parallel is valid");
    }

    #[test]
    fn parse_resolve_kind() {
        let cli = Cli::parse_from(["simai", "resolve", "data-dir", "aicb"]);
        assert!(matches!(
            cli.command,
            Command::Resolve { kind: ResourceKind::DataDir, ref name } if name == "aicb"
        ));
    }
}
