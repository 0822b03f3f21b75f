//! Workload generation parameters and the workload-file header.
//!
//! [`WorkloadParams`] is the explicit configuration object handed to the
//! vendored generator. Derived values (data-parallel degree, padded vocab, FFN
//! width) are computed here so the generator adapter only forwards them.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde_json::{Value, json};

const VOCAB_DIVISIBLE_BY: usize = 128;

static ALL_GPUS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"all_gpus:\s*(\d+)").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framework {
    #[default]
    Megatron,
    DeepSpeed,
    DeepSeek,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Framework::Megatron => "Megatron",
            Framework::DeepSpeed => "DeepSpeed",
            Framework::DeepSeek => "DeepSeek",
        };
        f.write_str(name)
    }
}

impl FromStr for Framework {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "megatron" => Ok(Framework::Megatron),
            "deepspeed" => Ok(Framework::DeepSpeed),
            "deepseek" => Ok(Framework::DeepSeek),
            other => Err(format!(
                "unknown framework `{other}` (expected Megatron, DeepSpeed, or DeepSeek)"
            )),
        }
    }
}

/// Where per-operation compute times come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ComputeProfile {
    /// No compute times; communication-only workload.
    #[default]
    Disabled,
    /// A precomputed timing table.
    File(PathBuf),
    /// Measure on the local accelerator. Needs `torch`.
    Live,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadParams {
    pub framework: Framework,
    pub world_size: usize,
    pub tensor_parallel: usize,
    pub pipeline_parallel: usize,
    pub expert_parallel: usize,
    pub global_batch: usize,
    pub micro_batch: usize,
    pub num_layers: usize,
    pub hidden_size: usize,
    pub seq_length: usize,
    pub num_attention_heads: Option<usize>,
    pub vocab_size: usize,
    pub moe: bool,
    pub num_experts: usize,
    pub moe_router_topk: usize,
    pub sequence_parallel: bool,
    pub flash_attn: bool,
    pub swiglu: bool,
    pub distributed_optimizer: bool,
    /// Training iterations recorded in the workload.
    pub iterations: usize,
    pub compute_profile: ComputeProfile,
    pub gpu_type: Option<String>,
}

impl Default for WorkloadParams {
    fn default() -> Self {
        Self {
            framework: Framework::Megatron,
            world_size: 1,
            tensor_parallel: 1,
            pipeline_parallel: 1,
            expert_parallel: 1,
            global_batch: 4,
            micro_batch: 1,
            num_layers: 24,
            hidden_size: 1024,
            seq_length: 2048,
            num_attention_heads: None,
            vocab_size: 32000,
            moe: false,
            num_experts: 1,
            moe_router_topk: 1,
            sequence_parallel: false,
            flash_attn: false,
            swiglu: false,
            distributed_optimizer: false,
            iterations: 1,
            compute_profile: ComputeProfile::Disabled,
            gpu_type: None,
        }
    }
}

/// Values computed from [`WorkloadParams`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Derived {
    pub data_parallel: usize,
    pub num_microbatches: usize,
    pub padded_vocab_size: usize,
    pub ffn_hidden_size: usize,
    pub num_attention_heads: usize,
    /// Layers per pipeline stage.
    pub stage_layers: usize,
}

impl WorkloadParams {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("world size", self.world_size),
            ("tensor parallel size", self.tensor_parallel),
            ("pipeline parallel size", self.pipeline_parallel),
            ("expert parallel size", self.expert_parallel),
            ("micro batch", self.micro_batch),
            ("number of layers", self.num_layers),
            ("iterations", self.iterations),
        ] {
            if value == 0 {
                bail!("{name} must be > 0");
            }
        }
        let model_parallel = self.tensor_parallel * self.pipeline_parallel;
        if self.world_size % model_parallel != 0 {
            bail!(
                "world size ({}) must be divisible by tp*pp ({}*{})",
                self.world_size,
                self.tensor_parallel,
                self.pipeline_parallel
            );
        }
        if self.moe && !self.sequence_parallel {
            bail!("MoE requires sequence parallelism (--sequence-parallel)");
        }
        let data_parallel = self.world_size / model_parallel;
        if self.global_batch < data_parallel * self.micro_batch {
            bail!(
                "global batch ({}) must be at least dp*mbs ({data_parallel}*{})",
                self.global_batch,
                self.micro_batch
            );
        }
        Ok(())
    }

    /// Derived values; call [`Self::validate`] first.
    pub fn derive(&self) -> Derived {
        let data_parallel = self.world_size / (self.tensor_parallel * self.pipeline_parallel);
        let stage_layers = if self.pipeline_parallel > 1 {
            self.num_layers / self.pipeline_parallel
        } else {
            self.num_layers
        };
        Derived {
            data_parallel,
            num_microbatches: self.global_batch / (data_parallel * self.micro_batch),
            padded_vocab_size: padded_vocab_size(self.vocab_size, self.tensor_parallel),
            ffn_hidden_size: ffn_hidden_size(self.hidden_size, self.swiglu),
            num_attention_heads: self.num_attention_heads.unwrap_or(self.num_layers),
            stage_layers,
        }
    }

    pub fn gpu_label(&self) -> &str {
        self.gpu_type.as_deref().unwrap_or("default")
    }

    /// The configuration object passed to the generator entry point.
    pub fn generator_config(&self) -> Value {
        let derived = self.derive();
        let (aiob_enable, comp_filepath) = match &self.compute_profile {
            ComputeProfile::Disabled => (false, None),
            ComputeProfile::File(path) => (true, Some(path.display().to_string())),
            ComputeProfile::Live => (true, None),
        };
        json!({
            "frame": self.framework.to_string(),
            "world_size": self.world_size,
            "tensor_model_parallel_size": self.tensor_parallel,
            "pipeline_model_parallel": self.pipeline_parallel,
            "expert_model_parallel_size": self.expert_parallel,
            "global_batch": self.global_batch,
            "micro_batch": self.micro_batch,
            "num_layers": derived.stage_layers,
            "hidden_size": self.hidden_size,
            "seq_length": self.seq_length,
            "num_attention_heads": derived.num_attention_heads,
            "vocab_size": self.vocab_size,
            "padded_vocab_size": derived.padded_vocab_size,
            "ffn_hidden_size": derived.ffn_hidden_size,
            "dp_num": derived.data_parallel,
            "num_microbatches": derived.num_microbatches,
            "moe_enable": self.moe,
            "num_experts": self.num_experts,
            "moe_router_topk": self.moe_router_topk,
            "moe_grouped_gemm": false,
            "enable_sequence_parallel": self.sequence_parallel,
            "use_flash_attn": self.flash_attn,
            "swiglu": self.swiglu,
            "gated_linear_unit": self.swiglu,
            "use_distributed_optimizer": self.distributed_optimizer,
            "computation_enable": false,
            "aiob_enable": aiob_enable,
            "comp_filepath": comp_filepath,
            "workload_only": true,
            "epoch_num": self.iterations,
            "pp_rank": -1,
            "add_bias_linear": false,
            "dtype": "bfloat16",
            "model_name": self.gpu_label(),
            "gpu_type": self.gpu_label(),
            "max_position_embeddings": 4096,
            "make_vocab_size_divisible_by": VOCAB_DIVISIBLE_BY,
            "recompute_activations": false,
            "bias_gelu_fusion": false,
            "openai_gelu": false,
            "onnx_safe": false,
            "squared_relu": false,
            "overlap_version": false,
            "context_parallel_size": 1,
            "activation_func": null,
            "enable_visual": false,
            "n_dense_layers": 3,
            "n_shared_expert": 2,
            "qk_rope_dim": 64,
            "qk_nope_dim": 128,
            "q_lora_rank": 1536,
            "kv_lora_rank": 512,
            "v_head_dim": 128,
        })
    }

    /// File name used when no output path is given.
    pub fn default_file_name(&self) -> String {
        let gpu = self.gpu_label();
        format!(
            "{gpu}-{gpu}-world_size{}-tp{}-pp{}-ep{}-gbs{}-mbs{}-seq{}-MOE-{}-GEMM-False-flash_attn-{}.txt",
            self.world_size,
            self.tensor_parallel,
            self.pipeline_parallel,
            self.expert_parallel,
            self.global_batch,
            self.micro_batch,
            self.seq_length,
            title_bool(self.moe),
            title_bool(self.flash_attn),
        )
    }
}

fn title_bool(value: bool) -> &'static str {
    if value { "True" } else { "False" }
}

/// Smallest value >= `vocab_size` divisible by `128 * tp`.
pub fn padded_vocab_size(vocab_size: usize, tensor_parallel: usize) -> usize {
    let multiple = VOCAB_DIVISIBLE_BY * tensor_parallel.max(1);
    vocab_size.div_ceil(multiple) * multiple
}

/// FFN width: `4h`, or the SwiGLU `2/3 * 4h` rounded down to a multiple of 64.
pub fn ffn_hidden_size(hidden_size: usize, swiglu: bool) -> usize {
    if swiglu {
        (4 * hidden_size * 2 / 3) / 64 * 64
    } else {
        4 * hidden_size
    }
}

/// Ensure a workload output path ends in exactly one `.txt`.
pub fn normalise_output(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "txt") {
        return path.to_path_buf();
    }
    let mut name = path.as_os_str().to_os_string();
    name.push(".txt");
    PathBuf::from(name)
}

/// GPU count from the workload header (`all_gpus: N`).
///
/// The first line is always checked; after that only `#` comment lines are.
pub fn parse_all_gpus(text: &str) -> Option<usize> {
    for line in text.lines() {
        if let Some(caps) = ALL_GPUS_RE.captures(line) {
            return caps[1].parse().ok();
        }
        if !line.starts_with('#') {
            break;
        }
    }
    None
}
