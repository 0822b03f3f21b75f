//! Simulation backends: argument building, staging, and declared outputs.
//!
//! Each backend resolves its binary and data, validates the topology directory
//! against the workload, and runs through the shared [`Sandbox`].

pub mod analytical;
pub mod m4;
pub mod ns3;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use tracing::warn;

use crate::core::resources::{EnvSource, Resource};
use crate::core::topology::TopologyMetadata;
use crate::core::workload::parse_all_gpus;
use crate::io::config::SimaiConfig;
use crate::io::resolver::{ProcessEnv, Resolver};
use crate::io::sandbox::{Destination, RunReport, Sandbox};
use crate::io::topology_store::load_metadata;

/// Directory used when no `--output` is given.
pub const DEFAULT_OUTPUT_DIR: &str = "results";

/// Shared collaborators for one command invocation.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a, E = ProcessEnv> {
    pub resolver: &'a Resolver<E>,
    pub sandbox: &'a Sandbox,
    pub config: &'a SimaiConfig,
}

impl<E: EnvSource> Context<'_, E> {
    /// Resolve an optional data resource, logging instead of failing when absent.
    pub(crate) fn resolve_optional(&self, resource: &Resource) -> Option<PathBuf> {
        match self.resolver.resolve(resource) {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(resource = %resource.name, "{err}");
                None
            }
        }
    }
}

/// Where a simulation's results ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationOutcome {
    pub destination: PathBuf,
    pub files: Vec<PathBuf>,
}

impl SimulationOutcome {
    pub(crate) fn from_report(destination: &Destination, report: RunReport) -> Self {
        Self {
            destination: destination.path().to_path_buf(),
            files: report.relocated,
        }
    }
}

/// `--output` as a [`Destination`], defaulting to `./results/`.
pub fn destination(output: Option<&Path>) -> Result<Destination> {
    let path = output.unwrap_or_else(|| Path::new(DEFAULT_OUTPUT_DIR));
    let absolute =
        std::path::absolute(path).with_context(|| format!("absolutize {}", path.display()))?;
    Ok(Destination::infer(absolute))
}

/// Absolute path of an existing workload file.
pub fn workload_path(workload: &Path) -> Result<PathBuf> {
    if !workload.is_file() {
        bail!("workload file not found: {}", workload.display());
    }
    std::path::absolute(workload).with_context(|| format!("absolutize {}", workload.display()))
}

/// Load topology metadata and check it against the workload's GPU count.
pub fn validated_metadata(workload: &Path, topology_dir: &Path) -> Result<TopologyMetadata> {
    let metadata = load_metadata(topology_dir)?;
    check_gpu_count(workload, &metadata)?;
    Ok(metadata)
}

/// Fail when the workload header's `all_gpus` disagrees with the topology.
pub fn check_gpu_count(workload: &Path, metadata: &TopologyMetadata) -> Result<()> {
    let text =
        fs::read_to_string(workload).with_context(|| format!("read {}", workload.display()))?;
    if let Some(workload_gpus) = parse_all_gpus(&text)
        && workload_gpus != metadata.num_gpus
    {
        bail!(
            "GPU count mismatch: workload has {workload_gpus} GPUs but topology has {} GPUs",
            metadata.num_gpus
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn metadata(num_gpus: usize) -> TopologyMetadata {
        TopologyMetadata {
            kind: "Spectrum-X".to_string(),
            num_gpus,
            gpus_per_server: 8,
            gpu_type: None,
            nic_bandwidth_gbps: None,
            nvlink_bandwidth_gbps: None,
            nics_per_switch: None,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn gpu_count_mismatch_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workload = temp.path().join("wl.txt");
        fs::write(&workload, "HYBRID_TRANSFORMER_FWD_IN_BCKWD all_gpus: 16\n1\n").expect("write");

        check_gpu_count(&workload, &metadata(16)).expect("matching counts");
        let err = check_gpu_count(&workload, &metadata(8)).unwrap_err();
        assert!(err.to_string().contains("workload has 16 GPUs but topology has 8"));
    }

    #[test]
    fn workload_without_header_is_accepted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let workload = temp.path().join("wl.txt");
        fs::write(&workload, "MICRO\n1\n").expect("write");
        check_gpu_count(&workload, &metadata(8)).expect("no header");
    }

    #[test]
    fn default_destination_is_results_dir() {
        let dest = destination(None).expect("destination");
        assert!(matches!(dest, Destination::Directory(ref p) if p.ends_with(DEFAULT_OUTPUT_DIR)));
        let dest = destination(Some(Path::new("out/summary.csv"))).expect("destination");
        assert!(matches!(dest, Destination::File(_)));
    }
}
