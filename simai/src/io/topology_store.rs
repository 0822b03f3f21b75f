//! Topology directory load/save (`topology` + `metadata.json`) with schema validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::info;

use crate::core::topology::{Topology, TopologyMetadata};
use crate::core::units::Convention;
use crate::error::Error;

pub const TOPOLOGY_FILE: &str = "topology";
pub const METADATA_FILE: &str = "metadata.json";

const METADATA_SCHEMA: &str = include_str!("../../schemas/topology_metadata.schema.json");

/// Path of the topology file inside a topology directory.
pub fn topology_file(dir: &Path) -> Result<PathBuf> {
    let path = dir.join(TOPOLOGY_FILE);
    if !path.is_file() {
        bail!(
            "no `{TOPOLOGY_FILE}` file in topology directory {}",
            dir.display()
        );
    }
    Ok(path)
}

/// Read and validate `metadata.json`.
pub fn load_metadata(dir: &Path) -> Result<TopologyMetadata> {
    let path = dir.join(METADATA_FILE);
    if !path.is_file() {
        bail!(
            "no {METADATA_FILE} in topology directory {}; generate one with `simai generate topology`",
            dir.display()
        );
    }
    let raw = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    validate_metadata(&value).map_err(|err| match err.downcast::<Error>() {
        Ok(Error::MalformedValue {
            field,
            value,
            reason,
            ..
        }) => anyhow!(Error::MalformedValue {
            field,
            value,
            reason,
            file: Some(path.clone()),
            line: None,
        }),
        Ok(other) => anyhow!(other),
        Err(err) => err,
    })?;
    serde_json::from_value(value).with_context(|| format!("deserialize {}", path.display()))
}

/// Validate a metadata document against the bundled JSON Schema (Draft 2020-12).
pub fn validate_metadata(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(METADATA_SCHEMA).context("parse metadata schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile metadata schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(Error::malformed("metadata", "metadata.json", messages.join("; ")).into());
    }
    Ok(())
}

/// Parse the canonical topology out of a topology directory.
pub fn load_topology(dir: &Path) -> Result<Topology> {
    let path = topology_file(dir)?;
    let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(Topology::parse(&text, Some(&path))?)
}

/// Write `metadata.json` (pretty, trailing newline).
pub fn write_metadata(dir: &Path, metadata: &TopologyMetadata) -> Result<PathBuf> {
    let value = serde_json::to_value(metadata).context("serialize metadata")?;
    validate_metadata(&value)?;
    let mut buf = serde_json::to_string_pretty(&value)?;
    buf.push('\n');
    let path = dir.join(METADATA_FILE);
    fs::write(&path, buf).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Rewrite a topology file into a backend dialect.
///
/// Accepts bare or suffixed input; `dst` may equal `src`.
pub fn convert_topology_file(src: &Path, dst: &Path, convention: Convention) -> Result<()> {
    let text = fs::read_to_string(src).with_context(|| format!("read {}", src.display()))?;
    let topology = Topology::parse(&text, Some(src))?;
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(dst, topology.render(convention))
        .with_context(|| format!("write {}", dst.display()))?;
    info!(src = %src.display(), dst = %dst.display(), ?convention, "topology converted");
    Ok(())
}
