//! Orchestrator configuration stored in `simai.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

pub const CONFIG_ENV_VAR: &str = "SIMAI_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "simai.toml";

/// Orchestrator configuration (TOML).
///
/// Every field is optional in the file; missing fields take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimaiConfig {
    /// Interpreter used to drive the vendored Python generators.
    pub python: String,

    /// Parent directory for sandbox working directories (system temp dir if unset).
    pub sandbox_root: Option<PathBuf>,

    /// Keep at most this many bytes of child stdout/stderr in memory.
    pub output_limit_bytes: usize,

    /// Kill an external run after this many seconds. Unset waits forever.
    pub timeout_secs: Option<u64>,

    /// Optional generator dependencies replaced by placeholders when missing.
    pub stub_modules: Vec<String>,

    /// Extra variables forwarded verbatim into every sandbox environment.
    pub env: BTreeMap<String, String>,
}

impl Default for SimaiConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            sandbox_root: None,
            output_limit_bytes: 1_000_000,
            timeout_secs: None,
            stub_modules: ["torch", "apex", "scaled_upper_triang_masked_softmax_cuda", "deep_gemm"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            env: BTreeMap::new(),
        }
    }
}

impl SimaiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.python.trim().is_empty() {
            return Err(anyhow!("python must be a non-empty command"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.timeout_secs == Some(0) {
            return Err(anyhow!("timeout_secs must be > 0 when set"));
        }
        if let Some(name) = self.stub_modules.iter().find(|name| !is_module_name(name)) {
            return Err(anyhow!("stub_modules entry `{name}` is not a module name"));
        }
        if let Some(key) = self.env.keys().find(|key| key.is_empty() || key.contains('=')) {
            return Err(anyhow!("env key `{key}` is not a valid variable name"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('.')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

/// Pick the config file: `--config`, then `$SIMAI_CONFIG`, then `./simai.toml`.
pub fn resolve_config_path(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) if !value.is_empty() => PathBuf::from(value),
        _ => PathBuf::from(DEFAULT_CONFIG_FILE),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SimaiConfig::default()`.
pub fn load_config(path: &Path) -> Result<SimaiConfig> {
    if !path.exists() {
        let cfg = SimaiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SimaiConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SimaiConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SimaiConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("simai.toml");
        let mut cfg = SimaiConfig {
            timeout_secs: Some(3600),
            sandbox_root: Some(PathBuf::from("/scratch/simai")),
            ..SimaiConfig::default()
        };
        cfg.env.insert("AS_SEND_LAT".to_string(), "3".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("simai.toml");
        fs::write(&path, "python = \"/opt/py/bin/python\"\n[env]\nAS_NVLS_ENABLE = \"1\"\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.python, "/opt/py/bin/python");
        assert_eq!(cfg.output_limit_bytes, SimaiConfig::default().output_limit_bytes);
        assert_eq!(cfg.env.get("AS_NVLS_ENABLE").map(String::as_str), Some("1"));
    }

    #[test]
    fn rejects_zero_timeout_and_bad_module_names() {
        let cfg = SimaiConfig {
            timeout_secs: Some(0),
            ..SimaiConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SimaiConfig {
            stub_modules: vec!["torch.cuda".to_string(), "bad-name".to_string()],
            ..SimaiConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("bad-name"));
    }
}
