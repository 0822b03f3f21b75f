//! Resource descriptors and tiered candidate-path construction.
//!
//! A [`Resource`] names a logical artifact (a simulator binary, a vendored data
//! directory, a config file) together with one rule per resolution tier. Tiers
//! are always expanded in [`Tier`] order, so every resource kind shares the same
//! precedence and the same candidate reporting. Probing the candidates is the
//! job of [`crate::io::resolver`].

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Override for the directory holding simulator binaries.
pub const BIN_PATH_VAR: &str = "SIMAI_BIN_PATH";
/// Override for the root of a SimAI checkout (vendored data, configs, AICB).
pub const SIMAI_PATH_VAR: &str = "SIMAI_PATH";

pub const ANALYTICAL_BINARY: &str = "SimAI_analytical";
pub const NS3_BINARY: &str = "SimAI_simulator";
pub const M4_BINARY: &str = "SimAI_m4";

pub const ASTRA_SIM_DIR: &str = "astra-sim-alibabacloud";
pub const M4_MODELS_REL: &str = "astra-sim-alibabacloud/astra-sim/network_frontend/m4/models";
const SIMAI_CONF_REL: &str = "astra-sim-alibabacloud/inputs/config/SimAI.conf";
const TOPO_GENERATOR_REL: &str = "astra-sim-alibabacloud/inputs/topo/gen_Topo_Template.py";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Binary,
    DataDir,
    ConfigFile,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Binary => "binary",
            ResourceKind::DataDir => "data directory",
            ResourceKind::ConfigFile => "config file",
        };
        f.write_str(label)
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" | "bin" => Ok(ResourceKind::Binary),
            "data-dir" | "data" => Ok(ResourceKind::DataDir),
            "config-file" | "config" => Ok(ResourceKind::ConfigFile),
            other => Err(format!(
                "unknown resource kind `{other}` (expected binary, data-dir, or config-file)"
            )),
        }
    }
}

/// Resolution tiers in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Co-located with the running executable (`<pkg>/_binaries`, `<pkg>/_vendor`).
    Bundled,
    /// A named environment variable points at the artifact or its parent.
    EnvOverride,
    /// Relative to a development checkout (or a user cache of one).
    SourceTree,
    /// Entries of `PATH`; binaries only.
    SearchPath,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Tier::Bundled => "bundled",
            Tier::EnvOverride => "env-override",
            Tier::SourceTree => "source-tree",
            Tier::SearchPath => "search-path",
        };
        f.write_str(label)
    }
}

/// One probed (or to-be-probed) location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub tier: Tier,
    pub path: PathBuf,
}

/// Read-only view of the environment used to expand override tiers.
pub trait EnvSource {
    fn var_os(&self, key: &str) -> Option<OsString>;
}

impl EnvSource for BTreeMap<String, String> {
    fn var_os(&self, key: &str) -> Option<OsString> {
        self.get(key).map(OsString::from)
    }
}

/// Install layout roots that the bundled and source-tree tiers are relative to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    /// Directory holding the running executable.
    pub package_root: Option<PathBuf>,
    /// Root of a development checkout (contains `vendor/` and `build/`).
    pub source_root: Option<PathBuf>,
    /// Per-user cache root (`~/.cache/simai`).
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FallbackBase {
    Checkout,
    UserCache,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TierRule {
    Bundled(PathBuf),
    /// `rel` empty means the variable's value is used verbatim.
    EnvOverride {
        var: &'static str,
        rel: PathBuf,
    },
    Fallback {
        base: FallbackBase,
        rel: PathBuf,
    },
    SearchPath,
}

impl TierRule {
    fn tier(&self) -> Tier {
        match self {
            TierRule::Bundled(_) => Tier::Bundled,
            TierRule::EnvOverride { .. } => Tier::EnvOverride,
            TierRule::Fallback { .. } => Tier::SourceTree,
            TierRule::SearchPath => Tier::SearchPath,
        }
    }
}

/// A logical resource and its per-tier candidate rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub kind: ResourceKind,
    /// Relative path that must exist inside a directory candidate for it to count.
    pub marker: Option<PathBuf>,
    rules: Vec<TierRule>,
}

impl Resource {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            marker: None,
            rules: Vec::new(),
        }
    }

    pub fn bundled(mut self, rel: impl Into<PathBuf>) -> Self {
        self.rules.push(TierRule::Bundled(rel.into()));
        self
    }

    pub fn env_override(mut self, var: &'static str, rel: impl Into<PathBuf>) -> Self {
        self.rules.push(TierRule::EnvOverride {
            var,
            rel: rel.into(),
        });
        self
    }

    pub fn source_tree(mut self, rel: impl Into<PathBuf>) -> Self {
        self.rules.push(TierRule::Fallback {
            base: FallbackBase::Checkout,
            rel: rel.into(),
        });
        self
    }

    pub fn user_cache(mut self, rel: impl Into<PathBuf>) -> Self {
        self.rules.push(TierRule::Fallback {
            base: FallbackBase::UserCache,
            rel: rel.into(),
        });
        self
    }

    pub fn search_path(mut self) -> Self {
        self.rules.push(TierRule::SearchPath);
        self
    }

    pub fn with_marker(mut self, rel: impl Into<PathBuf>) -> Self {
        self.marker = Some(rel.into());
        self
    }

    /// Expand every rule into concrete candidate paths, in tier order.
    ///
    /// Rules whose base is unknown (no package root, unset variable) produce no
    /// candidate. Within a tier, rules keep their declaration order.
    pub fn candidates(&self, layout: &Layout, env: &dyn EnvSource) -> Vec<Candidate> {
        let mut rules: Vec<&TierRule> = self.rules.iter().collect();
        rules.sort_by_key(|rule| rule.tier());

        let mut out = Vec::new();
        for rule in rules {
            let tier = rule.tier();
            match rule {
                TierRule::Bundled(rel) => {
                    if let Some(root) = &layout.package_root {
                        out.push(Candidate {
                            tier,
                            path: root.join(rel),
                        });
                    }
                }
                TierRule::EnvOverride { var, rel } => {
                    if let Some(value) = env.var_os(var).filter(|v| !v.is_empty()) {
                        let base = PathBuf::from(value);
                        let path = if rel.as_os_str().is_empty() {
                            base
                        } else {
                            base.join(rel)
                        };
                        out.push(Candidate { tier, path });
                    }
                }
                TierRule::Fallback { base, rel } => {
                    let root = match base {
                        FallbackBase::Checkout => layout.source_root.as_deref(),
                        FallbackBase::UserCache => layout.cache_root.as_deref(),
                    };
                    if let Some(root) = root {
                        out.push(Candidate {
                            tier,
                            path: root.join(rel),
                        });
                    }
                }
                TierRule::SearchPath => {
                    if let Some(path_var) = env.var_os("PATH") {
                        out.extend(
                            std::env::split_paths(&path_var)
                                .filter(|dir| !dir.as_os_str().is_empty())
                                .map(|dir| Candidate {
                                    tier,
                                    path: dir.join(&self.name),
                                }),
                        );
                    }
                }
            }
        }
        out
    }
}

/// A simulator (or helper) executable.
pub fn binary(name: &str) -> Resource {
    Resource::new(name, ResourceKind::Binary)
        .bundled(Path::new("_binaries").join(name))
        .env_override(BIN_PATH_VAR, name)
        .source_tree(Path::new("build").join("bin").join(name))
        .search_path()
}

/// The `astra-sim-alibabacloud` data tree (ratio CSVs, default inputs).
pub fn astra_sim_root() -> Resource {
    Resource::new(ASTRA_SIM_DIR, ResourceKind::DataDir)
        .bundled(Path::new("_vendor").join(ASTRA_SIM_DIR))
        .env_override(SIMAI_PATH_VAR, ASTRA_SIM_DIR)
        .source_tree(Path::new("vendor/simai").join(ASTRA_SIM_DIR))
}

/// Default runtime config for the ns-3 backend.
pub fn simai_conf() -> Resource {
    Resource::new("SimAI.conf", ResourceKind::ConfigFile)
        .bundled("_vendor/SimAI.conf")
        .env_override(SIMAI_PATH_VAR, SIMAI_CONF_REL)
        .source_tree(Path::new("vendor/simai").join(SIMAI_CONF_REL))
}

/// Learned-model weights for the m4 backend.
pub fn m4_models() -> Resource {
    Resource::new("m4_models", ResourceKind::DataDir)
        .bundled("_vendor/m4_models")
        .env_override(SIMAI_PATH_VAR, M4_MODELS_REL)
        .source_tree(Path::new("vendor/simai-m4").join(M4_MODELS_REL))
}

/// The AICB workload-generator source tree.
pub fn aicb_root() -> Resource {
    Resource::new("aicb", ResourceKind::DataDir)
        .bundled("_vendor/aicb")
        .env_override(SIMAI_PATH_VAR, "aicb")
        .source_tree("vendor/simai/aicb")
}

/// The upstream topology generator script.
pub fn topology_generator() -> Resource {
    Resource::new("gen_Topo_Template.py", ResourceKind::ConfigFile)
        .bundled("_vendor/topo/gen_Topo_Template.py")
        .env_override(SIMAI_PATH_VAR, TOPO_GENERATOR_REL)
        .source_tree(Path::new("vendor/simai").join(TOPO_GENERATOR_REL))
}

/// The simai-m4 source checkout used by `simai install m4`.
pub fn m4_source() -> Resource {
    Resource::new("simai-m4", ResourceKind::DataDir)
        .source_tree("vendor/simai-m4")
        .user_cache("simai-m4")
        .with_marker("scripts/build.sh")
}

/// Look up a resource by kind and logical name.
///
/// Known names map to the catalogue above; any other name gets the generic
/// rules for its kind, so ad-hoc lookups behave like catalogued ones.
pub fn lookup(kind: ResourceKind, name: &str) -> Resource {
    match (kind, name) {
        (ResourceKind::Binary, _) => binary(name),
        (ResourceKind::DataDir, ASTRA_SIM_DIR) => astra_sim_root(),
        (ResourceKind::DataDir, "m4_models") => m4_models(),
        (ResourceKind::DataDir, "aicb") => aicb_root(),
        (ResourceKind::DataDir, "simai-m4") => m4_source(),
        (ResourceKind::ConfigFile, "SimAI.conf") => simai_conf(),
        (ResourceKind::ConfigFile, "gen_Topo_Template.py") => topology_generator(),
        (ResourceKind::DataDir | ResourceKind::ConfigFile, _) => Resource::new(name, kind)
            .bundled(Path::new("_vendor").join(name))
            .env_override(SIMAI_PATH_VAR, name)
            .source_tree(Path::new("vendor/simai").join(name)),
    }
}
