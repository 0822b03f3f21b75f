//! Filesystem probing for [`Resource`] candidates.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};

use crate::core::resources::{self, EnvSource, Layout, Resource, ResourceKind};
use crate::error::{Error, Result};

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var_os(&self, key: &str) -> Option<OsString> {
        std::env::var_os(key)
    }
}

impl Layout {
    /// Layout of the running installation.
    ///
    /// The package root is the executable's directory. The source root is the
    /// workspace this binary was built from, when that checkout still exists.
    pub fn detect() -> Self {
        let package_root = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf));
        let source_root = Path::new(env!("CARGO_MANIFEST_DIR"))
            .parent()
            .filter(|root| root.join("Cargo.toml").is_file())
            .map(Path::to_path_buf);
        let cache_root = dirs::cache_dir().map(|dir| dir.join("simai"));
        Self {
            package_root,
            source_root,
            cache_root,
        }
    }
}

/// Resolves resources against one layout and one environment.
#[derive(Debug, Clone)]
pub struct Resolver<E = ProcessEnv> {
    layout: Layout,
    env: E,
}

impl Resolver<ProcessEnv> {
    pub fn from_process() -> Self {
        Self::new(Layout::detect(), ProcessEnv)
    }
}

impl<E: EnvSource> Resolver<E> {
    pub fn new(layout: Layout, env: E) -> Self {
        Self { layout, env }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn env(&self) -> &E {
        &self.env
    }

    /// First existing candidate, as an absolute path.
    ///
    /// Read-only: probes the filesystem and reads the environment.
    #[instrument(skip_all, fields(kind = %resource.kind, name = %resource.name))]
    pub fn resolve(&self, resource: &Resource) -> Result<PathBuf> {
        let candidates = resource.candidates(&self.layout, &self.env);
        for candidate in &candidates {
            let hit = probe(resource.kind, &candidate.path, resource.marker.as_deref());
            trace!(tier = %candidate.tier, path = %candidate.path.display(), hit, "probe");
            if hit {
                let path = std::path::absolute(&candidate.path).map_err(|e| {
                    Error::io(format!("absolutize {}", candidate.path.display()), e)
                })?;
                debug!(tier = %candidate.tier, path = %path.display(), "resolved");
                return Ok(path);
            }
        }
        Err(Error::ResourceNotFound {
            kind: resource.kind,
            name: resource.name.clone(),
            candidates,
        })
    }

    pub fn resolve_binary(&self, name: &str) -> Result<PathBuf> {
        self.resolve(&resources::binary(name))
    }

    /// Resolve an arbitrary `(kind, name)` pair, as `simai resolve` does.
    pub fn resolve_named(&self, kind: ResourceKind, name: &str) -> Result<PathBuf> {
        if name.trim().is_empty() {
            return Err(Error::malformed("resource name", name, "must not be empty"));
        }
        self.resolve(&resources::lookup(kind, name))
    }
}

fn probe(kind: ResourceKind, path: &Path, marker: Option<&Path>) -> bool {
    match kind {
        ResourceKind::Binary => is_executable(path),
        ResourceKind::DataDir => path.is_dir() && marker.is_none_or(|m| path.join(m).is_file()),
        ResourceKind::ConfigFile => path.is_file(),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
