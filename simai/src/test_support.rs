//! Test-only helpers: fake executables and fake install layouts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::resources::{BIN_PATH_VAR, Layout};
use crate::io::resolver::Resolver;

/// Write a `/bin/sh` script at `path` (creating parents) and mark it executable.
pub fn write_executable(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create script dir");
    }
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod script");
    }
}

/// A throwaway install: `pkg/` (bundled), `src/` (dev checkout), `cache/`, `override/`.
pub struct FakeInstall {
    _temp: tempfile::TempDir,
    pub root: PathBuf,
}

impl FakeInstall {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        for dir in ["pkg", "src", "cache", "override", "work"] {
            fs::create_dir_all(root.join(dir)).expect("create layout dir");
        }
        Self { _temp: temp, root }
    }

    pub fn layout(&self) -> Layout {
        Layout {
            package_root: Some(self.root.join("pkg")),
            source_root: Some(self.root.join("src")),
            cache_root: Some(self.root.join("cache")),
        }
    }

    /// Scratch space for outputs and sandboxes.
    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    /// Resolver over this layout with only the given variables set.
    pub fn resolver(&self, vars: &[(&str, &str)]) -> Resolver<BTreeMap<String, String>> {
        let env = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Resolver::new(self.layout(), env)
    }

    /// Resolver with `SIMAI_BIN_PATH` pointing at `override/`.
    pub fn resolver_with_override(&self) -> Resolver<BTreeMap<String, String>> {
        let dir = self.root.join("override").display().to_string();
        self.resolver(&[(BIN_PATH_VAR, &dir)])
    }

    /// Fake simulator in the dev checkout's `build/bin/`.
    pub fn source_binary(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root.join("src/build/bin").join(name);
        write_executable(&path, body);
        path
    }

    /// Fake simulator in the bundled `_binaries/`.
    pub fn bundled_binary(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root.join("pkg/_binaries").join(name);
        write_executable(&path, body);
        path
    }
}

impl Default for FakeInstall {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of entries directly inside `dir` (0 when it does not exist).
pub fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}
