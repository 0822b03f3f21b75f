//! Reversible in-place patching of known vendored artifacts.
//!
//! A [`PatchRecord`] holds the original bytes; [`restore`] writes them back
//! verbatim and consumes the record. Nothing guards against a second patch of
//! the same file before its restore, or against edits made by other processes
//! in between: one patch per target at a time is the caller's job.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::core::patch_rules::Substitution;
use crate::error::{Error, MissingTarget, Result};

#[derive(Debug)]
#[must_use = "dropping a PatchRecord leaves the file patched; pass it to restore()"]
pub struct PatchRecord {
    path: PathBuf,
    original: Vec<u8>,
    rule: String,
}

impl PatchRecord {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rule(&self) -> &str {
        &self.rule
    }
}

/// Apply `rule` to the file at `path`, returning the backup needed to undo it.
pub fn patch(path: &Path, rule: &Substitution) -> Result<PatchRecord> {
    if !path.is_file() {
        return Err(Error::PatchTargetMissing {
            path: path.to_path_buf(),
            reason: MissingTarget::File,
        });
    }
    let original = fs::read(path).map_err(|e| Error::io(format!("read {}", path.display()), e))?;
    let patched = rule.apply(&original).ok_or_else(|| Error::PatchTargetMissing {
        path: path.to_path_buf(),
        reason: MissingTarget::Pattern(rule.expected()),
    })?;
    fs::write(path, patched).map_err(|e| Error::io(format!("write {}", path.display()), e))?;
    info!(path = %path.display(), rule = %rule.describe(), "patched");
    Ok(PatchRecord {
        path: path.to_path_buf(),
        original,
        rule: rule.describe(),
    })
}

/// Write the original bytes back.
pub fn restore(record: PatchRecord) -> Result<()> {
    fs::write(&record.path, &record.original)
        .map_err(|e| Error::io(format!("restore {}", record.path.display()), e))?;
    debug!(path = %record.path.display(), "restored");
    Ok(())
}

/// Restores its record when dropped, unless [`PatchGuard::finish`] already did.
///
/// Used around builds so a failing compile still leaves the source pristine.
#[derive(Debug)]
pub struct PatchGuard {
    record: Option<PatchRecord>,
}

impl PatchGuard {
    pub fn apply(path: &Path, rule: &Substitution) -> Result<Self> {
        Ok(Self {
            record: Some(patch(path, rule)?),
        })
    }

    /// Restore now and surface any error.
    pub fn finish(mut self) -> Result<()> {
        match self.record.take() {
            Some(record) => restore(record),
            None => Ok(()),
        }
    }
}

impl Drop for PatchGuard {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            let path = record.path.clone();
            if let Err(e) = restore(record) {
                warn!(path = %path.display(), err = %e, "failed to restore patched file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::patch_rules::{m4_flow_capacity, sandbox_config_paths};

    #[test]
    fn patch_then_restore_is_byte_identical() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("SimAI.conf");
        let original = b"ENABLE_QCN 1\r\nFCT_OUTPUT_FILE /etc/astra-sim/simulation/fct.txt\n\xff\n";
        fs::write(&path, original).expect("write");

        let record = patch(&path, &sandbox_config_paths()).expect("patch");
        assert_eq!(
            fs::read(&path).expect("read"),
            b"ENABLE_QCN 1\r\nFCT_OUTPUT_FILE ./fct.txt\n\xff\n"
        );
        restore(record).expect("restore");

        assert_eq!(fs::read(&path).expect("read"), original);
    }

    #[test]
    fn missing_file_and_missing_pattern_are_distinct() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("M4.cc");
        let err = patch(&path, &m4_flow_capacity(10)).unwrap_err();
        assert!(matches!(
            err,
            Error::PatchTargetMissing {
                reason: MissingTarget::File,
                ..
            }
        ));

        fs::write(&path, "int main() {}\n").expect("write");
        let err = patch(&path, &m4_flow_capacity(10)).unwrap_err();
        assert!(matches!(
            err,
            Error::PatchTargetMissing {
                reason: MissingTarget::Pattern(_),
                ..
            }
        ));
        assert_eq!(fs::read_to_string(&path).expect("read"), "int main() {}\n");
    }

    #[test]
    fn guard_restores_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("M4.cc");
        let original = "int32_t M4::n_flows_max = 50000;\n";
        fs::write(&path, original).expect("write");
        {
            let _guard = PatchGuard::apply(&path, &m4_flow_capacity(500_000)).expect("patch");
            assert_eq!(
                fs::read_to_string(&path).expect("read"),
                "int32_t M4::n_flows_max = 500000;\n"
            );
        }
        assert_eq!(fs::read_to_string(&path).expect("read"), original);
    }
}
