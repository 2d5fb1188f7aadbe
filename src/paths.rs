//! Typed paths into the run output layout.
//!
//! Every artifact a run writes lives below the configured output directory so
//! partitions and snapshots can be reused by later runs over the same patches.
use crate::util::path_safe;
use std::path::{Path, PathBuf};

/// Convenience wrapper for locating run artifacts.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    root: PathBuf,
    tag: Option<String>,
}

impl OutputPaths {
    pub fn new(root: PathBuf, tag: Option<String>) -> Self {
        Self { root, tag }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Return the `result.json` path.
    pub fn result_path(&self) -> PathBuf {
        self.root.join("result.json")
    }

    /// Return the `patch-score` path.
    pub fn score_path(&self) -> PathBuf {
        self.root.join("patch-score")
    }

    /// Return the `run-summary.json` path.
    pub fn summary_path(&self) -> PathBuf {
        self.root.join("run-summary.json")
    }

    pub fn class_dir(&self, dir_name: &str) -> PathBuf {
        self.root.join(dir_name)
    }

    pub fn partitions_dir(&self) -> PathBuf {
        self.root.join("partitions")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Per-patch snapshot directory (`snapshots/<patch_id>/`).
    pub fn patch_snapshot_dir(&self, patch_id: &str) -> PathBuf {
        self.snapshots_dir().join(path_safe(patch_id))
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.root.join("errors")
    }

    pub fn error_log_path(&self, patch_id: &str) -> PathBuf {
        self.errors_dir().join(format!("p{}.err", path_safe(patch_id)))
    }

    pub fn coverage_dir(&self) -> PathBuf {
        self.root.join("coverage")
    }

    pub fn traces_dir(&self) -> PathBuf {
        self.root.join("traces")
    }

    /// Statically rewritten binaries, one per patch.
    pub fn rewritten_dir(&self) -> PathBuf {
        self.root.join("rewritten")
    }

    /// Instrumented copies of program binaries used for coverage.
    pub fn instrumented_dir(&self) -> PathBuf {
        self.root.join("instrumented")
    }

    /// Script directory, namespaced by tag when several runs share a host.
    pub fn scripts_dir(&self) -> PathBuf {
        match &self.tag {
            Some(tag) => self.root.join("scripts").join(path_safe(tag)),
            None => self.root.join("scripts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_dir_is_namespaced_by_tag() {
        let plain = OutputPaths::new(PathBuf::from("/out"), None);
        let tagged = OutputPaths::new(PathBuf::from("/out"), Some("run-7".to_string()));
        assert_eq!(plain.scripts_dir(), PathBuf::from("/out/scripts"));
        assert_eq!(tagged.scripts_dir(), PathBuf::from("/out/scripts/run-7"));
    }

    #[test]
    fn patch_artifacts_use_path_safe_ids() {
        let paths = OutputPaths::new(PathBuf::from("/out"), None);
        assert_eq!(
            paths.patch_snapshot_dir("llm:1.patch"),
            PathBuf::from("/out/snapshots/llm_1.patch")
        );
        assert_eq!(
            paths.error_log_path("llm:1.patch"),
            PathBuf::from("/out/errors/pllm_1.patch.err")
        );
    }
}
