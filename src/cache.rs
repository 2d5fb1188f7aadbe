//! On-disk signature cache shared by concurrent workers.
//!
//! Layout under the partitions directory:
//!
//! ```text
//! <partition>/<test>/LOOP                  caching disabled for the pair
//! <partition>/<test>/<signature>/PASS      cached verdict, content = after digest
//! <partition>/<test>/<signature>/FAIL
//! ```
//!
//! Markers are only ever created with exclusive-create semantics and never
//! rewritten, so the first writer wins and later writers observe its verdict.
use crate::partition::PartitionId;
use crate::util::{ensure_dir, path_safe};
use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOOP_MARKER: &str = "LOOP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_passed(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn passed(self) -> bool {
        matches!(self, Self::Pass)
    }

    pub fn marker(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
        }
    }

    fn opposite(self) -> Self {
        match self {
            Self::Pass => Self::Fail,
            Self::Fail => Self::Pass,
        }
    }
}

/// Result of trying to record a verdict for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller created the marker.
    Claimed,
    /// A marker already existed; its verdict is returned.
    Observed(Verdict),
    /// Both verdicts were recorded by racing writers.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct SignatureCache {
    root: PathBuf,
}

impl SignatureCache {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Directory for one (partition, test) pair.
    pub fn pair_dir(&self, partition: &PartitionId, test_id: &str) -> PathBuf {
        self.root.join(partition.as_str()).join(path_safe(test_id))
    }

    fn signature_dir(&self, partition: &PartitionId, test_id: &str, signature: &str) -> PathBuf {
        self.pair_dir(partition, test_id).join(path_safe(signature))
    }

    pub fn is_loop(&self, partition: &PartitionId, test_id: &str) -> bool {
        self.pair_dir(partition, test_id).join(LOOP_MARKER).is_file()
    }

    /// Disable caching for the pair. Idempotent.
    pub fn mark_loop(&self, partition: &PartitionId, test_id: &str, reason: &str) -> Result<()> {
        let dir = self.pair_dir(partition, test_id);
        ensure_dir(&dir)?;
        let created = create_marker(&dir.join(LOOP_MARKER), reason)?;
        if created {
            tracing::warn!(
                partition = %partition,
                test = test_id,
                reason,
                "signature cache disabled for pair"
            );
        }
        Ok(())
    }

    /// Cached verdict for a signature, if one was recorded.
    pub fn lookup(&self, partition: &PartitionId, test_id: &str, signature: &str) -> Option<Verdict> {
        let dir = self.signature_dir(partition, test_id, signature);
        let pass = dir.join(Verdict::Pass.marker()).is_file();
        let fail = dir.join(Verdict::Fail.marker()).is_file();
        match (pass, fail) {
            (true, false) => Some(Verdict::Pass),
            (false, true) => Some(Verdict::Fail),
            _ => None,
        }
    }

    /// Record `verdict` for a signature unless another writer got there first.
    pub fn claim_or_observe(
        &self,
        partition: &PartitionId,
        test_id: &str,
        signature: &str,
        verdict: Verdict,
        after_digest: &str,
    ) -> Result<Claim> {
        let dir = self.signature_dir(partition, test_id, signature);
        ensure_dir(&dir)?;
        let opposite = dir.join(verdict.opposite().marker());
        if opposite.is_file() {
            return Ok(Claim::Observed(verdict.opposite()));
        }
        if !create_marker(&dir.join(verdict.marker()), after_digest)? {
            return Ok(Claim::Observed(verdict));
        }
        if opposite.is_file() {
            return Ok(Claim::Conflict);
        }
        tracing::debug!(
            partition = %partition,
            test = test_id,
            signature,
            verdict = verdict.marker(),
            "signature verdict recorded"
        );
        Ok(Claim::Claimed)
    }
}

/// Exclusive create; returns `false` when the marker already exists.
fn create_marker(path: &Path, contents: &str) -> Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(contents.as_bytes())
                .with_context(|| format!("write {}", path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::BreakPoint;

    fn partition() -> PartitionId {
        PartitionId::from_breakpoints([&BreakPoint::new("f.c", 10)])
    }

    #[test]
    fn first_writer_wins_and_second_observes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = SignatureCache::new(dir.path().to_path_buf());
        let pid = partition();

        assert_eq!(cache.lookup(&pid, "t1", "abc"), None);
        let first = cache
            .claim_or_observe(&pid, "t1", "abc", Verdict::Pass, "d1")
            .expect("claim");
        assert_eq!(first, Claim::Claimed);
        let second = cache
            .claim_or_observe(&pid, "t1", "abc", Verdict::Pass, "d2")
            .expect("claim");
        assert_eq!(second, Claim::Observed(Verdict::Pass));
        assert_eq!(cache.lookup(&pid, "t1", "abc"), Some(Verdict::Pass));
    }

    #[test]
    fn disagreeing_writer_observes_existing_verdict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = SignatureCache::new(dir.path().to_path_buf());
        let pid = partition();
        cache
            .claim_or_observe(&pid, "t1", "abc", Verdict::Fail, "d")
            .expect("claim");
        let observed = cache
            .claim_or_observe(&pid, "t1", "abc", Verdict::Pass, "d")
            .expect("claim");
        assert_eq!(observed, Claim::Observed(Verdict::Fail));
    }

    #[test]
    fn loop_marker_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = SignatureCache::new(dir.path().to_path_buf());
        let pid = partition();
        assert!(!cache.is_loop(&pid, "t/1"));
        cache.mark_loop(&pid, "t/1", "mismatch").expect("mark");
        cache.mark_loop(&pid, "t/1", "mismatch").expect("mark again");
        assert!(cache.is_loop(&pid, "t/1"));
        assert!(dir.path().join("f.c_10/t_1/LOOP").is_file());
    }

    #[test]
    fn concurrent_claims_agree_on_one_winner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = SignatureCache::new(dir.path().to_path_buf());
        let pid = partition();
        let claims: Vec<Claim> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        cache
                            .claim_or_observe(&pid, "t", "sig", Verdict::Pass, "d")
                            .expect("claim")
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("join"))
                .collect()
        });
        let winners = claims.iter().filter(|c| **c == Claim::Claimed).count();
        assert_eq!(winners, 1);
        assert!(claims
            .iter()
            .all(|c| matches!(c, Claim::Claimed | Claim::Observed(Verdict::Pass))));
    }
}
