//! Debugger-emulation backend.
//!
//! The patch never touches the binary: each test runs the original program
//! under a debugger script that performs the inserted statements at their
//! breakpoints. With partitioning enabled, runs are first fingerprinted by
//! their snapshot signature and answered from the cache when possible.
use super::{
    binary_coverage, record_failure, remove_stale, run_oracle, suite_coverage, Candidate,
    PatchedProgram, RunEnv, Staged, TestOutcome, Validator,
};
use crate::cache::{Claim, SignatureCache, Verdict};
use crate::config::PatchMode;
use crate::exec::{CancelToken, ProcessOutput};
use crate::gdb::{
    compile_patch, debugger_command_line, has_symbol_errors, render_script, render_trace_script,
    script_paths, write_frontend, SnapshotHooks,
};
use crate::interpreter::CompiledFragment;
use crate::partition::PartitionId;
use crate::patch::Patch;
use crate::snapshot;
use crate::util::{ensure_dir, path_safe};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct DebuggerBackend {
    env: Arc<RunEnv>,
    cache: Option<SignatureCache>,
}

impl DebuggerBackend {
    pub fn new(env: Arc<RunEnv>) -> Self {
        let cache = env
            .config
            .partition
            .then(|| SignatureCache::new(env.paths.partitions_dir()));
        Self { env, cache }
    }
}

impl Validator for DebuggerBackend {
    fn mode(&self) -> PatchMode {
        PatchMode::Gdb
    }

    fn stage<'s>(&'s self, patch: &'s Patch, cancel: &'s CancelToken) -> Result<Staged<'s>> {
        if patch.requires_recompilation {
            bail!(
                "patch {} requires recompilation and cannot run under the debugger",
                patch.id
            );
        }
        if patch.fragments.is_empty() {
            return Ok(Staged::ApplyFailed("patch has no fragments".to_string()));
        }
        let fragments = compile_patch(patch);
        let scripts = ScriptSet::write(
            &self.env,
            &path_safe(&patch.id),
            &render_script(&fragments, SnapshotHooks::None),
        )?;
        tracing::debug!(patch = %patch.id, script = %scripts.script.display(), "debugger script written");
        Ok(Staged::Ready(Box::new(DebuggerProgram {
            backend: self,
            patch,
            fragments,
            scripts,
            cancel,
        })))
    }
}

/// A written script plus its binary frontend (absent in test-suite mode).
struct ScriptSet {
    script: PathBuf,
    frontend: Option<PathBuf>,
}

impl ScriptSet {
    fn write(env: &RunEnv, stem: &str, text: &str) -> Result<Self> {
        let dir = env.paths.scripts_dir();
        ensure_dir(&dir)?;
        let (script, frontend) = script_paths(&dir, stem);
        fs::write(&script, text).with_context(|| format!("write {}", script.display()))?;
        let frontend = match &env.config.binary {
            Some(binary) => {
                write_frontend(&frontend, &script, binary)?;
                Some(frontend)
            }
            None => None,
        };
        Ok(Self { script, frontend })
    }
}

struct DebuggerProgram<'s> {
    backend: &'s DebuggerBackend,
    patch: &'s Patch,
    fragments: Vec<CompiledFragment>,
    scripts: ScriptSet,
    cancel: &'s CancelToken,
}

impl DebuggerProgram<'_> {
    fn env(&self) -> &RunEnv {
        &self.backend.env
    }

    fn stem(&self) -> String {
        path_safe(&self.patch.id)
    }

    fn suite_env(&self, scripts: &ScriptSet) -> Vec<(String, String)> {
        vec![
            ("PATCH_ID".to_string(), self.patch.id.clone()),
            (
                "VALKYRIE_GDB_SCRIPT".to_string(),
                scripts.script.display().to_string(),
            ),
        ]
    }

    fn invoke(&self, test_id: &str, scripts: &ScriptSet) -> Result<ProcessOutput> {
        match &scripts.frontend {
            Some(frontend) => {
                let extra = [("PATCH_ID".to_string(), self.patch.id.clone())];
                run_oracle(self.env(), test_id, Some(frontend), &extra, self.cancel)
            }
            None => run_oracle(
                self.env(),
                test_id,
                None,
                &self.suite_env(scripts),
                self.cancel,
            ),
        }
    }

    fn finish(&self, test_id: &str, output: &ProcessOutput) -> TestOutcome {
        let passed = output.success() && !has_symbol_errors(&output.combined_text());
        if !passed {
            record_failure(&self.env().paths, &self.patch.id, &format!("test {test_id}"), output);
        }
        TestOutcome {
            test_id: test_id.to_string(),
            passed,
            cached: false,
            timed_out: output.timed_out,
        }
    }

    fn write_variant(&self, stem: &str, hooks: SnapshotHooks<'_>) -> Result<ScriptSet> {
        ScriptSet::write(self.env(), stem, &render_script(&self.fragments, hooks))
    }

    fn run_plain(&self, test_id: &str) -> Result<TestOutcome> {
        let output = self.invoke(test_id, &self.scripts)?;
        Ok(self.finish(test_id, &output))
    }

    fn run_cached(
        &self,
        cache: &SignatureCache,
        partition: &PartitionId,
        test_id: &str,
    ) -> Result<TestOutcome> {
        if cache.is_loop(partition, test_id) {
            return self.run_plain(test_id);
        }
        let snapshots = self.env().paths.patch_snapshot_dir(&self.patch.id);
        ensure_dir(&snapshots)?;
        let test = path_safe(test_id);
        let before = snapshots.join(format!("{test}_before.core"));
        let after = snapshots.join(format!("{test}_after.core"));
        let location = snapshots.join(format!("{test}_location.core"));
        for path in [&before, &after, &location] {
            remove_stale(path);
        }

        let signature_run = self.write_variant(
            &format!("{}-{test}-signature", self.stem()),
            SnapshotHooks::Signature {
                before: &before,
                after: &after,
            },
        )?;
        self.invoke(test_id, &signature_run)?;
        let Some(signature) = snapshot::signature(&before, &after)? else {
            tracing::debug!(patch = %self.patch.id, test = test_id, "no snapshot signature, running uncached");
            return self.run_plain(test_id);
        };
        if let Some(verdict) = cache.lookup(partition, test_id, &signature) {
            tracing::debug!(
                patch = %self.patch.id,
                test = test_id,
                signature = %signature,
                passed = verdict.passed(),
                "signature cache hit"
            );
            return Ok(TestOutcome {
                test_id: test_id.to_string(),
                passed: verdict.passed(),
                cached: true,
                timed_out: false,
            });
        }

        let location_run = self.write_variant(
            &format!("{}-{test}-location", self.stem()),
            SnapshotHooks::Location { dump: &location },
        )?;
        let output = self.invoke(test_id, &location_run)?;
        let outcome = self.finish(test_id, &output);
        if output.timed_out || output.cancelled {
            return Ok(outcome);
        }
        if snapshot::same_state(&after, &location)? {
            let digest = snapshot::file_digest(&after)?;
            let verdict = Verdict::from_passed(outcome.passed);
            match cache.claim_or_observe(partition, test_id, &signature, verdict, &digest)? {
                Claim::Claimed => {}
                Claim::Observed(observed) if observed == verdict => {}
                Claim::Observed(_) => {
                    cache.mark_loop(partition, test_id, "recorded verdict disagrees")?
                }
                Claim::Conflict => {
                    cache.mark_loop(partition, test_id, "conflicting verdicts recorded")?
                }
            }
        } else {
            cache.mark_loop(
                partition,
                test_id,
                "continuation state differs from signature run",
            )?;
        }
        Ok(outcome)
    }
}

impl PatchedProgram for DebuggerProgram<'_> {
    fn run_test(&mut self, test_id: &str) -> Result<TestOutcome> {
        let backend = self.backend;
        let patch = self.patch;
        match (&backend.cache, &patch.partition) {
            (Some(cache), Some(partition)) => self.run_cached(cache, partition, test_id),
            _ => self.run_plain(test_id),
        }
    }

    fn candidate(&self) -> Candidate {
        match &self.scripts.frontend {
            Some(frontend) => Candidate {
                path: frontend.clone(),
                env: vec![("PATCH_ID".to_string(), self.patch.id.clone())],
            },
            None => Candidate {
                path: self.scripts.script.clone(),
                env: self.suite_env(&self.scripts),
            },
        }
    }

    fn coverage(&mut self, test_id: &str, out: &Path) -> Result<bool> {
        if self.scripts.frontend.is_none() {
            return suite_coverage(self.env(), test_id, self.suite_env(&self.scripts), out, self.cancel);
        }
        let Some(instrumented) = self.env().instrumented_binary() else {
            return Ok(false);
        };
        let inner = debugger_command_line(&self.scripts.script, instrumented);
        binary_coverage(self.env(), &self.patch.id, test_id, &inner, out, self.cancel)
    }

    fn trace(&mut self, test_id: &str, patched: &Path, original: &Path) -> Result<bool> {
        if self.scripts.frontend.is_none() {
            return Ok(false);
        }
        let test = path_safe(test_id);
        for (apply_patch, log, label) in [(true, patched, "patched"), (false, original, "original")] {
            remove_stale(log);
            let scripts = ScriptSet::write(
                self.env(),
                &format!("{}-{test}-trace-{label}", self.stem()),
                &render_trace_script(&self.fragments, apply_patch, log),
            )?;
            self.invoke(test_id, &scripts)?;
        }
        Ok(patched.is_file() && original.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StageOutcome;
    use crate::config::{Config, ConfigLayer};
    use crate::patch::{BreakPoint, Fragment};
    use std::collections::BTreeMap;

    /// Suite that materializes every core dump named in its debugger script.
    const DUMPING_SUITE: &str = "grep 'generate-core-file' \"$VALKYRIE_GDB_SCRIPT\" | \
while read -r _ dump; do echo state > \"$dump\"; done\nexit 0\n";

    /// Like `DUMPING_SUITE`, but the location run ends in a different state.
    const DIVERGING_SUITE: &str = "grep 'generate-core-file' \"$VALKYRIE_GDB_SCRIPT\" | \
while read -r _ dump; do case \"$dump\" in *_location.core) echo moved > \"$dump\";; \
*) echo state > \"$dump\";; esac; done\nexit 0\n";

    fn env(root: &Path, suite: &str, partition: bool) -> Arc<RunEnv> {
        fs::create_dir_all(root.join("patches")).expect("create patches");
        fs::write(root.join("suite.sh"), suite).expect("write suite");
        let layer = ConfigLayer {
            patch_dir: Some(root.join("patches")),
            test_suite: Some(root.join("suite.sh")),
            test_ids: Some(vec!["1".to_string()]),
            output_dir: Some(root.join("out")),
            partition: Some(partition),
            ..ConfigLayer::default()
        };
        Arc::new(RunEnv::new(Config::resolve(layer).expect("resolve config")))
    }

    fn patch(id: &str) -> Patch {
        let mut fragments = BTreeMap::new();
        fragments.insert(
            BreakPoint::new("f.c", 10),
            Fragment {
                inserted: vec!["x = 5".to_string()],
                ..Fragment::default()
            },
        );
        let mut patch = Patch {
            id: id.to_string(),
            tool: None,
            path: PathBuf::from(id),
            source_file: "f.c".to_string(),
            fragments,
            requires_recompilation: false,
            partition: None,
        };
        patch.partition = Some(PartitionId::from_breakpoints(patch.breakpoints()));
        patch
    }

    #[test]
    fn suite_mode_exports_script_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(
            dir.path(),
            "grep -q 'set var x=5' \"$VALKYRIE_GDB_SCRIPT\" && [ \"$PATCH_ID\" = a.patch ]\n",
            false,
        );
        let backend = DebuggerBackend::new(env);
        let target = patch("a.patch");
        let cancel = CancelToken::new();
        let validation = backend
            .validate(&target, &["1".to_string()], &cancel)
            .expect("validate");
        assert_eq!(validation.stage, StageOutcome::Ready);
        assert!(validation.result.all_passed());
        assert_eq!(validation.result.executed, 1);
    }

    #[test]
    fn symbol_errors_fail_the_test_and_are_logged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), "echo 'No symbol \"x\" in current context.'\nexit 0\n", false);
        let backend = DebuggerBackend::new(env.clone());
        let target = patch("a.patch");
        let cancel = CancelToken::new();
        let validation = backend
            .validate(&target, &["1".to_string()], &cancel)
            .expect("validate");
        assert!(!validation.result.all_passed());
        let log = fs::read_to_string(env.paths.error_log_path("a.patch")).expect("error log");
        assert!(log.contains("No symbol"));
    }

    #[test]
    fn identical_effects_are_answered_from_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), DUMPING_SUITE, true);
        let backend = DebuggerBackend::new(env);
        let cancel = CancelToken::new();
        let tests = vec!["1".to_string()];

        let first = patch("a.patch");
        let validation = backend.validate(&first, &tests, &cancel).expect("validate a");
        assert!(validation.result.all_passed());
        assert_eq!((validation.result.executed, validation.result.cached), (1, 0));
        drop(validation);

        let second = patch("b.patch");
        let validation = backend.validate(&second, &tests, &cancel).expect("validate b");
        assert!(validation.result.all_passed());
        assert_eq!((validation.result.executed, validation.result.cached), (0, 1));
    }

    #[test]
    fn diverging_location_state_disables_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), DIVERGING_SUITE, true);
        let backend = DebuggerBackend::new(env.clone());
        let cache = SignatureCache::new(env.paths.partitions_dir());
        let cancel = CancelToken::new();
        let tests = vec!["1".to_string()];

        let first = patch("a.patch");
        let partition = first.partition.clone().expect("partition");
        let validation = backend.validate(&first, &tests, &cancel).expect("validate a");
        assert!(validation.result.all_passed());
        assert_eq!((validation.result.executed, validation.result.cached), (1, 0));
        drop(validation);

        assert!(cache.is_loop(&partition, "1"));
        let pair = cache.pair_dir(&partition, "1");
        for entry in fs::read_dir(&pair).expect("pair dir").flatten() {
            let path = entry.path();
            if path.is_dir() {
                assert!(!path.join(Verdict::Pass.marker()).exists());
                assert!(!path.join(Verdict::Fail.marker()).exists());
            }
        }

        let second = patch("b.patch");
        let validation = backend.validate(&second, &tests, &cancel).expect("validate b");
        assert!(validation.result.all_passed());
        assert_eq!((validation.result.executed, validation.result.cached), (1, 0));
    }

    #[test]
    fn missing_snapshots_fall_back_to_plain_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = env(dir.path(), "exit 0\n", true);
        let backend = DebuggerBackend::new(env.clone());
        let cancel = CancelToken::new();
        let target = patch("a.patch");
        let validation = backend
            .validate(&target, &["1".to_string()], &cancel)
            .expect("validate");
        assert!(validation.result.all_passed());
        assert_eq!(validation.result.cached, 0);
        let pair = SignatureCache::new(env.paths.partitions_dir())
            .pair_dir(target.partition.as_ref().expect("partition"), "1");
        assert!(!pair.exists());
    }

    #[test]
    fn recompilation_patches_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = DebuggerBackend::new(env(dir.path(), "exit 0\n", false));
        let mut target = patch("a.patch");
        target.requires_recompilation = true;
        let cancel = CancelToken::new();
        assert!(backend.stage(&target, &cancel).is_err());
    }
}
