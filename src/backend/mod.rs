//! Execution backends.
//!
//! A backend stages a patch (debugger script, rewritten binary, or rebuilt
//! source tree) and hands back a [`PatchedProgram`] that runs tests against it.
//! Dropping the program releases whatever staging changed.
pub mod debugger;
pub mod recompile;
pub mod rewrite;

use crate::config::{Config, PatchMode};
use crate::exec::{run_command, script_command, CancelToken, ProcessOutput};
use crate::gdb::write_wrapper;
use crate::patch::Patch;
use crate::paths::OutputPaths;
use crate::rank::coverage;
use crate::util::{ensure_dir, path_safe};
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub test_id: String,
    pub passed: bool,
    /// Verdict taken from the signature cache without running the oracle.
    pub cached: bool,
    pub timed_out: bool,
}

/// Per-test outcomes of one patch, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub outcomes: Vec<TestOutcome>,
    pub executed: usize,
    pub cached: usize,
}

impl ValidationResult {
    pub fn push(&mut self, outcome: TestOutcome) {
        if outcome.cached {
            self.cached += 1;
        } else {
            self.executed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn all_passed(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.passed)
    }

    pub fn any_timed_out(&self) -> bool {
        self.outcomes.iter().any(|outcome| outcome.timed_out)
    }
}

/// Program handle passed to tier scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub env: Vec<(String, String)>,
}

pub trait PatchedProgram {
    fn run_test(&mut self, test_id: &str) -> Result<TestOutcome>;

    fn candidate(&self) -> Candidate;

    /// Write `addr:count` coverage for one test to `out`; `false` if unsupported.
    fn coverage(&mut self, _test_id: &str, _out: &Path) -> Result<bool> {
        Ok(false)
    }

    /// Write source-location traces of the patched and unpatched runs of one
    /// test; `false` if unsupported.
    fn trace(&mut self, _test_id: &str, _patched: &Path, _original: &Path) -> Result<bool> {
        Ok(false)
    }
}

pub enum Staged<'s> {
    ApplyFailed(String),
    BuildFailed(String),
    Ready(Box<dyn PatchedProgram + 's>),
}

/// How far staging got, without the program handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "stage", content = "reason")]
pub enum StageOutcome {
    ApplyFailed(String),
    BuildFailed(String),
    Ready,
}

/// Result of [`Validator::validate`]: staging outcome, per-test results, and
/// the still-staged program for later gates.
pub struct Validation<'s> {
    pub stage: StageOutcome,
    pub result: ValidationResult,
    pub program: Option<Box<dyn PatchedProgram + 's>>,
}

pub trait Validator: Send + Sync {
    fn mode(&self) -> PatchMode;

    fn stage<'s>(&'s self, patch: &'s Patch, cancel: &'s CancelToken) -> Result<Staged<'s>>;

    /// Stage `patch` and run `test_ids` in order, stopping at the first failure.
    fn validate<'s>(
        &'s self,
        patch: &'s Patch,
        test_ids: &[String],
        cancel: &'s CancelToken,
    ) -> Result<Validation<'s>> {
        Validation::run(self.stage(patch, cancel)?, test_ids, cancel)
    }
}

impl<'s> Validation<'s> {
    /// Run `test_ids` against a staged patch in order, stopping at the first
    /// failure.
    pub fn run(staged: Staged<'s>, test_ids: &[String], cancel: &CancelToken) -> Result<Self> {
        let mut program = match staged {
            Staged::ApplyFailed(reason) => return Ok(Self::unstaged(StageOutcome::ApplyFailed(reason))),
            Staged::BuildFailed(reason) => return Ok(Self::unstaged(StageOutcome::BuildFailed(reason))),
            Staged::Ready(program) => program,
        };
        let mut result = ValidationResult::default();
        for test_id in test_ids {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = program.run_test(test_id)?;
            let passed = outcome.passed;
            result.push(outcome);
            if !passed {
                break;
            }
        }
        Ok(Self {
            stage: StageOutcome::Ready,
            result,
            program: Some(program),
        })
    }

    fn unstaged(stage: StageOutcome) -> Self {
        Self {
            stage,
            result: ValidationResult::default(),
            program: None,
        }
    }
}

/// Shared state every backend reads.
#[derive(Debug)]
pub struct RunEnv {
    pub config: Config,
    pub paths: OutputPaths,
    instrumented: OnceLock<Option<PathBuf>>,
}

impl RunEnv {
    pub fn new(config: Config) -> Self {
        let paths = OutputPaths::new(config.output_dir.clone(), config.tag.clone());
        Self {
            config,
            paths,
            instrumented: OnceLock::new(),
        }
    }

    /// Coverage-instrumented copy of the configured binary, built on first use.
    pub fn instrumented_binary(&self) -> Option<&Path> {
        self.instrumented
            .get_or_init(|| {
                let binary = self.config.binary.as_ref()?;
                let out = self.paths.instrumented_dir().join("original");
                coverage::instrument_or_warn(binary, &out, self.config.task_timeout)
            })
            .as_deref()
    }
}

/// Run the configured oracle (or suite) for one test.
///
/// With an oracle the call is `<oracle> <test-id> [<program>]`; with a suite it
/// is `<suite> <test-id>`. Runs in the source directory when one is configured.
pub fn run_oracle(
    env: &RunEnv,
    test_id: &str,
    program: Option<&Path>,
    extra_env: &[(String, String)],
    cancel: &CancelToken,
) -> Result<ProcessOutput> {
    let config = &env.config;
    let mut cmd = match (&config.test_oracle, &config.test_suite) {
        (Some(oracle), _) => {
            let mut cmd = script_command(oracle);
            cmd.arg(test_id);
            if let Some(program) = program {
                cmd.arg(program);
            }
            cmd
        }
        (None, Some(suite)) => {
            let mut cmd = script_command(suite);
            cmd.arg(test_id).env("COVERAGE", "0");
            cmd
        }
        (None, None) => return Err(anyhow!("no test oracle or test suite configured")),
    };
    if let Some(dir) = &config.source_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    run_command(&mut cmd, Some(config.test_timeout), cancel)
}

/// Run one test against `program` under `afl-showmap`, writing the map to `out`.
pub fn binary_coverage(
    env: &RunEnv,
    patch_id: &str,
    test_id: &str,
    inner_command: &str,
    out: &Path,
    cancel: &CancelToken,
) -> Result<bool> {
    let scripts = env.paths.scripts_dir();
    ensure_dir(&scripts)?;
    let wrapper = scripts.join(format!(
        "{}-{}.coverage.sh",
        path_safe(patch_id),
        path_safe(test_id)
    ));
    write_wrapper(&wrapper, &coverage::showmap_command_line(out, inner_command))?;
    remove_stale(out);
    let extra = [("PATCH_ID".to_string(), patch_id.to_string())];
    run_oracle(env, test_id, Some(&wrapper), &extra, cancel)?;
    Ok(out.is_file())
}

/// Run one suite test with `COVERAGE=1`; the suite writes the map to
/// `$VALKYRIE_COVERAGE_FILE`.
pub fn suite_coverage(
    env: &RunEnv,
    test_id: &str,
    mut extra_env: Vec<(String, String)>,
    out: &Path,
    cancel: &CancelToken,
) -> Result<bool> {
    remove_stale(out);
    extra_env.push(("COVERAGE".to_string(), "1".to_string()));
    extra_env.push((
        "VALKYRIE_COVERAGE_FILE".to_string(),
        out.display().to_string(),
    ));
    run_oracle(env, test_id, None, &extra_env, cancel)?;
    Ok(out.is_file())
}

pub(crate) fn remove_stale(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "remove stale artifact");
        }
    }
}

/// Append a failing run's output to `errors/p<patch>.err`.
pub fn record_failure(paths: &OutputPaths, patch_id: &str, context: &str, output: &ProcessOutput) {
    let path = paths.error_log_path(patch_id);
    if let Some(parent) = path.parent() {
        if let Err(err) = std::fs::create_dir_all(parent) {
            tracing::warn!(error = %err, "create errors dir");
            return;
        }
    }
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| {
            writeln!(
                file,
                "== {context} (exit {:?}, timed_out {}) ==",
                output.exit_code, output.timed_out
            )?;
            file.write_all(&output.stdout)?;
            file.write_all(&output.stderr)?;
            Ok(())
        });
    if let Err(err) = written {
        tracing::warn!(path = %path.display(), error = %err, "write error log");
    }
}

/// Backend selection for the whole run.
pub struct Backends {
    primary: Box<dyn Validator>,
    recompile: Option<Box<dyn Validator>>,
}

impl Backends {
    /// Build the backend for the configured mode plus a recompilation
    /// fallback when a source tree is available.
    pub fn from_env(env: Arc<RunEnv>) -> Self {
        let recompile: Option<Box<dyn Validator>> = env
            .config
            .can_recompile()
            .then(|| Box::new(recompile::RecompileBackend::new(env.clone())) as Box<dyn Validator>);
        match env.config.patch_mode {
            PatchMode::Compile => Self {
                primary: Box::new(recompile::RecompileBackend::new(env.clone())),
                recompile: None,
            },
            PatchMode::Gdb => Self {
                primary: Box::new(debugger::DebuggerBackend::new(env.clone())),
                recompile,
            },
            PatchMode::Rewrite => Self {
                primary: Box::new(rewrite::RewriteBackend::new(env.clone())),
                recompile,
            },
        }
    }

    #[cfg(test)]
    pub fn with(primary: Box<dyn Validator>, recompile: Option<Box<dyn Validator>>) -> Self {
        Self { primary, recompile }
    }

    pub fn can_recompile(&self) -> bool {
        self.primary.mode() == PatchMode::Compile || self.recompile.is_some()
    }

    /// Pick the backend for one patch.
    ///
    /// Patches that need a real build always go to recompilation; patches the
    /// rewriter cannot express go there when it is available.
    pub fn route(&self, patch: &Patch) -> Result<&dyn Validator> {
        let primary = self.primary.as_ref();
        let needs_build = patch.requires_recompilation
            || (primary.mode() == PatchMode::Rewrite && rewrite::rewrite_plan(patch).is_none());
        if !needs_build || primary.mode() == PatchMode::Compile {
            return Ok(primary);
        }
        match &self.recompile {
            Some(backend) => Ok(backend.as_ref()),
            None if patch.requires_recompilation => Err(anyhow!(
                "patch {} requires recompilation but no source_dir is configured",
                patch.id
            )),
            None => Ok(primary),
        }
    }
}
