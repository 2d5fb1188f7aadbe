//! Static binary rewriting backend.
//!
//! A single inserted assignment or call is compiled into the binary at the
//! instruction address of its breakpoint with `e9tool`; tests then run the
//! rewritten copy directly.
use super::{
    binary_coverage, record_failure, run_oracle, Candidate, PatchedProgram, RunEnv, Staged,
    TestOutcome, Validator,
};
use crate::config::PatchMode;
use crate::exec::{run_command, CancelToken};
use crate::gdb::resolve_address;
use crate::interpreter::{parse_statement, Statement};
use crate::patch::{BreakPoint, Patch};
use crate::rank::coverage;
use crate::util::{ensure_dir, path_safe, shell_quote};
use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

/// Where and what to patch into the binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewritePlan {
    pub breakpoint: BreakPoint,
    pub expression: String,
}

/// Rewrite plan for `patch`, or `None` when the edit needs control flow.
///
/// Only one fragment with one inserted assignment or call and no removed
/// lines qualifies.
pub fn rewrite_plan(patch: &Patch) -> Option<RewritePlan> {
    if patch.requires_recompilation || patch.fragments.len() != 1 {
        return None;
    }
    let (breakpoint, fragment) = patch.fragments.iter().next()?;
    if !fragment.removed.is_empty() || fragment.jump_line.is_some() {
        return None;
    }
    let mut statements = fragment.inserted.iter().filter_map(|raw| parse_statement(raw));
    let statement = statements.next()?;
    if statements.next().is_some() {
        return None;
    }
    let expression = match statement {
        Statement::Assignment { text, .. } => text,
        Statement::Call(expr) => expr,
        _ => return None,
    };
    if expression.contains(['"', '\'']) {
        return None;
    }
    Some(RewritePlan {
        breakpoint: breakpoint.clone(),
        expression,
    })
}

/// `e9tool` arguments patching `expression` in at `address`.
pub fn e9tool_args(binary: &Path, out: &Path, address: u64, expression: &str) -> Vec<String> {
    vec![
        "-M".to_string(),
        format!("addr==0x{address:x}"),
        "-P".to_string(),
        format!("entry(\"{expression}\", base, static addr, state)@patch_hook"),
        binary.display().to_string(),
        "-E".to_string(),
        ".plt".to_string(),
        "-o".to_string(),
        out.display().to_string(),
    ]
}

pub struct RewriteBackend {
    env: Arc<RunEnv>,
}

impl RewriteBackend {
    pub fn new(env: Arc<RunEnv>) -> Self {
        Self { env }
    }
}

impl Validator for RewriteBackend {
    fn mode(&self) -> PatchMode {
        PatchMode::Rewrite
    }

    fn stage<'s>(&'s self, patch: &'s Patch, cancel: &'s CancelToken) -> Result<Staged<'s>> {
        if patch.requires_recompilation {
            bail!("patch {} requires recompilation and cannot be rewritten", patch.id);
        }
        let Some(plan) = rewrite_plan(patch) else {
            return Ok(Staged::ApplyFailed(
                "edit cannot be expressed as a binary rewrite".to_string(),
            ));
        };
        let config = &self.env.config;
        let binary = config
            .binary
            .as_ref()
            .ok_or_else(|| anyhow!("patch_mode rewrite needs a binary"))?;
        let Some(address) = resolve_address(binary, &plan.breakpoint, config.test_timeout, cancel)?
        else {
            return Ok(Staged::ApplyFailed(format!(
                "no instruction address for {}",
                plan.breakpoint
            )));
        };

        let dir = self.env.paths.rewritten_dir();
        ensure_dir(&dir)?;
        let out = dir.join(path_safe(&patch.id));
        let mut cmd = Command::new("e9tool");
        cmd.args(e9tool_args(binary, &out, address, &plan.expression));
        if let Some(plugins) = &config.e9_plugin_dir {
            cmd.current_dir(plugins);
        }
        let output = run_command(&mut cmd, Some(config.task_timeout), cancel)
            .context("run e9tool")?;
        if !output.success() || !out.is_file() {
            record_failure(&self.env.paths, &patch.id, "rewrite", &output);
            return Ok(Staged::BuildFailed(format!(
                "e9tool failed: {}",
                output.stderr_excerpt().trim()
            )));
        }
        tracing::debug!(patch = %patch.id, address = %format_args!("0x{address:x}"), binary = %out.display(), "binary rewritten");
        Ok(Staged::Ready(Box::new(RewrittenProgram {
            env: &self.env,
            patch,
            binary: out,
            cancel,
        })))
    }
}

struct RewrittenProgram<'s> {
    env: &'s RunEnv,
    patch: &'s Patch,
    binary: PathBuf,
    cancel: &'s CancelToken,
}

impl PatchedProgram for RewrittenProgram<'_> {
    fn run_test(&mut self, test_id: &str) -> Result<TestOutcome> {
        let extra = [("PATCH_ID".to_string(), self.patch.id.clone())];
        let output = run_oracle(self.env, test_id, Some(&self.binary), &extra, self.cancel)?;
        let passed = output.success();
        if !passed {
            record_failure(&self.env.paths, &self.patch.id, &format!("test {test_id}"), &output);
        }
        Ok(TestOutcome {
            test_id: test_id.to_string(),
            passed,
            cached: false,
            timed_out: output.timed_out,
        })
    }

    fn candidate(&self) -> Candidate {
        Candidate {
            path: self.binary.clone(),
            env: vec![("PATCH_ID".to_string(), self.patch.id.clone())],
        }
    }

    fn coverage(&mut self, test_id: &str, out: &Path) -> Result<bool> {
        let instrumented = self
            .env
            .paths
            .instrumented_dir()
            .join(path_safe(&self.patch.id));
        if !instrumented.is_file() {
            let built = coverage::instrument_or_warn(
                &self.binary,
                &instrumented,
                self.env.config.task_timeout,
            );
            if built.is_none() {
                return Ok(false);
            }
        }
        let inner = shell_quote(&instrumented.to_string_lossy());
        binary_coverage(self.env, &self.patch.id, test_id, &inner, out, self.cancel)
    }
}
