//! Recompilation backend.
//!
//! Applies the diff to the shared source tree, rebuilds, and runs tests
//! against the rebuilt program. The tree is locked from apply until the
//! program handle is dropped, which reverts the patch.
use super::{
    binary_coverage, record_failure, run_oracle, suite_coverage, Candidate, PatchedProgram,
    RunEnv, Staged, TestOutcome, Validator,
};
use crate::config::PatchMode;
use crate::exec::{run_command, script_command, CancelToken, ProcessOutput};
use crate::patch::Patch;
use crate::rank::coverage;
use crate::util::{path_safe, shell_quote};
use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

/// Placeholder substituted with the patch path in configured commands.
const PATCH_FILE_PLACEHOLDER: &str = "PATCH_FILE";

#[derive(Debug, Default)]
struct TreeState {
    configured: bool,
}

pub struct RecompileBackend {
    env: Arc<RunEnv>,
    tree: Mutex<TreeState>,
}

/// Build a command from a configured template, substituting the patch path.
pub fn command_from_template(template: &str, patch_file: &Path) -> Result<Command> {
    let words = shell_words::split(template)
        .with_context(|| format!("parse command {template:?}"))?;
    let patch_file = patch_file.to_string_lossy();
    let mut words = words
        .into_iter()
        .map(|word| word.replace(PATCH_FILE_PLACEHOLDER, &patch_file));
    let program = words
        .next()
        .ok_or_else(|| anyhow!("command template is empty"))?;
    let mut cmd = Command::new(program);
    cmd.args(words);
    Ok(cmd)
}

/// Files with `extension` below `root`, skipping hidden directories.
fn files_with_extension(root: &Path, extension: &str) -> BTreeSet<PathBuf> {
    let mut found = BTreeSet::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if path.is_dir() {
                if !hidden {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|ext| ext == extension) {
                found.insert(path);
            }
        }
    }
    found
}

/// First file named `name` below `root` in sorted order.
fn find_file(root: &Path, name: &str) -> Option<PathBuf> {
    let mut pending = vec![root.to_path_buf()];
    let mut matches = Vec::new();
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if !entry.file_name().to_string_lossy().starts_with('.') {
                    pending.push(path);
                }
            } else if entry.file_name().to_string_lossy() == name {
                matches.push(path);
            }
        }
    }
    matches.sort();
    matches.into_iter().next()
}

/// `.orig` and `.rej` files present in the tree before a `patch` run.
#[derive(Debug, Default)]
struct Artifacts {
    orig: BTreeSet<PathBuf>,
    rej: BTreeSet<PathBuf>,
}

impl Artifacts {
    fn snapshot(root: &Path) -> Self {
        Self {
            orig: files_with_extension(root, "orig"),
            rej: files_with_extension(root, "rej"),
        }
    }
}

/// Move back `.orig` backups created since `baseline` and drop new rejects.
fn restore_backups(root: &Path, baseline: &Artifacts) {
    for backup in files_with_extension(root, "orig").difference(&baseline.orig) {
        let original = backup.with_extension("");
        if let Err(err) = fs::rename(backup, &original) {
            tracing::warn!(backup = %backup.display(), error = %err, "restore backup");
        }
    }
    remove_new(root, "rej", &baseline.rej);
}

fn remove_new(root: &Path, extension: &str, baseline: &BTreeSet<PathBuf>) {
    for path in files_with_extension(root, extension).difference(baseline) {
        if let Err(err) = fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %err, "remove patch artifact");
        }
    }
}

impl RecompileBackend {
    pub fn new(env: Arc<RunEnv>) -> Self {
        Self {
            env,
            tree: Mutex::new(TreeState::default()),
        }
    }

    fn source_dir(&self) -> Result<&Path> {
        self.env
            .config
            .source_dir
            .as_deref()
            .ok_or_else(|| anyhow!("recompilation needs source_dir"))
    }

    fn run_in_tree(
        &self,
        mut cmd: Command,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ProcessOutput> {
        cmd.current_dir(self.source_dir()?);
        run_command(&mut cmd, Some(timeout), cancel)
    }

    /// File `patch` should be applied to, when it can be named explicitly.
    fn target_file(&self, patch: &Patch) -> Result<Option<PathBuf>> {
        let dir = self.source_dir()?;
        if let Some(file) = &self.env.config.source_file {
            return Ok(Some(dir.join(file)));
        }
        let name = Path::new(&patch.source_file)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());
        Ok(name.and_then(|name| find_file(dir, &name)))
    }

    /// One `patch` invocation; backups from a failed attempt are restored.
    fn diff_patch(
        &self,
        patch: &Patch,
        reverse: bool,
        unified: bool,
        cancel: &CancelToken,
    ) -> Result<bool> {
        let dir = self.source_dir()?;
        let baseline = Artifacts::snapshot(dir);
        let mut cmd = Command::new("patch");
        cmd.args(["--ignore-whitespace", "-b", "-f"]);
        if unified {
            cmd.arg("-u");
        }
        if reverse {
            cmd.arg("-R");
        }
        match self.target_file(patch)? {
            Some(file) => {
                cmd.arg(file);
            }
            None => {
                cmd.arg("-p1");
            }
        }
        cmd.arg("-i").arg(&patch.path);
        let output = self.run_in_tree(cmd, self.env.config.test_timeout, cancel)?;
        if output.success() {
            return Ok(true);
        }
        let context = if reverse { "revert" } else { "apply" };
        record_failure(&self.env.paths, &patch.id, context, &output);
        restore_backups(dir, &baseline);
        Ok(false)
    }

    /// Apply `patch`; returns whether unified mode was used, `None` on failure.
    fn apply(&self, patch: &Patch, cancel: &CancelToken) -> Result<Option<bool>> {
        let commands = &self.env.config.source_commands;
        let timeout = self.env.config.test_timeout;
        let custom = match (&commands.patch_command, &commands.patch_script) {
            (Some(template), _) => Some(command_from_template(template, &patch.path)?),
            (None, Some(script)) => {
                let mut cmd = script_command(script);
                cmd.arg(&patch.path);
                Some(cmd)
            }
            (None, None) => None,
        };
        if let Some(cmd) = custom {
            let output = self.run_in_tree(cmd, timeout, cancel)?;
            if !output.success() {
                record_failure(&self.env.paths, &patch.id, "apply", &output);
            }
            return Ok(output.success().then_some(true));
        }
        for unified in [true, false] {
            if self.diff_patch(patch, false, unified, cancel)? {
                return Ok(Some(unified));
            }
        }
        Ok(None)
    }

    fn revert(&self, patch: &Patch, unified: bool) -> Result<bool> {
        let commands = &self.env.config.source_commands;
        let cancel = CancelToken::new();
        let custom = match (&commands.reset_command, &commands.reset_script) {
            (Some(template), _) => Some(command_from_template(template, &patch.path)?),
            (None, Some(script)) => {
                let mut cmd = script_command(script);
                cmd.arg(&patch.path);
                Some(cmd)
            }
            (None, None) => None,
        };
        if let Some(cmd) = custom {
            let output = self.run_in_tree(cmd, self.env.config.task_timeout, &cancel)?;
            if !output.success() {
                record_failure(&self.env.paths, &patch.id, "revert", &output);
            }
            return Ok(output.success());
        }
        Ok(self.diff_patch(patch, true, unified, &cancel)?
            || self.diff_patch(patch, true, !unified, &cancel)?)
    }

    /// Run the config script (first build only) and the build.
    fn build(
        &self,
        tree: &mut TreeState,
        patch: &Patch,
        cancel: &CancelToken,
    ) -> Result<Option<String>> {
        let config = &self.env.config;
        if let (Some(script), false) = (&config.source_commands.config_script, tree.configured) {
            let output = self.run_in_tree(script_command(script), config.task_timeout, cancel)?;
            tree.configured = true;
            if !output.success() {
                tracing::warn!(exit_code = ?output.exit_code, "config script failed");
            }
        }
        let mut cmd = match &config.source_commands.build_script {
            Some(script) => {
                let mut cmd = script_command(script);
                cmd.current_dir(self.source_dir()?);
                cmd
            }
            None => {
                let mut cmd = Command::new("make");
                let dir = match config.binary.as_deref().and_then(Path::parent) {
                    Some(dir) => dir,
                    None => self.source_dir()?,
                };
                cmd.current_dir(dir);
                cmd
            }
        };
        let output = run_command(&mut cmd, Some(config.task_timeout), cancel)
            .context("run build")?;
        if output.success() {
            return Ok(None);
        }
        record_failure(&self.env.paths, &patch.id, "build", &output);
        Ok(Some(if output.timed_out {
            "build timed out".to_string()
        } else {
            format!("build failed with exit code {:?}", output.exit_code)
        }))
    }
}

impl Validator for RecompileBackend {
    fn mode(&self) -> PatchMode {
        PatchMode::Compile
    }

    fn stage<'s>(&'s self, patch: &'s Patch, cancel: &'s CancelToken) -> Result<Staged<'s>> {
        let dir = self.source_dir()?;
        let tree = self.tree.lock();
        let baseline = Artifacts::snapshot(dir);
        let Some(unified) = self.apply(patch, cancel)? else {
            tracing::debug!(patch = %patch.id, "patch does not apply");
            return Ok(Staged::ApplyFailed("patch does not apply to the source tree".to_string()));
        };
        // The program reverts the patch on drop, including when the build errors.
        let mut program = SourceTreeProgram {
            backend: self,
            patch,
            tree,
            unified,
            baseline,
            cancel,
        };
        let failure = self.build(&mut program.tree, patch, cancel)?;
        if let Some(reason) = failure {
            drop(program);
            return Ok(Staged::BuildFailed(reason));
        }
        Ok(Staged::Ready(Box::new(program)))
    }
}

struct SourceTreeProgram<'s> {
    backend: &'s RecompileBackend,
    patch: &'s Patch,
    tree: MutexGuard<'s, TreeState>,
    unified: bool,
    /// Patch artifacts present before this patch was applied.
    baseline: Artifacts,
    cancel: &'s CancelToken,
}

impl SourceTreeProgram<'_> {
    fn env(&self) -> &RunEnv {
        &self.backend.env
    }
}

impl PatchedProgram for SourceTreeProgram<'_> {
    fn run_test(&mut self, test_id: &str) -> Result<TestOutcome> {
        let extra = [("PATCH_ID".to_string(), self.patch.id.clone())];
        let program = self.env().config.binary.clone();
        let output = run_oracle(self.env(), test_id, program.as_deref(), &extra, self.cancel)?;
        let passed = output.success();
        if !passed {
            record_failure(&self.env().paths, &self.patch.id, &format!("test {test_id}"), &output);
        }
        Ok(TestOutcome {
            test_id: test_id.to_string(),
            passed,
            cached: false,
            timed_out: output.timed_out,
        })
    }

    fn candidate(&self) -> Candidate {
        let config = &self.env().config;
        let path = config
            .binary
            .clone()
            .or_else(|| config.source_dir.clone())
            .unwrap_or_default();
        Candidate {
            path,
            env: vec![("PATCH_ID".to_string(), self.patch.id.clone())],
        }
    }

    fn coverage(&mut self, test_id: &str, out: &Path) -> Result<bool> {
        let env = self.backend.env.as_ref();
        let extra = vec![("PATCH_ID".to_string(), self.patch.id.clone())];
        let Some(binary) = env.config.binary.as_deref() else {
            return suite_coverage(env, test_id, extra, out, self.cancel);
        };
        let instrumented = env.paths.instrumented_dir().join(path_safe(&self.patch.id));
        if !instrumented.is_file()
            && coverage::instrument_or_warn(binary, &instrumented, env.config.task_timeout).is_none()
        {
            return Ok(false);
        }
        let inner = shell_quote(&instrumented.to_string_lossy());
        binary_coverage(env, &self.patch.id, test_id, &inner, out, self.cancel)
    }
}

impl Drop for SourceTreeProgram<'_> {
    fn drop(&mut self) {
        let Ok(dir) = self.backend.source_dir() else {
            return;
        };
        match self.backend.revert(self.patch, self.unified) {
            Ok(true) => {
                remove_new(dir, "orig", &self.baseline.orig);
                tracing::debug!(patch = %self.patch.id, "patch reverted");
            }
            Ok(false) => {
                tracing::warn!(patch = %self.patch.id, "patch revert failed, source tree may be dirty")
            }
            Err(err) => {
                tracing::warn!(patch = %self.patch.id, error = %err, "patch revert failed")
            }
        }
    }
}
