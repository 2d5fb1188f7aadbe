//! `run` and `script` commands.
//!
//! A run loads the patch population, fans patches out over the worker pool
//! (stage, fix-failing tests, tier gates, evidence), then ranks and reports
//! once every unit has finished or been skipped.
use crate::backend::{Backends, RunEnv, Validation};
use crate::classify::{classify, Classification};
use crate::cli::{RunArgs, ScriptArgs};
use crate::config::{check_dependencies, merge_sources, Config, ConfigLayer, PatchMode};
use crate::exec::CancelToken;
use crate::gdb::{compile_patch, render_script, SnapshotHooks};
use crate::partition::assign_partitions;
use crate::patch::loader::{load_patches, LoadOptions};
use crate::patch::reader::{read_patch, ReadOptions, ReadOutcome};
use crate::patch::Patch;
use crate::rank::{self, Evidence, RankedPatch};
use crate::report::{self, PatchRecord, RunSummary};
use crate::scheduler::{run_units, SchedulerOptions, TaskOutcome, SHUTDOWN};
use crate::util::ensure_dir;
use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// What one scheduled patch produced; the staged program is gone by now.
#[derive(Debug)]
struct UnitResult {
    classification: Classification,
    reason: Option<String>,
    timed_out: bool,
    executed: usize,
    cached: usize,
    evidence: Option<Evidence>,
}

impl UnitResult {
    fn failed(classification: Classification, reason: String) -> Self {
        Self {
            classification,
            reason: Some(reason),
            timed_out: false,
            executed: 0,
            cached: 0,
            evidence: None,
        }
    }
}

/// Furthest point a unit reached; read back when the unit times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitStage {
    Staging,
    Testing,
    Gating,
    Classified(Classification),
}

impl UnitStage {
    /// Result for a unit whose task timeout expired at this stage.
    fn timed_out(self) -> UnitResult {
        let (classification, reason) = match self {
            Self::Staging => (Classification::InvalidBuild, "task timed out while applying or building"),
            Self::Testing => (Classification::Incorrect, "task timed out while running failing tests"),
            Self::Gating => (Classification::Incorrect, "task timed out while running test tiers"),
            Self::Classified(class) => (class, "task timed out while collecting ranking evidence"),
        };
        UnitResult {
            timed_out: true,
            ..UnitResult::failed(classification, reason.to_string())
        }
    }
}

#[derive(Debug, Default)]
struct StageTracker {
    stages: Mutex<HashMap<String, UnitStage>>,
}

impl StageTracker {
    fn enter(&self, patch_id: &str, stage: UnitStage) {
        self.stages.lock().insert(patch_id.to_string(), stage);
    }

    fn get(&self, patch_id: &str) -> UnitStage {
        self.stages
            .lock()
            .get(patch_id)
            .copied()
            .unwrap_or(UnitStage::Staging)
    }
}

fn validate_patch(
    env: &RunEnv,
    backends: &Backends,
    patch: &Patch,
    stages: &StageTracker,
    cancel: &CancelToken,
) -> Result<UnitResult> {
    let test_ids = &env.config.test_ids;
    let backend = backends.route(patch)?;
    tracing::debug!(patch = %patch.id, mode = ?backend.mode(), "validating");
    stages.enter(&patch.id, UnitStage::Staging);
    let staged = backend.stage(patch, cancel)?;
    stages.enter(&patch.id, UnitStage::Testing);
    let validation = Validation::run(staged, test_ids, cancel)?;
    stages.enter(&patch.id, UnitStage::Gating);
    let classified = classify(env, &patch.id, test_ids.len(), validation, cancel)?;
    stages.enter(&patch.id, UnitStage::Classified(classified.classification));
    let evidence = match classified.program {
        Some(mut program) if classified.classification.is_ranked() && !env.config.only_validate => {
            Some(rank::collect_evidence(env, patch, program.as_mut(), test_ids))
        }
        _ => None,
    };
    Ok(UnitResult {
        classification: classified.classification,
        reason: classified.reason,
        timed_out: classified.result.any_timed_out(),
        executed: classified.result.executed,
        cached: classified.result.cached,
        evidence,
    })
}

fn process_patch(
    env: &RunEnv,
    backends: &Backends,
    patch: &Patch,
    stages: &StageTracker,
    cancel: &CancelToken,
) -> UnitResult {
    let result = validate_patch(env, backends, patch, stages, cancel).unwrap_or_else(|err| {
        tracing::warn!(patch = %patch.id, error = %format_args!("{err:#}"), "patch validation failed");
        UnitResult::failed(Classification::InvalidApply, format!("{err:#}"))
    });
    tracing::info!(
        patch = %patch.id,
        class = %result.classification,
        executed = result.executed,
        cached = result.cached,
        "patch classified"
    );
    result
}

fn workers(config: &Config) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|count| count.get())
        .unwrap_or(1);
    config.exec_mode.worker_count(cores)
}

/// Full validation and ranking run.
pub fn run(args: &RunArgs) -> Result<RunSummary> {
    let started = Instant::now();
    let config = Config::load(args)?;
    let missing = check_dependencies(&config);
    if !missing.is_empty() {
        tracing::warn!(missing = %missing.join(", "), "some external tools are unavailable");
    }
    let options = LoadOptions {
        limit: config.limit,
        per_dir_limit: config.per_dir_limit,
        source_file: config.source_file.clone(),
        keep_dirs: config.patch_mode == PatchMode::Compile,
    };
    let mut loaded = load_patches(&config.patch_location, &options)?;
    let partitions = assign_partitions(&mut loaded.patches);
    tracing::info!(
        patches = loaded.patches.len(),
        partitions = partitions.len(),
        "partitions assigned"
    );

    let env = Arc::new(RunEnv::new(config));
    let backends = Backends::from_env(env.clone());
    if let Some(patch) = loaded
        .patches
        .iter()
        .find(|patch| patch.requires_recompilation)
    {
        if !backends.can_recompile() {
            bail!(
                "patch {} requires recompilation; configure source_dir to validate it",
                patch.id
            );
        }
    }
    ensure_dir(&env.paths.scripts_dir())?;

    let scheduler = SchedulerOptions {
        workers: workers(&env.config),
        task_timeout: env.config.task_timeout,
        budget: env.config.budget,
        shutdown: &SHUTDOWN,
    };
    tracing::info!(
        workers = scheduler.workers,
        mode = ?env.config.patch_mode,
        tests = env.config.test_ids.len(),
        "validation started"
    );
    let stages = StageTracker::default();
    let report = run_units(&loaded.patches, scheduler, |patch, cancel| {
        process_patch(&env, &backends, patch, &stages, cancel)
    });

    let mut summary = RunSummary {
        initial: loaded.initial,
        empty: std::mem::take(&mut loaded.empty),
        unreadable: std::mem::take(&mut loaded.unreadable),
        unhandled: std::mem::take(&mut loaded.unhandled),
        over_limit: loaded.over_limit,
        scheduler: report.counters.clone(),
        ..RunSummary::default()
    };
    let mut records = Vec::new();
    let mut evidence: Vec<(&Patch, Evidence)> = Vec::new();
    for (patch, outcome) in loaded.patches.iter().zip(report.outcomes) {
        let unit = match outcome {
            TaskOutcome::Completed(unit) => unit,
            TaskOutcome::TimedOut => stages.get(&patch.id).timed_out(),
            TaskOutcome::Failed(message) => UnitResult::failed(Classification::InvalidApply, message),
            TaskOutcome::Skipped => {
                summary.skipped.push(patch.id.clone());
                continue;
            }
        };
        summary.executed_tests += unit.executed;
        summary.cached_tests += unit.cached;
        if unit.timed_out {
            summary.timed_out.push(patch.id.clone());
        }
        if let Some(collected) = unit.evidence {
            evidence.push((patch, collected));
        }
        records.push(PatchRecord {
            patch_id: patch.id.clone(),
            classification: unit.classification,
            reason: unit.reason,
            timed_out: unit.timed_out,
            path: patch.path.clone(),
            export_name: patch.export_name(),
        });
    }
    summary.count_classes(&records);

    report::write_results(&env.paths, &records)?;
    report::export_patches(&env.paths, &records)?;

    if !env.config.only_validate {
        let ranked = if evidence.is_empty() {
            Vec::new()
        } else {
            let original = rank::original_coverage(&env, &env.config.test_ids, &CancelToken::new());
            let scored = evidence
                .iter()
                .map(|(patch, collected)| RankedPatch {
                    patch_id: patch.id.clone(),
                    distance: rank::score(patch, collected, &original),
                })
                .collect();
            rank::rank(scored)
        };
        summary.ranked = ranked.len();
        report::write_scores(&env.paths, &ranked)?;
    }

    summary.possible_issues = report::scan_possible_issues(&env.paths.errors_dir());
    summary.duration_ms = started.elapsed().as_millis();
    report::write_summary(&env.paths, &summary)?;
    report::print_summary(&env.paths, &summary);
    Ok(summary)
}

fn read_single_patch(path: &Path, source_file: Option<&str>) -> Result<Patch> {
    let text = fs::read_to_string(path).with_context(|| format!("read patch {}", path.display()))?;
    let options = ReadOptions {
        source_file,
        keep_dirs: false,
    };
    match read_patch(&text, &options) {
        ReadOutcome::Parsed(parsed) => Ok(Patch {
            id: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            tool: None,
            path: path.to_path_buf(),
            source_file: parsed.source_file,
            fragments: parsed.fragments,
            requires_recompilation: false,
            partition: None,
        }),
        ReadOutcome::Empty => bail!("patch {} has no changed lines", path.display()),
        ReadOutcome::RequiresRecompilation { source_file } => bail!(
            "patch {} changes {source_file} in a way only recompilation can validate",
            path.display()
        ),
    }
}

/// Print the debugger script compiled from one patch.
pub fn script(args: &ScriptArgs) -> Result<()> {
    let layer = merge_sources(&args.config, ConfigLayer::from_config_args(&args.config)?)?;
    let patch_file = layer
        .patch_file
        .as_ref()
        .ok_or_else(|| anyhow!("--patch-file is required"))?;
    let patch = read_single_patch(patch_file, layer.source_file.as_deref())?;
    let fragments = compile_patch(&patch);
    let before = Path::new("before.core");
    let after = Path::new("after.core");
    let hooks = if args.snapshot {
        SnapshotHooks::Signature { before, after }
    } else {
        SnapshotHooks::None
    };
    print!("{}", render_script(&fragments, hooks));
    Ok(())
}
