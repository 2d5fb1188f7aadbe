//! Distance-based ordering of plausible-or-better patches.
//!
//! Evidence (coverage maps and location traces) is collected while a patch is
//! still staged; scoring and sorting happen afterwards, against the original
//! program's coverage collected once per run.
pub mod coverage;
pub mod distance;

use crate::backend::{binary_coverage, suite_coverage, PatchedProgram, RunEnv};
use crate::exec::CancelToken;
use crate::gdb::parse_trace_log;
use crate::patch::Patch;
use crate::util::{ensure_dir, path_safe, shell_quote};
use anyhow::Result;
use coverage::{load_coverage, CoverageMap};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const ORIGINAL_ID: &str = "original";

/// Ordering key; smaller is closer to the original program.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DistanceVector {
    pub trace: f64,
    pub coverage: f64,
    pub edit: usize,
}

impl DistanceVector {
    pub fn compare(&self, other: &Self) -> Ordering {
        self.trace
            .total_cmp(&other.trace)
            .then(self.coverage.total_cmp(&other.coverage))
            .then(self.edit.cmp(&other.edit))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPatch {
    pub patch_id: String,
    pub distance: DistanceVector,
}

/// Per-test observations of one patched program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evidence {
    pub coverage: BTreeMap<String, CoverageMap>,
    /// `(patched, original)` location traces.
    pub traces: BTreeMap<String, (Vec<String>, Vec<String>)>,
}

fn coverage_path(env: &RunEnv, id: &str, test_id: &str) -> PathBuf {
    env.paths
        .coverage_dir()
        .join(format!("{}-t{}.coverage", path_safe(id), path_safe(test_id)))
}

fn read_trace(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(parse_trace_log(&text))
}

/// Collect coverage (and traces when enabled) from a staged program.
///
/// Collection problems are logged and leave the metric at zero.
pub fn collect_evidence(
    env: &RunEnv,
    patch: &Patch,
    program: &mut dyn PatchedProgram,
    test_ids: &[String],
) -> Evidence {
    let mut evidence = Evidence::default();
    if let Err(err) = ensure_dir(&env.paths.coverage_dir()) {
        tracing::warn!(error = %err, "coverage dir unavailable");
        return evidence;
    }
    for test_id in test_ids {
        let out = coverage_path(env, &patch.id, test_id);
        match program.coverage(test_id, &out) {
            Ok(true) => match load_coverage(&out) {
                Ok(map) => {
                    evidence.coverage.insert(test_id.clone(), map);
                }
                Err(err) => tracing::warn!(patch = %patch.id, test = %test_id, error = %err, "read coverage"),
            },
            Ok(false) => tracing::debug!(patch = %patch.id, test = %test_id, "no coverage collected"),
            Err(err) => tracing::warn!(patch = %patch.id, test = %test_id, error = %err, "collect coverage"),
        }
    }
    if !env.config.trace_distance {
        return evidence;
    }
    let traces = env.paths.traces_dir();
    if let Err(err) = ensure_dir(&traces) {
        tracing::warn!(error = %err, "trace dir unavailable");
        return evidence;
    }
    for test_id in test_ids {
        let stem = format!("{}-t{}", path_safe(&patch.id), path_safe(test_id));
        let patched = traces.join(format!("{stem}.patched.trace"));
        let original = traces.join(format!("{stem}.original.trace"));
        let collected = program
            .trace(test_id, &patched, &original)
            .and_then(|done| {
                if !done {
                    return Ok(None);
                }
                Ok(Some((read_trace(&patched)?, read_trace(&original)?)))
            });
        match collected {
            Ok(Some(pair)) => {
                evidence.traces.insert(test_id.clone(), pair);
            }
            Ok(None) => tracing::debug!(patch = %patch.id, test = %test_id, "no trace collected"),
            Err(err) => tracing::warn!(patch = %patch.id, test = %test_id, error = %err, "collect trace"),
        }
    }
    evidence
}

/// Coverage of the unpatched program for every test.
pub fn original_coverage(
    env: &RunEnv,
    test_ids: &[String],
    cancel: &CancelToken,
) -> BTreeMap<String, CoverageMap> {
    let mut maps = BTreeMap::new();
    if let Err(err) = ensure_dir(&env.paths.coverage_dir()) {
        tracing::warn!(error = %err, "coverage dir unavailable");
        return maps;
    }
    let instrumented = match env.config.binary {
        Some(_) => match env.instrumented_binary() {
            Some(path) => Some(path),
            None => return maps,
        },
        None => None,
    };
    for test_id in test_ids {
        let out = coverage_path(env, ORIGINAL_ID, test_id);
        let collected = match instrumented {
            Some(binary) => {
                let inner = shell_quote(&binary.to_string_lossy());
                binary_coverage(env, ORIGINAL_ID, test_id, &inner, &out, cancel)
            }
            None => {
                let extra = vec![("PATCH_ID".to_string(), ORIGINAL_ID.to_string())];
                suite_coverage(env, test_id, extra, &out, cancel)
            }
        };
        match collected.and_then(|done| done.then(|| load_coverage(&out)).transpose()) {
            Ok(Some(map)) => {
                maps.insert(test_id.clone(), map);
            }
            Ok(None) => tracing::debug!(test = %test_id, "no original coverage collected"),
            Err(err) => tracing::warn!(test = %test_id, error = %err, "collect original coverage"),
        }
    }
    maps
}

/// Distance vector of one patch.
pub fn score(patch: &Patch, evidence: &Evidence, original: &BTreeMap<String, CoverageMap>) -> DistanceVector {
    let coverage: Vec<f64> = evidence
        .coverage
        .iter()
        .filter_map(|(test_id, patched)| {
            let baseline = original.get(test_id)?;
            Some(distance::coverage_distance(patched, baseline) as f64)
        })
        .collect();
    let traces: Vec<f64> = evidence
        .traces
        .values()
        .map(|(patched, unpatched)| distance::trace_distance(patched, unpatched))
        .collect();
    DistanceVector {
        trace: distance::mean(&traces),
        coverage: distance::mean(&coverage),
        edit: distance::levenshtein(&patch.removed_text(), &patch.inserted_text()),
    }
}

/// Stable ascending sort by `(trace, coverage, edit)`.
pub fn rank(mut patches: Vec<RankedPatch>) -> Vec<RankedPatch> {
    patches.sort_by(|a, b| a.distance.compare(&b.distance));
    patches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::{BreakPoint, Fragment};

    fn ranked(id: &str, trace: f64, coverage: f64, edit: usize) -> RankedPatch {
        RankedPatch {
            patch_id: id.to_string(),
            distance: DistanceVector { trace, coverage, edit },
        }
    }

    #[test]
    fn ranking_is_lexicographic_and_stable() {
        let input = vec![
            ranked("c", 0.0, 4.0, 1),
            ranked("a", 0.0, 2.0, 9),
            ranked("b", 0.0, 2.0, 3),
            ranked("d", 0.5, 0.0, 0),
            ranked("e", 0.0, 2.0, 3),
        ];
        let order: Vec<String> = rank(input).into_iter().map(|p| p.patch_id).collect();
        assert_eq!(order, ["b", "e", "a", "c", "d"]);
    }

    #[test]
    fn score_combines_metrics() {
        let mut fragments = BTreeMap::new();
        fragments.insert(
            BreakPoint::new("f.c", 4),
            Fragment {
                inserted: vec!["len = len - 1;".to_string()],
                removed: vec!["len = len;".to_string()],
                jump_line: None,
            },
        );
        let patch = Patch {
            id: "p".to_string(),
            tool: None,
            path: PathBuf::from("p"),
            source_file: "f.c".to_string(),
            fragments,
            requires_recompilation: false,
            partition: None,
        };
        let map = |pairs: &[(&str, u64)]| -> CoverageMap {
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
        };
        let mut evidence = Evidence::default();
        evidence.coverage.insert("1".to_string(), map(&[("e1", 2)]));
        evidence.coverage.insert("2".to_string(), map(&[("e1", 1), ("e2", 4)]));
        let mut original = BTreeMap::new();
        original.insert("1".to_string(), map(&[("e1", 1)]));
        original.insert("2".to_string(), map(&[("e1", 1)]));

        let vector = score(&patch, &evidence, &original);
        assert_eq!(vector.trace, 0.0);
        assert_eq!(vector.coverage, 2.5);
        assert_eq!(vector.edit, 4);
    }
}
