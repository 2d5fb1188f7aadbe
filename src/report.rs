//! Run outputs: `result.json`, per-class patch copies, `patch-score`, and the
//! run summary.
use crate::classify::Classification;
use crate::paths::OutputPaths;
use crate::rank::RankedPatch;
use crate::scheduler::SchedulerCounters;
use crate::util::{display_path, ensure_dir, write_json};
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Substrings in error logs that point at a debugger script problem rather
/// than a wrong patch.
const ISSUE_PATTERNS: [&str; 3] = ["syntax error", "Undefined command", "has unknown return type"];

/// Final state of one classified patch.
#[derive(Debug, Clone, Serialize)]
pub struct PatchRecord {
    pub patch_id: String,
    pub classification: Classification,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timed_out: bool,
    #[serde(skip)]
    pub path: PathBuf,
    #[serde(skip)]
    pub export_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PossibleIssue {
    pub log: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub initial: usize,
    pub empty: Vec<String>,
    pub unreadable: Vec<String>,
    pub unhandled: Vec<String>,
    pub over_limit: usize,
    pub classes: BTreeMap<String, usize>,
    pub timed_out: Vec<String>,
    pub skipped: Vec<String>,
    pub executed_tests: usize,
    pub cached_tests: usize,
    pub ranked: usize,
    pub duration_ms: u128,
    pub scheduler: SchedulerCounters,
    pub possible_issues: Vec<PossibleIssue>,
}

impl RunSummary {
    /// Fill per-class counts from `records`; every class is listed.
    pub fn count_classes(&mut self, records: &[PatchRecord]) {
        self.classes = Classification::ALL
            .iter()
            .map(|class| (class.label().to_string(), 0))
            .collect();
        for record in records {
            *self
                .classes
                .entry(record.classification.label().to_string())
                .or_default() += 1;
        }
    }
}

/// `result.json`: `[[patch_id, label], ...]` in load order.
pub fn write_results(paths: &OutputPaths, records: &[PatchRecord]) -> Result<()> {
    let rows: Vec<[&str; 2]> = records
        .iter()
        .map(|record| [record.patch_id.as_str(), record.classification.label()])
        .collect();
    write_json(&paths.result_path(), &rows)
}

/// Copy every classified patch into its class directory.
pub fn export_patches(paths: &OutputPaths, records: &[PatchRecord]) -> Result<()> {
    for class in Classification::ALL {
        ensure_dir(&paths.class_dir(class.dir_name()))?;
    }
    for record in records {
        let dest = paths
            .class_dir(record.classification.dir_name())
            .join(&record.export_name);
        fs::copy(&record.path, &dest).with_context(|| {
            format!("copy {} to {}", record.path.display(), dest.display())
        })?;
    }
    Ok(())
}

pub fn render_scores(ranked: &[RankedPatch]) -> String {
    let mut out = String::new();
    for patch in ranked {
        let _ = writeln!(
            out,
            "{} {} {} {}",
            patch.patch_id, patch.distance.trace, patch.distance.coverage, patch.distance.edit
        );
    }
    out
}

/// `patch-score`: one line per ranked patch, best first.
pub fn write_scores(paths: &OutputPaths, ranked: &[RankedPatch]) -> Result<()> {
    let path = paths.score_path();
    fs::write(&path, render_scores(ranked)).with_context(|| format!("write {}", path.display()))
}

/// Scan `errors/*.err` for debugger script problems.
pub fn scan_possible_issues(errors_dir: &Path) -> Vec<PossibleIssue> {
    let Ok(entries) = fs::read_dir(errors_dir) else {
        return Vec::new();
    };
    let mut logs: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "err"))
        .collect();
    logs.sort();
    let mut issues = Vec::new();
    for log in logs {
        let Ok(text) = fs::read_to_string(&log) else {
            continue;
        };
        for pattern in ISSUE_PATTERNS {
            if text.contains(pattern) {
                issues.push(PossibleIssue {
                    log: display_path(&log, Some(errors_dir)),
                    pattern: pattern.to_string(),
                });
            }
        }
    }
    issues
}

pub fn write_summary(paths: &OutputPaths, summary: &RunSummary) -> Result<()> {
    write_json(&paths.summary_path(), summary)
}

pub fn print_summary(paths: &OutputPaths, summary: &RunSummary) {
    println!("output: {}", paths.root().display());
    println!(
        "patches: {} (empty {}, unreadable {}, unhandled {}, over limit {})",
        summary.initial,
        summary.empty.len(),
        summary.unreadable.len(),
        summary.unhandled.len(),
        summary.over_limit
    );
    for class in Classification::ALL {
        let count = summary.classes.get(class.label()).copied().unwrap_or(0);
        println!("  {}: {count}", class.label());
    }
    println!(
        "tests: {} executed, {} cached",
        summary.executed_tests, summary.cached_tests
    );
    if !summary.timed_out.is_empty() {
        println!("timed out: {}", summary.timed_out.join(", "));
    }
    if !summary.skipped.is_empty() {
        println!("skipped: {}", summary.skipped.len());
    }
    println!("ranked: {}", summary.ranked);
    if !summary.possible_issues.is_empty() {
        println!("possible issues:");
        for issue in &summary.possible_issues {
            println!("  - {}: {}", issue.log, issue.pattern);
        }
    }
    println!("duration: {:.1}s", summary.duration_ms as f64 / 1000.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rank::DistanceVector;

    fn record(dir: &Path, id: &str, export: &str, class: Classification) -> PatchRecord {
        let path = dir.join(export);
        fs::write(&path, format!("--- {id}\n")).expect("write patch");
        PatchRecord {
            patch_id: id.to_string(),
            classification: class,
            reason: None,
            timed_out: false,
            path,
            export_name: export.to_string(),
        }
    }

    #[test]
    fn results_and_exports_follow_classes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = OutputPaths::new(dir.path().join("out"), None);
        let records = vec![
            record(dir.path(), "llm:1.patch", "llm-1.patch", Classification::Plausible),
            record(dir.path(), "2.patch", "2.patch", Classification::InvalidBuild),
        ];
        write_results(&paths, &records).expect("results");
        export_patches(&paths, &records).expect("export");

        let text = fs::read_to_string(paths.result_path()).expect("read results");
        let rows: Vec<(String, String)> = serde_json::from_str(&text).expect("parse results");
        assert_eq!(
            rows,
            vec![
                ("llm:1.patch".to_string(), "plausible".to_string()),
                ("2.patch".to_string(), "invalid-build".to_string()),
            ]
        );
        assert!(paths.class_dir("plausible").join("llm-1.patch").is_file());
        assert!(paths.class_dir("invalid").join("2.patch").is_file());
        assert!(paths.class_dir("high_quality").is_dir());
    }

    #[test]
    fn scores_render_one_line_per_patch() {
        let ranked = vec![RankedPatch {
            patch_id: "a".to_string(),
            distance: DistanceVector {
                trace: 0.25,
                coverage: 3.0,
                edit: 7,
            },
        }];
        assert_eq!(render_scores(&ranked), "a 0.25 3 7\n");
    }

    #[test]
    fn possible_issues_are_found_in_error_logs() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("pa.err"), "No symbol \"x\"\nA syntax error in expression\n")
            .expect("write log");
        fs::write(dir.path().join("pb.err"), "test 1 failed\n").expect("write log");
        fs::write(dir.path().join("notes.txt"), "Undefined command").expect("write notes");
        let issues = scan_possible_issues(dir.path());
        assert_eq!(
            issues,
            vec![PossibleIssue {
                log: "pa.err".to_string(),
                pattern: "syntax error".to_string(),
            }]
        );
    }

    #[test]
    fn summary_lists_every_class() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = vec![record(dir.path(), "p", "p", Classification::Correct)];
        let mut summary = RunSummary::default();
        summary.count_classes(&records);
        assert_eq!(summary.classes.len(), Classification::ALL.len());
        assert_eq!(summary.classes["correct"], 1);
        assert_eq!(summary.classes["invalid-apply"], 0);
    }
}
