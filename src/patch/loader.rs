//! Patch population loading.
use super::reader::{read_patch, ReadOptions, ReadOutcome};
use super::Patch;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Maximum number of patch files considered overall.
    pub limit: Option<usize>,
    /// Maximum number of patch files considered per generator directory.
    pub per_dir_limit: Option<usize>,
    pub source_file: Option<String>,
    pub keep_dirs: bool,
}

/// Patches accepted for validation plus the ids set aside while loading.
#[derive(Debug, Default, Serialize)]
pub struct LoadReport {
    #[serde(skip)]
    pub patches: Vec<Patch>,
    pub initial: usize,
    pub empty: Vec<String>,
    pub unreadable: Vec<String>,
    pub unhandled: Vec<String>,
    pub over_limit: usize,
}

/// Load every patch under `root` (a directory walked recursively in sorted
/// order, or a single file).
pub fn load_patches(root: &Path, options: &LoadOptions) -> Result<LoadReport> {
    let files = if root.is_dir() {
        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        files.sort();
        files
    } else if root.is_file() {
        vec![root.to_path_buf()]
    } else {
        return Err(anyhow!("patch location {} does not exist", root.display()));
    };
    if files.is_empty() {
        tracing::warn!(dir = %root.display(), "patch directory contains no files");
    }

    let base = if root.is_dir() {
        root.to_path_buf()
    } else {
        root.parent().map(Path::to_path_buf).unwrap_or_default()
    };
    let read_options = ReadOptions {
        source_file: options.source_file.as_deref(),
        keep_dirs: options.keep_dirs,
    };

    let mut report = LoadReport::default();
    let mut per_tool: BTreeMap<String, usize> = BTreeMap::new();
    let mut seen_ids = BTreeSet::new();
    let considered = options.limit.unwrap_or(usize::MAX);
    for path in files.iter().take(considered) {
        report.initial += 1;
        let tool = tool_for(&base, path);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = match &tool {
            Some(tool) => format!("{tool}:{file_name}"),
            None => file_name,
        };

        let count = per_tool.entry(tool.clone().unwrap_or_default()).or_default();
        *count += 1;
        if options.per_dir_limit.is_some_and(|limit| *count > limit) {
            report.over_limit += 1;
            continue;
        }
        if !seen_ids.insert(id.clone()) {
            tracing::warn!(patch = %id, path = %path.display(), "duplicate patch id skipped");
            report.unhandled.push(id);
            continue;
        }

        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(patch = %id, error = %err, "could not read patch file");
                report.unreadable.push(id);
                continue;
            }
        };
        if bytes.is_empty() {
            report.empty.push(id);
            continue;
        }
        let Ok(text) = String::from_utf8(bytes) else {
            tracing::warn!(patch = %id, "patch file is not valid UTF-8");
            report.unreadable.push(id);
            continue;
        };

        let patch = match read_patch(&text, &read_options) {
            ReadOutcome::Empty => {
                tracing::debug!(patch = %id, "patch has no changed lines");
                report.unhandled.push(id);
                continue;
            }
            ReadOutcome::RequiresRecompilation { source_file } => Patch {
                id,
                tool,
                path: path.clone(),
                source_file,
                fragments: BTreeMap::new(),
                requires_recompilation: true,
                partition: None,
            },
            ReadOutcome::Parsed(parsed) => Patch {
                id,
                tool,
                path: path.clone(),
                source_file: parsed.source_file,
                fragments: parsed.fragments,
                requires_recompilation: false,
                partition: None,
            },
        };
        report.patches.push(patch);
    }
    if files.len() > considered {
        report.over_limit += files.len() - considered;
    }

    tracing::info!(
        loaded = report.patches.len(),
        empty = report.empty.len(),
        unreadable = report.unreadable.len(),
        unhandled = report.unhandled.len(),
        "patches loaded"
    );
    Ok(report)
}

fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(&path, files)?;
        } else if path.is_file() {
            files.push(path);
        }
    }
    Ok(())
}

/// Relative directory of a patch under the population root.
fn tool_for(base: &Path, path: &Path) -> Option<String> {
    let parent = path.parent()?;
    let relative = parent.strip_prefix(base).ok()?;
    let text = relative.to_string_lossy().into_owned();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
