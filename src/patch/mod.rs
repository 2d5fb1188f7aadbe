//! Candidate patch model.
//!
//! A [`Patch`] is built once by the loader from a diff file and never mutated
//! afterwards, except that the partition id is attached before validation
//! starts.
pub mod loader;
pub mod reader;

use crate::partition::PartitionId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// A source location `(file, line)` where a fragment takes effect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BreakPoint {
    pub file: String,
    pub line: u32,
}

impl BreakPoint {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }

    /// Same file, `delta` lines further down.
    pub fn offset(&self, delta: u32) -> Self {
        Self::new(self.file.clone(), self.line.saturating_add(delta))
    }

    pub fn with_line(&self, line: u32) -> Self {
        Self::new(self.file.clone(), line)
    }
}

impl fmt::Display for BreakPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Inserted and removed lines at one breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Fragment {
    pub inserted: Vec<String>,
    pub removed: Vec<String>,
    /// Continuation line fixed by a `/* jump: N */` marker.
    pub jump_line: Option<u32>,
}

impl Fragment {
    /// Where execution resumes once the fragment has run.
    ///
    /// An explicit marker wins; otherwise the continuation skips the removed
    /// lines, and always advances at least one line.
    pub fn continuation(&self, breakpoint: &BreakPoint) -> BreakPoint {
        match self.jump_line {
            Some(line) => breakpoint.with_line(line),
            None => {
                let skipped = u32::try_from(self.removed.len().max(1)).unwrap_or(u32::MAX);
                breakpoint.offset(skipped)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.removed.is_empty()
    }

    pub fn merge(&mut self, other: Fragment) {
        self.inserted.extend(other.inserted);
        self.removed.extend(other.removed);
        if self.jump_line.is_none() {
            self.jump_line = other.jump_line;
        }
    }

    /// Text compared by the edit-distance metric.
    pub fn removed_text(&self) -> String {
        normalize_edit_text(&self.removed)
    }

    pub fn inserted_text(&self) -> String {
        normalize_edit_text(&self.inserted)
    }
}

fn normalize_edit_text(lines: &[String]) -> String {
    lines
        .concat()
        .replace(['\t', '\n'], "")
        .trim()
        .to_string()
}

#[derive(Debug, Clone)]
pub struct Patch {
    /// `<tool>:<file-name>` or just the file name.
    pub id: String,
    /// Generator name taken from the patch's sub-directory, if any.
    pub tool: Option<String>,
    pub path: PathBuf,
    pub source_file: String,
    pub fragments: BTreeMap<BreakPoint, Fragment>,
    pub requires_recompilation: bool,
    pub partition: Option<PartitionId>,
}

impl Patch {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Name used for the per-class copy of the patch file.
    pub fn export_name(&self) -> String {
        match &self.tool {
            Some(tool) => format!("{}-{}", tool.replace('/', "-"), self.file_name()),
            None => self.file_name(),
        }
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = &BreakPoint> {
        self.fragments.keys()
    }

    pub fn removed_text(&self) -> String {
        self.fragments
            .values()
            .map(Fragment::removed_text)
            .collect::<Vec<_>>()
            .concat()
    }

    pub fn inserted_text(&self) -> String {
        self.fragments
            .values()
            .map(Fragment::inserted_text)
            .collect::<Vec<_>>()
            .concat()
    }
}
