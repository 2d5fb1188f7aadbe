//! Unified-diff reader producing per-breakpoint fragments.
use super::{BreakPoint, Fragment};
use std::collections::BTreeMap;

/// Parsed contents of one diff file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPatch {
    pub source_file: String,
    pub fragments: BTreeMap<BreakPoint, Fragment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Parsed(ParsedPatch),
    /// No hunks, or hunks without changed lines.
    Empty,
    /// The diff adds a dependency the emulator cannot express.
    RequiresRecompilation { source_file: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions<'a> {
    /// Overrides the file named in the diff header.
    pub source_file: Option<&'a str>,
    /// Keep directory components of header paths (source-tree mode).
    pub keep_dirs: bool,
}

pub fn read_patch(text: &str, options: &ReadOptions<'_>) -> ReadOutcome {
    let lines: Vec<&str> = text.lines().collect();
    let mut first_source: Option<String> = None;
    let mut current_file: Option<String> = None;
    let mut fragments: BTreeMap<BreakPoint, Fragment> = BTreeMap::new();
    let mut open: Option<(BreakPoint, Fragment)> = None;

    let mut idx = 0;
    while idx < lines.len() {
        let line = lines[idx];
        idx += 1;

        if line.starts_with("diff --git") {
            flush(&mut open, &mut fragments);
            current_file = None;
            continue;
        }
        if is_file_header(line, lines.get(idx).copied()) {
            flush(&mut open, &mut fragments);
            let new_path = lines.get(idx).copied().unwrap_or_default();
            idx += 1;
            let name = resolve_source_file(line, new_path, options);
            if first_source.is_none() {
                first_source = Some(name.clone());
            }
            current_file = Some(name);
            continue;
        }
        if line.starts_with("@@") {
            flush(&mut open, &mut fragments);
            let Some(start) = hunk_start_line(line) else {
                continue;
            };
            let file = current_file
                .clone()
                .or_else(|| options.source_file.map(str::to_string))
                .unwrap_or_default();
            open = Some((BreakPoint::new(file, start), Fragment::default()));
            continue;
        }
        // Dependency additions count with or without an enclosing hunk.
        if line
            .strip_prefix('+')
            .is_some_and(|content| !line.starts_with("+++ ") && adds_dependency(content))
        {
            return ReadOutcome::RequiresRecompilation {
                source_file: first_source
                    .or_else(|| options.source_file.map(str::to_string))
                    .unwrap_or_default(),
            };
        }
        let Some((_, fragment)) = open.as_mut() else {
            continue;
        };
        if let Some(content) = line.strip_prefix('+') {
            fragment.inserted.extend(split_inserted(content));
        } else if let Some(content) = line.strip_prefix('-') {
            if let Some(jump) = jump_marker(content) {
                fragment.jump_line = Some(jump);
            }
            fragment.removed.push(content.to_string());
        }
    }
    flush(&mut open, &mut fragments);

    if fragments.is_empty() {
        return ReadOutcome::Empty;
    }
    let source_file = first_source
        .or_else(|| options.source_file.map(str::to_string))
        .unwrap_or_default();
    ReadOutcome::Parsed(ParsedPatch {
        source_file,
        fragments,
    })
}

fn flush(open: &mut Option<(BreakPoint, Fragment)>, fragments: &mut BTreeMap<BreakPoint, Fragment>) {
    if let Some((bp, fragment)) = open.take() {
        if fragment.is_empty() {
            return;
        }
        match fragments.get_mut(&bp) {
            Some(existing) => existing.merge(fragment),
            None => {
                fragments.insert(bp, fragment);
            }
        }
    }
}

/// A `---` line only opens a file block when a `+++` line follows it.
fn is_file_header(line: &str, next: Option<&str>) -> bool {
    line.starts_with("--- ") && next.is_some_and(|next| next.starts_with("+++ "))
}

fn resolve_source_file(old_header: &str, new_header: &str, options: &ReadOptions<'_>) -> String {
    if let Some(source) = options.source_file {
        return source.to_string();
    }
    let old_path = header_path(old_header, "--- ");
    let raw = if old_path == "/dev/null" {
        header_path(new_header, "+++ ")
    } else {
        old_path
    };
    normalize_source_path(raw, options.keep_dirs)
}

fn header_path<'a>(line: &'a str, prefix: &str) -> &'a str {
    let rest = line.strip_prefix(prefix).unwrap_or(line);
    rest.split('\t').next().unwrap_or(rest).trim()
}

fn normalize_source_path(raw: &str, keep_dirs: bool) -> String {
    let mut path = raw;
    for prefix in ["a/src/", "b/src/", "a/", "b/"] {
        if let Some(stripped) = path.strip_prefix(prefix) {
            path = stripped;
            break;
        }
    }
    let path = if keep_dirs {
        path
    } else {
        path.rsplit('/').next().unwrap_or(path)
    };
    path.replace("_bk", "")
}

fn hunk_start_line(header: &str) -> Option<u32> {
    let old_range = header
        .split_whitespace()
        .find(|token| token.starts_with('-'))?;
    let start = old_range
        .trim_start_matches('-')
        .split(',')
        .next()?
        .parse::<u32>()
        .ok()?;
    Some(start.max(1))
}

fn adds_dependency(content: &str) -> bool {
    let trimmed = content.trim_start();
    content.contains("#include") || trimmed.starts_with("import ")
}

fn jump_marker(content: &str) -> Option<u32> {
    let (_, rest) = content.split_once("/* jump:")?;
    let digits: String = rest
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// Re-split an inserted line holding several statements.
fn split_inserted(content: &str) -> Vec<String> {
    if !content.contains(';') {
        return vec![content.to_string()];
    }
    let trimmed = content.trim_start();
    if starts_with_keyword(trimmed, "for") {
        return vec![content.to_string()];
    }
    if starts_with_keyword(trimmed, "if") {
        if let Some(open) = content.find('(') {
            let close = condition_end(content, open);
            let mut parts = vec![content[..close].to_string()];
            let rest = &content[close..];
            if !rest.trim().is_empty() {
                parts.push(rest.to_string());
            }
            return parts;
        }
    }
    content
        .split(';')
        .filter(|part| part.len() > 1)
        .map(str::to_string)
        .collect()
}

/// True when `text` starts with `keyword` followed by a space or `(`.
pub(crate) fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.strip_prefix(keyword)
        .is_some_and(|rest| rest.starts_with(' ') || rest.starts_with('('))
}

/// Byte offset just past the parenthesis closing the one at `open`.
///
/// Returns the text length when the parentheses never balance.
pub(crate) fn condition_end(text: &str, open: usize) -> usize {
    let mut depth = 0usize;
    for (offset, ch) in text[open..].char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return open + offset + 1;
                }
            }
            _ => {}
        }
    }
    text.len()
}
