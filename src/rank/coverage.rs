//! Edge coverage collection through `e9afl` instrumentation and `afl-showmap`.
use crate::exec::{run_command, CancelToken};
use crate::util::{ensure_dir, shell_quote};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Hit counts keyed by edge id.
pub type CoverageMap = BTreeMap<String, u64>;

/// Instrument `binary` into `out` with `e9afl`.
pub fn instrument(binary: &Path, out: &Path, timeout: Duration, cancel: &CancelToken) -> Result<PathBuf> {
    if let Some(parent) = out.parent() {
        ensure_dir(parent)?;
    }
    let mut cmd = Command::new("e9afl");
    cmd.arg(binary).arg("-o").arg(out);
    let output = run_command(&mut cmd, Some(timeout), cancel).context("run e9afl")?;
    if !output.success() || !out.is_file() {
        return Err(anyhow!(
            "e9afl failed for {}: {}",
            binary.display(),
            output.stderr_excerpt()
        ));
    }
    Ok(out.to_path_buf())
}

/// Like [`instrument`], logging failures instead of returning them.
pub fn instrument_or_warn(binary: &Path, out: &Path, timeout: Duration) -> Option<PathBuf> {
    match instrument(binary, out, timeout, &CancelToken::new()) {
        Ok(path) => Some(path),
        Err(err) => {
            tracing::warn!(binary = %binary.display(), error = %err, "coverage instrumentation unavailable");
            None
        }
    }
}

/// `afl-showmap` invocation recording the map of `inner` into `map_out`.
pub fn showmap_command_line(map_out: &Path, inner: &str) -> String {
    format!(
        "afl-showmap -q -o {} -- {inner}",
        shell_quote(&map_out.to_string_lossy())
    )
}

/// Parse `edge:count` lines; malformed lines are skipped.
pub fn parse_coverage(text: &str) -> CoverageMap {
    text.lines()
        .filter_map(|line| {
            let (edge, count) = line.trim().split_once(':')?;
            Some((edge.trim().to_string(), count.trim().parse().ok()?))
        })
        .collect()
}

pub fn load_coverage(path: &Path) -> Result<CoverageMap> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(parse_coverage(&text))
}
