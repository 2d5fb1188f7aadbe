//! Debugger script assembly.
//!
//! A patch script stops at every fragment breakpoint, performs the fragment's
//! commands, and resumes at its continuation. Snapshot variants add core dumps
//! around the patched region so runs can be compared by their effect.
use crate::exec::{run_command, CancelToken};
use crate::interpreter::{compile_fragment, BreakpointBlock, CompiledFragment, DebuggerCommand, INIT_FLAG};
use crate::patch::{BreakPoint, Patch};
use crate::util::{make_executable, shell_quote};
use anyhow::{Context, Result};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

/// Core dumps added to a patch script.
#[derive(Debug, Clone, Copy)]
pub enum SnapshotHooks<'a> {
    None,
    /// Dump before the patched region runs and after it completes, then quit.
    Signature { before: &'a Path, after: &'a Path },
    /// Dump once when execution reaches the continuation, then keep running.
    Location { dump: &'a Path },
}

pub fn compile_patch(patch: &Patch) -> Vec<CompiledFragment> {
    patch
        .fragments
        .iter()
        .map(|(bp, fragment)| compile_fragment(bp, fragment))
        .collect()
}

fn prelude(out: &mut String, disable_randomization: bool, fragments: &[CompiledFragment]) {
    out.push_str("set pagination off\n");
    out.push_str("set confirm off\n");
    out.push_str("set breakpoint pending on\n");
    let randomization = if disable_randomization { "on" } else { "off" };
    out.push_str(&format!("set disable-randomization {randomization}\n"));
    if fragments.iter().any(|fragment| fragment.is_loop) {
        out.push_str(&format!("set {INIT_FLAG} = 1\n"));
    }
}

/// Render the full script for a compiled patch.
pub fn render_script(fragments: &[CompiledFragment], hooks: SnapshotHooks<'_>) -> String {
    let mut out = String::new();
    let signature_run = matches!(hooks, SnapshotHooks::Signature { .. });
    prelude(&mut out, signature_run, fragments);

    for (index, fragment) in fragments.iter().enumerate() {
        for (block_index, block) in fragment.blocks.iter().enumerate() {
            if let (SnapshotHooks::Signature { before, .. }, 0, 0) = (hooks, index, block_index) {
                let mut hooked = block.clone();
                hooked
                    .commands
                    .insert(0, DebuggerCommand::GenerateCore(before.to_path_buf()));
                hooked.render(&mut out);
            } else {
                block.render(&mut out);
            }
        }
    }

    let mut continuations: Vec<&BreakPoint> =
        fragments.iter().map(|fragment| &fragment.jump_target).collect();
    continuations.sort();
    continuations.dedup();
    for target in continuations {
        let hook = match hooks {
            SnapshotHooks::None => continue,
            SnapshotHooks::Signature { after, .. } => {
                let mut block = BreakpointBlock::temporary(target.clone());
                block.commands.push(DebuggerCommand::GenerateCore(after.to_path_buf()));
                block.commands.push(DebuggerCommand::Quit);
                block
            }
            SnapshotHooks::Location { dump } => {
                let mut block = BreakpointBlock::temporary(target.clone());
                block.commands.push(DebuggerCommand::GenerateCore(dump.to_path_buf()));
                block.commands.push(DebuggerCommand::Continue);
                block
            }
        };
        hook.render(&mut out);
    }
    out.push_str("run\n");
    out
}

/// Script that logs every source line executed after the fragment locations.
///
/// With `apply_patch` false the fragments only mark where tracing starts, so
/// the same script shape traces the unpatched program.
pub fn render_trace_script(fragments: &[CompiledFragment], apply_patch: bool, log: &Path) -> String {
    let mut out = String::new();
    out.push_str(&format!("set logging file {}\n", log.display()));
    out.push_str("set logging overwrite on\n");
    out.push_str("set logging redirect on\n");
    out.push_str("set logging enabled on\n");
    prelude(&mut out, true, fragments);
    let start_points: Vec<BreakPoint> = if apply_patch {
        for fragment in fragments {
            for block in &fragment.blocks {
                block.render(&mut out);
            }
        }
        fragments.iter().map(|f| f.jump_target.clone()).collect()
    } else {
        fragments.iter().map(|f| f.breakpoint.clone()).collect()
    };
    for point in start_points {
        let mut block = BreakpointBlock::temporary(point);
        block.commands.extend([
            DebuggerCommand::Raw("while 1".to_string()),
            DebuggerCommand::Raw("frame".to_string()),
            DebuggerCommand::Raw("step".to_string()),
            DebuggerCommand::End,
        ]);
        block.render(&mut out);
    }
    out.push_str("run\n");
    out
}

/// Debugger invocation that runs `binary` with `script`; arguments follow.
pub fn debugger_command_line(script: &Path, binary: &Path) -> String {
    format!(
        "gdb -return-child-result -batch-silent -x {} --args {}",
        shell_quote(&script.to_string_lossy()),
        shell_quote(&binary.to_string_lossy())
    )
}

/// `sh` wrapper that execs `command_line` with the wrapper's arguments appended.
pub fn render_wrapper(command_line: &str) -> String {
    format!("#!/bin/sh\nexec {command_line} \"$@\"\n")
}

pub fn write_wrapper(path: &Path, command_line: &str) -> Result<()> {
    fs::write(path, render_wrapper(command_line))
        .with_context(|| format!("write {}", path.display()))?;
    make_executable(path)
}

/// Executable wrapper that runs `binary` under the debugger with `script`.
pub fn write_frontend(path: &Path, script: &Path, binary: &Path) -> Result<()> {
    write_wrapper(path, &debugger_command_line(script, binary))
}

/// Lines in debugger output that mean the script could not be applied.
pub fn has_symbol_errors(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.contains("No symbol") || line.contains("No source"))
}

pub fn parse_info_line(output: &str) -> Option<u64> {
    let address = Regex::new(r"starts at address (0x[0-9a-fA-F]+)")
        .expect("regex for info line address");
    let hex = address.captures(output)?.get(1)?.as_str();
    u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok()
}

/// Instruction address of a source location in `binary`.
pub fn resolve_address(
    binary: &Path,
    location: &BreakPoint,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<Option<u64>> {
    let mut cmd = Command::new("gdb");
    cmd.arg("-batch")
        .arg("-ex")
        .arg(format!("info line {location}"))
        .arg(binary);
    let output = run_command(&mut cmd, Some(timeout), cancel).context("run gdb info line")?;
    Ok(parse_info_line(&output.combined_text()))
}

/// Source locations (`file:line`) in a trace log, in execution order.
pub fn parse_trace_log(text: &str) -> Vec<String> {
    let location = Regex::new(r"\bat ([^\s:]+):(\d+)").expect("regex for frame locations");
    text.lines()
        .filter_map(|line| {
            let caps = location.captures(line)?;
            Some(format!("{}:{}", caps.get(1)?.as_str(), caps.get(2)?.as_str()))
        })
        .collect()
}

/// Paths of the per-patch debugger artifacts inside the scripts directory.
pub fn script_paths(scripts_dir: &Path, stem: &str) -> (PathBuf, PathBuf) {
    (
        scripts_dir.join(format!("{stem}.gdb")),
        scripts_dir.join(format!("{stem}.frontend.sh")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Fragment;
    use std::collections::BTreeMap;

    fn assign_patch() -> Patch {
        let mut fragments = BTreeMap::new();
        fragments.insert(
            BreakPoint::new("f.c", 10),
            Fragment {
                inserted: vec!["x = 5".to_string()],
                ..Fragment::default()
            },
        );
        Patch {
            id: "1.patch".to_string(),
            tool: None,
            path: PathBuf::from("1.patch"),
            source_file: "f.c".to_string(),
            fragments,
            requires_recompilation: false,
            partition: None,
        }
    }

    #[test]
    fn plain_script_runs_patch_block() {
        let script = render_script(&compile_patch(&assign_patch()), SnapshotHooks::None);
        assert_eq!(
            script,
            "set pagination off\nset confirm off\nset breakpoint pending on\n\
set disable-randomization off\n\
break f.c:10\ncommands\nsilent\nset var x=5\njump f.c:11\nend\nrun\n"
        );
    }

    #[test]
    fn signature_script_dumps_around_region() {
        let before = Path::new("/snap/before.core");
        let after = Path::new("/snap/after.core");
        let script = render_script(
            &compile_patch(&assign_patch()),
            SnapshotHooks::Signature { before, after },
        );
        assert!(script.contains("set disable-randomization on\n"));
        assert!(script.contains(
            "break f.c:10\ncommands\nsilent\ngenerate-core-file /snap/before.core\nset var x=5\n"
        ));
        assert!(script.contains(
            "tbreak f.c:11\ncommands\nsilent\ngenerate-core-file /snap/after.core\nquit\nend\n"
        ));
        assert!(script.ends_with("run\n"));
    }

    #[test]
    fn location_hook_continues_after_dump() {
        let dump = Path::new("/snap/location.core");
        let script = render_script(&compile_patch(&assign_patch()), SnapshotHooks::Location { dump });
        assert!(script.contains(
            "tbreak f.c:11\ncommands\nsilent\ngenerate-core-file /snap/location.core\ncontinue\nend\n"
        ));
    }

    #[test]
    fn frontend_passes_arguments_through() {
        let text = render_wrapper(&debugger_command_line(
            Path::new("/tmp/s.gdb"),
            Path::new("/opt/my prog"),
        ));
        assert_eq!(
            text,
            "#!/bin/sh\nexec gdb -return-child-result -batch-silent -x /tmp/s.gdb --args '/opt/my prog' \"$@\"\n"
        );
    }

    #[test]
    fn symbol_errors_are_detected() {
        assert!(has_symbol_errors("ok\nNo symbol \"y\" in current context.\n"));
        assert!(has_symbol_errors("No source file named g.c.\n"));
        assert!(!has_symbol_errors("all tests passed\n"));
    }

    #[test]
    fn info_line_address_is_parsed() {
        let output = "Line 10 of \"f.c\" starts at address 0x1149 <main+4> and ends at 0x1151 <main+12>.\n";
        assert_eq!(parse_info_line(output), Some(0x1149));
        assert_eq!(parse_info_line("Line 10 of \"f.c\" is at address 0x1 but contains no code."), None);
    }

    #[test]
    fn trace_log_yields_locations() {
        let log = "#0  main () at f.c:11\n11\t  y = x;\n#0  helper (v=1) at lib/g.c:4\n";
        assert_eq!(parse_trace_log(log), vec!["f.c:11".to_string(), "lib/g.c:4".to_string()]);
    }
}
