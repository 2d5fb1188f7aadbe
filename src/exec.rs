//! Subprocess execution with timeouts and cooperative cancellation.
//!
//! Every external tool the engine drives (oracles, debugger, rewriter, build
//! scripts) goes through [`run_command`] so that a tripped [`CancelToken`] or an
//! expired deadline kills the whole process group, not just the direct child.
use crate::util::{shell_quote, truncate_bytes};
use anyhow::{Context, Result};
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag that aborts in-flight subprocesses of one unit of work.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed_ms: u128,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, lossily decoded.
    pub fn combined_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }

    pub fn stderr_excerpt(&self) -> String {
        truncate_bytes(&self.stderr, 2048)
    }
}

pub fn format_command_line(cmd: &Command) -> String {
    let mut parts = vec![shell_quote(&cmd.get_program().to_string_lossy())];
    parts.extend(cmd.get_args().map(|arg| shell_quote(&arg.to_string_lossy())));
    parts.join(" ")
}

/// Command that runs a user script: directly when executable, else via `sh`.
pub fn script_command(path: &Path) -> Command {
    let executable = std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        Command::new(path)
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg(path);
        cmd
    }
}

/// Run `cmd` to completion, killing it on timeout or cancellation.
///
/// Stdout and stderr are always captured. The child is placed in its own
/// process group so grandchildren (for example a debugger spawned by an oracle
/// script) are reaped together with it.
pub fn run_command(
    cmd: &mut Command,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<ProcessOutput> {
    let command_line = format_command_line(cmd);
    tracing::debug!(command = %command_line, timeout_s = ?timeout.map(|t| t.as_secs()), "spawn");
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {command_line}"))?;
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child
            .try_wait()
            .with_context(|| format!("check status of {command_line}"))?
        {
            break Some(status);
        }
        if cancel.is_cancelled() {
            cancelled = true;
            kill_group(&mut child);
            break None;
        }
        if timeout.is_some_and(|limit| start.elapsed() > limit) {
            timed_out = true;
            kill_group(&mut child);
            break None;
        }
        std::thread::sleep(POLL_INTERVAL);
    };
    let status = match status {
        Some(status) => status,
        None => child
            .wait()
            .with_context(|| format!("reap {command_line}"))?,
    };

    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();
    let elapsed_ms = start.elapsed().as_millis();
    if timed_out {
        tracing::warn!(command = %command_line, elapsed_ms, "command timed out");
    }
    tracing::debug!(
        command = %command_line,
        exit_code = ?status.code(),
        elapsed_ms,
        "command finished"
    );
    Ok(ProcessOutput {
        exit_code: if timed_out || cancelled { None } else { status.code() },
        stdout,
        stderr,
        timed_out,
        cancelled,
        elapsed_ms,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill_group(child: &mut std::process::Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        let _ = child.kill();
        return;
    };
    // SAFETY: signalling a process group we created; a stale pgid only yields ESRCH.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
    let _ = child.kill();
}
