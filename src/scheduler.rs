//! Bounded worker pool with per-unit timeouts and a global budget.
//!
//! Each unit runs on a helper thread while its worker waits on a channel with
//! the task timeout. An expired unit has its [`CancelToken`] tripped, which
//! kills its subprocesses, and is reported as timed out; the worker moves on.
//! All threads are scoped, so the pool returns only after every helper has
//! finished draining.
use crate::exec::CancelToken;
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::Scope;
use std::time::{Duration, Instant};

/// Set by SIGINT/SIGTERM; stops new submissions.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to [`SHUTDOWN`].
pub fn install_signal_handlers() {
    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    TimedOut,
    /// The unit panicked.
    Failed(String),
    /// Never started: budget exhausted or shutdown requested.
    Skipped,
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions<'a> {
    pub workers: usize,
    pub task_timeout: Duration,
    pub budget: Option<Duration>,
    pub shutdown: &'a AtomicBool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerCounters {
    pub completed: usize,
    pub timed_out: usize,
    pub failed: usize,
    pub skipped: usize,
    pub budget_exhausted: bool,
    pub interrupted: bool,
}

#[derive(Debug)]
pub struct SchedulerReport<T> {
    /// One outcome per input item, in input order.
    pub outcomes: Vec<TaskOutcome<T>>,
    pub counters: SchedulerCounters,
}

enum StopReason {
    Budget,
    Shutdown,
}

fn stop_reason(options: &SchedulerOptions<'_>, start: Instant) -> Option<StopReason> {
    if options.shutdown.load(Ordering::SeqCst) {
        return Some(StopReason::Shutdown);
    }
    match options.budget {
        Some(budget) if start.elapsed() >= budget => Some(StopReason::Budget),
        _ => None,
    }
}

/// Run `work` over `items` on `options.workers` threads.
pub fn run_units<I, T, F>(items: &[I], options: SchedulerOptions<'_>, work: F) -> SchedulerReport<T>
where
    I: Sync,
    T: Send,
    F: Fn(&I, &CancelToken) -> T + Sync,
{
    let start = Instant::now();
    let workers = options.workers.max(1);
    let (task_tx, task_rx) = bounded::<usize>(workers);
    let (result_tx, result_rx) = unbounded::<(usize, TaskOutcome<T>)>();
    let work = &work;
    let mut counters = SchedulerCounters::default();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                for index in task_rx.iter() {
                    if stop_reason(&options, start).is_some() {
                        continue;
                    }
                    let outcome = run_unit(scope, &items[index], options.task_timeout, work);
                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);

        for index in 0..items.len() {
            match stop_reason(&options, start) {
                Some(StopReason::Budget) => {
                    tracing::warn!(submitted = index, total = items.len(), "time budget exhausted, no new patches start");
                    counters.budget_exhausted = true;
                    break;
                }
                Some(StopReason::Shutdown) => {
                    tracing::warn!(submitted = index, total = items.len(), "shutdown requested, no new patches start");
                    counters.interrupted = true;
                    break;
                }
                None => {}
            }
            if task_tx.send(index).is_err() {
                break;
            }
        }
        drop(task_tx);
    });
    drop(result_tx);

    let mut outcomes: Vec<TaskOutcome<T>> = (0..items.len()).map(|_| TaskOutcome::Skipped).collect();
    for (index, outcome) in result_rx.iter() {
        outcomes[index] = outcome;
    }
    for outcome in &outcomes {
        match outcome {
            TaskOutcome::Completed(_) => counters.completed += 1,
            TaskOutcome::TimedOut => counters.timed_out += 1,
            TaskOutcome::Failed(_) => counters.failed += 1,
            TaskOutcome::Skipped => counters.skipped += 1,
        }
    }
    SchedulerReport { outcomes, counters }
}

fn run_unit<'scope, 'env, I, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    item: &'env I,
    timeout: Duration,
    work: &'env F,
) -> TaskOutcome<T>
where
    I: Sync,
    T: Send + 'scope,
    F: Fn(&I, &CancelToken) -> T + Sync,
{
    let cancel = CancelToken::new();
    let (tx, rx) = bounded(1);
    let helper_cancel = cancel.clone();
    scope.spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(|| work(item, &helper_cancel)));
        let _ = tx.send(result);
    });
    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => TaskOutcome::Completed(value),
        Ok(Err(panic)) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unit panicked".to_string());
            tracing::warn!(error = %message, "unit panicked");
            TaskOutcome::Failed(message)
        }
        Err(RecvTimeoutError::Timeout) => {
            cancel.cancel();
            tracing::warn!(timeout_s = timeout.as_secs(), "unit timed out, cancelling");
            TaskOutcome::TimedOut
        }
        Err(RecvTimeoutError::Disconnected) => TaskOutcome::Failed("unit exited without a result".to_string()),
    }
}
