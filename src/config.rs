//! # Dispatch run configuration.
//!
//! Provides [`DispatchConfig`], the immutable-after-construction settings value
//! consumed by [`Dispatcher`](crate::Dispatcher). The embedding binary (CLI
//! parsing, daemonization, validation) builds one of these and hands it over;
//! the core never mutates it.
//!
//! ## Sentinel values
//! - `run_time_warn = 0s` → duration warnings disabled
//! - `run_time_max = 0s` → hard run-time limit disabled
//! - `run_once = 0` → repeat forever (daemon-style loop)
//! - `log_stderr = None` → stderr shares the stdout log path
//!
//! Prefer the helper accessors (`run_time_warn()`, `run_time_max()`,
//! `stderr_log()`) over sprinkling zero-checks across the codebase.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which scheduling policy drives the slot pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    /// Every slot schedules itself: idle slots launch unconditionally and
    /// back off individually after each outcome.
    #[default]
    Independent,
    /// All slots share one growing/shrinking wave and one global backoff gate.
    Dependent,
    /// A new worker is launched every `sleep` seconds regardless of how many
    /// are already running.
    FixedInterval,
}

/// How long the fixed-interval policy waits for a free slot before it
/// terminates the longest-running worker to make room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MaxWait {
    /// Wait forever; never terminate a worker to free a slot.
    #[default]
    Indefinite,
    /// Terminate the longest-running worker as soon as a launch is due and no
    /// slot is free.
    Immediate,
    /// Wait up to the given duration, then terminate the longest-running
    /// worker.
    After(Duration),
}

/// Immutable configuration for one dispatch run.
///
/// All fields are public: the external collaborator that parses and validates
/// operator input fills them in directly. [`Default`] carries the stock
/// values; override what you need.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    /// Program to execute in every worker slot.
    pub command: PathBuf,

    /// Arguments passed to every invocation, in order.
    pub args: Vec<String>,

    /// Number of worker slots (concurrency bound).
    pub workers: usize,

    /// Scheduling policy selector.
    pub policy: PolicyKind,

    /// Backoff after a successful run (`Outcome::Ok`), and the launch
    /// interval under the fixed-interval policy.
    pub sleep: Duration,

    /// Backoff after a failed run (`Outcome::Fail`).
    pub sleep_on_error: Duration,

    /// Warn once when a worker has been running longer than this.
    /// `Duration::ZERO` disables the warning.
    pub run_time_warn: Duration,

    /// Request termination of a worker running longer than this.
    /// `Duration::ZERO` disables the limit.
    pub run_time_max: Duration,

    /// Grace period between SIGTERM and SIGKILL escalation.
    pub termination_timeout: Duration,

    /// Fixed-interval only: what to do when a launch is due but every slot is
    /// occupied.
    pub max_launch_wait: MaxWait,

    /// Append `--tid=<slot index>` to each invocation's arguments.
    pub append_worker_id: bool,

    /// Number of extra scheduling ticks to run when not looping forever.
    /// `0` means run as a long-lived loop; `n > 0` runs `n` ticks and then
    /// drains (the dispatch loop decrements this as a countdown).
    pub run_once: u32,

    /// Log file for the stdout of all workers. `None` disables the log
    /// multiplexer entirely: workers inherit the dispatcher's own streams.
    pub log_stdout: Option<PathBuf>,

    /// Log file for the stderr of all workers. `None` reuses `log_stdout`.
    pub log_stderr: Option<PathBuf>,
}

impl DispatchConfig {
    /// Returns the run-time warning threshold, or `None` when disabled.
    #[inline]
    pub fn run_time_warn(&self) -> Option<Duration> {
        if self.run_time_warn == Duration::ZERO {
            None
        } else {
            Some(self.run_time_warn)
        }
    }

    /// Returns the hard run-time limit, or `None` when disabled.
    #[inline]
    pub fn run_time_max(&self) -> Option<Duration> {
        if self.run_time_max == Duration::ZERO {
            None
        } else {
            Some(self.run_time_max)
        }
    }

    /// Returns the effective stderr log path: the configured one, falling
    /// back to the stdout path.
    #[inline]
    pub fn stderr_log(&self) -> Option<&Path> {
        self.log_stderr.as_deref().or(self.log_stdout.as_deref())
    }
}

impl Default for DispatchConfig {
    /// Default configuration:
    ///
    /// - `workers = 1`
    /// - `policy = PolicyKind::Independent`
    /// - `sleep = 30s`, `sleep_on_error = 300s`
    /// - `run_time_warn = 3600s`, `run_time_max = 0s` (off)
    /// - `termination_timeout = 30s`
    /// - `max_launch_wait = MaxWait::Indefinite`
    /// - no `--tid`, no run-once countdown, no log files
    fn default() -> Self {
        Self {
            command: PathBuf::new(),
            args: Vec::new(),
            workers: 1,
            policy: PolicyKind::default(),
            sleep: Duration::from_secs(30),
            sleep_on_error: Duration::from_secs(300),
            run_time_warn: Duration::from_secs(3600),
            run_time_max: Duration::ZERO,
            termination_timeout: Duration::from_secs(30),
            max_launch_wait: MaxWait::default(),
            append_worker_id: false,
            run_once: 0,
            log_stdout: None,
            log_stderr: None,
        }
    }
}
