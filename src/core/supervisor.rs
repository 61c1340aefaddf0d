//! # Process supervisor: one blocking attendant per launched worker.
//!
//! A [`ProcessSupervisor`] owns exactly one worker invocation from spawn to
//! reaped exit status. The body is fully blocking and runs on the blocking
//! thread pool: the `waitpid` call parks the thread for the worker's entire
//! lifetime, which is exactly the cheap, obviously-correct shape for "wait for
//! this one child".
//!
//! ```text
//! spawn ──► register pipes ──► waitpid ··· ──► classify ──► unregister ──► finish
//! ```
//!
//! ## Rules
//! - A spawn failure is **recoverable**: the slot finishes with a `Fail`
//!   outcome and the active policy's error backoff absorbs it.
//! - A `waitpid` failure is **fatal**: the child's fate is unknown, so the
//!   supervisor raises it on the shared fatal cell and the whole run aborts.
//! - Workers run in their own process group, so terminal-generated signals
//!   (^C) reach the dispatcher alone and shutdown stays orderly.
//! - Stop/continue job-control transitions are logged and waited through; the
//!   worker still counts as running.

use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::core::dispatcher::FatalCell;
use crate::core::slot::{Outcome, SlotPool};
use crate::error::RuntimeError;
use crate::logmux::LogMultiplexer;

/// Attendant for a single worker invocation in one slot.
pub(crate) struct ProcessSupervisor {
    cfg: Arc<DispatchConfig>,
    pool: Arc<SlotPool>,
    mux: Arc<LogMultiplexer>,
    fatal: FatalCell,
    index: usize,
}

impl ProcessSupervisor {
    pub(crate) fn new(
        cfg: Arc<DispatchConfig>,
        pool: Arc<SlotPool>,
        mux: Arc<LogMultiplexer>,
        fatal: FatalCell,
        index: usize,
    ) -> Self {
        Self {
            cfg,
            pool,
            mux,
            fatal,
            index,
        }
    }

    /// Runs the worker to completion. Blocking; call via `spawn_blocking`.
    pub(crate) fn run(self) {
        debug!(slot = self.index, command = %self.cfg.command.display(), "worker starting");

        let piped = self.cfg.log_stdout.is_some();
        let mut child = match self.command(piped).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    slot = self.index,
                    command = %self.cfg.command.display(),
                    %err,
                    "could not spawn worker"
                );
                self.pool.slot(self.index).finish(Outcome::Fail);
                return;
            }
        };

        let pid = Pid::from_raw(child.id() as i32);
        self.pool.slot(self.index).set_running(pid);

        let source_id = if piped {
            self.register_pipes(child.stdout.take(), child.stderr.take())
        } else {
            None
        };

        let Some(outcome) = self.wait(pid) else {
            // Fatal already raised; leave the slot as-is, the run is over.
            return;
        };

        if let Some(id) = source_id {
            if let Err(err) = self.mux.remove_source(id) {
                warn!(slot = self.index, %err, "could not unregister worker output");
            }
        }

        self.pool.slot(self.index).finish(outcome);
        debug!(slot = self.index, ?outcome, "worker finished");
    }

    fn command(&self, piped: bool) -> Command {
        let mut cmd = Command::new(&self.cfg.command);
        cmd.args(&self.cfg.args);
        if self.cfg.append_worker_id {
            cmd.arg(format!("--tid={}", self.index));
        }
        // Own process group: a ^C at the dispatcher's terminal must not fan
        // out to the workers.
        cmd.process_group(0);
        if piped {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        cmd
    }

    fn register_pipes(
        &self,
        stdout: Option<std::process::ChildStdout>,
        stderr: Option<std::process::ChildStderr>,
    ) -> Option<u32> {
        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            warn!(slot = self.index, "worker pipes missing, output will be dropped");
            return None;
        };
        match self
            .mux
            .append_source(OwnedFd::from(stdout), OwnedFd::from(stderr))
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(slot = self.index, %err, "could not register worker output");
                None
            }
        }
    }

    /// Reaps the child, waiting through job-control stops. `None` means the
    /// wait itself failed and a fatal error was raised.
    fn wait(&self, pid: Pid) -> Option<Outcome> {
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        loop {
            match waitpid(pid, Some(flags)) {
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(slot = self.index, pid = pid.as_raw(), code, "worker exited");
                    return Some(Outcome::from_exit_code(code));
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    info!(
                        slot = self.index,
                        pid = pid.as_raw(),
                        signal = %sig,
                        "worker was terminated by a signal"
                    );
                    return Some(Outcome::Fail);
                }
                Ok(WaitStatus::Stopped(_, sig)) => {
                    debug!(slot = self.index, pid = pid.as_raw(), signal = %sig, "worker stopped");
                }
                Ok(WaitStatus::Continued(_)) => {
                    debug!(slot = self.index, pid = pid.as_raw(), "worker continued");
                }
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(slot = self.index, pid = pid.as_raw(), %errno, "waitpid failed");
                    self.fatal.raise(RuntimeError::WaitFailed {
                        slot: self.index,
                        errno,
                    });
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slot::SlotState;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell(script: &str) -> DispatchConfig {
        DispatchConfig {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into(), "worker".into()],
            workers: 2,
            ..DispatchConfig::default()
        }
    }

    fn supervise(cfg: DispatchConfig, mux: Arc<LogMultiplexer>, index: usize) -> Arc<SlotPool> {
        let cfg = Arc::new(cfg);
        let pool = Arc::new(SlotPool::new(cfg.workers));
        pool.slot(index).begin_start(std::time::Instant::now());
        ProcessSupervisor::new(cfg, Arc::clone(&pool), mux, FatalCell::new(), index).run();
        pool
    }

    #[test]
    fn test_exit_zero_finishes_ok() {
        let pool = supervise(shell("exit 0"), Arc::new(LogMultiplexer::new()), 0);
        assert_eq!(pool.slot(0).state(), SlotState::Done(Outcome::Ok));
    }

    #[test]
    fn test_exit_sixty_four_finishes_ok_more() {
        let pool = supervise(shell("exit 64"), Arc::new(LogMultiplexer::new()), 0);
        assert_eq!(pool.slot(0).state(), SlotState::Done(Outcome::OkMore));
    }

    #[test]
    fn test_nonzero_exit_finishes_fail() {
        let pool = supervise(shell("exit 3"), Arc::new(LogMultiplexer::new()), 0);
        assert_eq!(pool.slot(0).state(), SlotState::Done(Outcome::Fail));
    }

    #[test]
    fn test_spawn_failure_is_a_recoverable_fail() {
        let cfg = DispatchConfig {
            command: PathBuf::from("/nonexistent/definitely-not-a-command"),
            workers: 1,
            ..DispatchConfig::default()
        };
        let pool = supervise(cfg, Arc::new(LogMultiplexer::new()), 0);
        assert_eq!(pool.slot(0).state(), SlotState::Done(Outcome::Fail));
    }

    #[test]
    fn test_worker_id_argument_is_appended() {
        // $1 is the first argument after the "worker" argv[0] placeholder.
        let mut cfg = shell(r#"[ "$1" = "--tid=1" ]"#);
        cfg.append_worker_id = true;
        let pool = supervise(cfg, Arc::new(LogMultiplexer::new()), 1);
        assert_eq!(pool.slot(1).state(), SlotState::Done(Outcome::Ok));
    }

    #[test]
    fn test_worker_output_reaches_the_log_sink() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("workers.log");

        let mux = Arc::new(LogMultiplexer::new());
        mux.initialize(&path, &path).expect("initialize");

        let mut cfg = shell("echo out; echo err 1>&2");
        cfg.log_stdout = Some(path.clone());
        supervise(cfg, Arc::clone(&mux), 0);

        // The source was mothballed on exit; the next flush performs its
        // final drain.
        mux.flush().expect("flush");
        let logged = std::fs::read_to_string(&path).expect("read log");
        assert!(logged.contains("out\n"), "stdout missing from {logged:?}");
        assert!(logged.contains("err\n"), "stderr missing from {logged:?}");
    }
}
