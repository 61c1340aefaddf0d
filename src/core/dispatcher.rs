//! # Dispatcher: the 200ms control loop that drives everything.
//!
//! One [`Dispatcher`] owns a dispatch run end to end:
//!
//! ```text
//! init logs ──► install signals ──► ┌────────── tick ──────────┐ ──► drain ──► close logs
//!                                   │ duration checks           │
//!                                   │ policy decisions / spawns │
//!                                   │ pending-signal handling   │
//!                                   │ log flush                 │
//!                                   └──────── sleep 200ms ──────┘
//! ```
//!
//! ## Rules
//! - All scheduling happens on the control task; supervisors only write their
//!   own slot's pid and outcome. No decision is ever made off-tick.
//! - Signals are consumed at most once per tick, after the scheduling pass.
//! - A fatal error from any supervisor ends the loop on the next tick and is
//!   returned from [`Dispatcher::run`]; recoverable worker failures never
//!   surface here.
//! - Log trouble after startup degrades: the multiplexer is disabled and the
//!   run continues. Only failure to open the sinks at startup aborts.
//! - The drain phase keeps enforcing duration limits (SIGTERM→SIGKILL
//!   escalation included), so shutdown cannot hang on a stuck worker forever
//!   when a run-time limit is configured. Repeated termination signals
//!   escalate: the first re-terminates stragglers, the second abandons the
//!   drain.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatchConfig;
use crate::core::signals::{PendingSignal, SignalCoordinator};
use crate::core::slot::{SlotPool, SlotState};
use crate::core::supervisor::ProcessSupervisor;
use crate::error::RuntimeError;
use crate::logmux::LogMultiplexer;
use crate::policies;

/// Scheduling tick interval.
const TICK: Duration = Duration::from_millis(200);

/// Shared one-shot fatal-error cell.
///
/// The first raised error wins; later ones are logged and dropped. Raising
/// also trips the cancellation token so async waiters can react without
/// polling the mutex.
#[derive(Clone, Debug, Default)]
pub(crate) struct FatalCell {
    cancel: CancellationToken,
    error: Arc<Mutex<Option<RuntimeError>>>,
}

impl FatalCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn raise(&self, err: RuntimeError) {
        let mut slot = self
            .error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        } else {
            error!(%err, "fatal error raised while another is pending");
        }
        drop(slot);
        self.cancel.cancel();
    }

    pub(crate) fn is_raised(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn take(&self) -> Option<RuntimeError> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

/// Runs one dispatch to completion with a fresh [`Dispatcher`].
///
/// `daemon` selects daemon mode (sleeping slots wake up and run again) over
/// application mode (the run ends once the workload is exhausted).
pub async fn run(cfg: DispatchConfig, daemon: bool) -> Result<(), RuntimeError> {
    Dispatcher::new(cfg).run(daemon).await
}

/// Owner of the slot pool, the log multiplexer and the control loop.
pub struct Dispatcher {
    cfg: Arc<DispatchConfig>,
    pool: Arc<SlotPool>,
    mux: Arc<LogMultiplexer>,
    signals: SignalCoordinator,
    fatal: FatalCell,
}

impl Dispatcher {
    /// Creates a dispatcher with an idle slot pool sized from the
    /// configuration.
    pub fn new(cfg: DispatchConfig) -> Self {
        let pool = Arc::new(SlotPool::new(cfg.workers));
        Self {
            cfg: Arc::new(cfg),
            pool,
            mux: Arc::new(LogMultiplexer::new()),
            signals: SignalCoordinator::new(),
            fatal: FatalCell::new(),
        }
    }

    /// The signal coordinator feeding this dispatcher, for embedding binaries
    /// that want to inject [`PendingSignal`]s programmatically.
    pub fn signals(&self) -> &SignalCoordinator {
        &self.signals
    }

    /// Runs the dispatch loop until shutdown, then drains running workers.
    pub async fn run(&self, daemon: bool) -> Result<(), RuntimeError> {
        info!(
            workers = self.cfg.workers,
            policy = ?self.cfg.policy,
            daemon,
            "starting dispatch"
        );

        if let Some(path_stdout) = self.cfg.log_stdout.as_deref() {
            let path_stderr = self.cfg.stderr_log().unwrap_or(path_stdout);
            self.mux.initialize(path_stdout, path_stderr)?;
        }
        self.signals
            .listen()
            .map_err(RuntimeError::SignalListener)?;

        let mut policy = policies::build(&self.cfg);
        let mut logging_enabled = self.mux.is_initialized();
        let mut running = self.cfg.run_once == 0;
        let mut run_once = self.cfg.run_once;
        let mut terminating = false;

        loop {
            let proceed = running
                || (run_once > 0 && {
                    run_once -= 1;
                    true
                });
            if !proceed || self.fatal.is_raised() {
                break;
            }

            let now = Instant::now();
            policy.pre_tick(&self.pool, now);

            for index in 0..self.pool.len() {
                let mut slot = self.pool.slot(index);
                let action = slot.check(&self.cfg, now);
                slot.enforce(action, &self.cfg, now);

                if policy.decide(&mut slot, daemon, &mut running, now) {
                    slot.begin_start(now);
                    debug!(slot = index, "launching worker");
                    drop(slot);

                    let supervisor = ProcessSupervisor::new(
                        Arc::clone(&self.cfg),
                        Arc::clone(&self.pool),
                        Arc::clone(&self.mux),
                        self.fatal.clone(),
                        index,
                    );
                    task::spawn_blocking(move || supervisor.run());
                }
            }

            match self.signals.take() {
                Some(PendingSignal::Terminate) => {
                    info!("shutdown requested, stopping dispatch");
                    running = false;
                    run_once = 0;
                    terminating = true;
                    self.pool.terminate_all(now);
                }
                Some(PendingSignal::Reload) => self.reload_logs(&mut logging_enabled),
                None => {}
            }

            if let Some(victim) = policy.post_tick(&self.pool, now) {
                self.pool.request_termination(victim, now);
            }

            self.flush_logs(&mut logging_enabled);
            tokio::time::sleep(TICK).await;
        }

        self.drain(terminating, &mut logging_enabled).await;

        if self.mux.is_initialized() {
            if let Err(err) = self.mux.deinitialize() {
                warn!(%err, "could not close log sinks cleanly");
            }
        }

        match self.fatal.take() {
            Some(err) => {
                error!(%err, "dispatch aborted");
                Err(err)
            }
            None => {
                info!("dispatch finished");
                Ok(())
            }
        }
    }

    /// Waits for every attached supervisor to finish, still enforcing
    /// duration limits each tick.
    ///
    /// With `terminating` set, workers that were still mid-spawn when the
    /// shutdown broadcast went out (pid not yet known) get their SIGTERM here
    /// as soon as they reach the running state.
    async fn drain(&self, terminating: bool, logging_enabled: &mut bool) {
        debug!("waiting for workers to finish");
        let mut stop_signals: u32 = 0;

        loop {
            if self.fatal.is_raised() {
                warn!("abandoning worker drain after a fatal error");
                return;
            }

            let now = Instant::now();
            let mut stopped = 0;
            for index in 0..self.pool.len() {
                let mut slot = self.pool.slot(index);
                if terminating
                    && slot.termination_requested_at.is_none()
                    && matches!(slot.state(), SlotState::Running { .. })
                {
                    slot.signal_term(now);
                }
                let action = slot.check(&self.cfg, now);
                slot.enforce(action, &self.cfg, now);
                if slot.is_stopped() {
                    stopped += 1;
                }
            }
            if stopped == self.pool.len() {
                debug!("all workers finished");
                return;
            }

            if self.signals.take() == Some(PendingSignal::Terminate) {
                stop_signals += 1;
                if stop_signals == 1 {
                    info!("repeat shutdown request, re-terminating workers");
                    self.pool.terminate_all(now);
                } else {
                    warn!("second repeat shutdown request, abandoning worker drain");
                    return;
                }
            }

            self.flush_logs(logging_enabled);
            tokio::time::sleep(TICK).await;
        }
    }

    fn reload_logs(&self, logging_enabled: &mut bool) {
        if !self.mux.is_initialized() {
            debug!("reload requested but subprocess logging is not configured");
            return;
        }
        info!("reopening log sinks");
        match self.mux.reinitialize() {
            Ok(()) => *logging_enabled = true,
            Err(err) => {
                error!(%err, "could not reopen log sinks, disabling subprocess logging");
                *logging_enabled = false;
            }
        }
    }

    fn flush_logs(&self, logging_enabled: &mut bool) {
        if !*logging_enabled {
            return;
        }
        if let Err(err) = self.mux.flush() {
            warn!(%err, "log flushing failed, disabling subprocess logging");
            *logging_enabled = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyKind;
    use crate::core::slot::{Outcome, SlotState};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn shell(script: &str) -> DispatchConfig {
        DispatchConfig {
            command: PathBuf::from("/bin/sh"),
            args: vec!["-c".into(), script.into(), "worker".into()],
            ..DispatchConfig::default()
        }
    }

    #[test]
    fn test_fatal_cell_keeps_the_first_error() {
        let fatal = FatalCell::new();
        assert!(!fatal.is_raised());
        assert!(fatal.take().is_none());

        fatal.raise(RuntimeError::WaitFailed {
            slot: 0,
            errno: nix::errno::Errno::ECHILD,
        });
        fatal.raise(RuntimeError::WaitFailed {
            slot: 1,
            errno: nix::errno::Errno::EINVAL,
        });
        assert!(fatal.is_raised());
        assert!(matches!(
            fatal.take(),
            Some(RuntimeError::WaitFailed { slot: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_single_tick_run_executes_the_command_once() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("ran");

        let mut cfg = shell(&format!("echo once >> {}", marker.display()));
        cfg.run_once = 1;

        let dispatcher = Dispatcher::new(cfg);
        dispatcher.run(false).await.expect("run");

        assert_eq!(std::fs::read_to_string(&marker).expect("marker"), "once\n");
        assert_eq!(
            dispatcher.pool.slot(0).state(),
            SlotState::Done(Outcome::Ok)
        );
    }

    #[tokio::test]
    async fn test_application_mode_ends_when_all_workers_sleep() {
        let dir = TempDir::new().expect("tempdir");
        let marker = dir.path().join("ran");

        let mut cfg = shell(&format!("echo x >> {}", marker.display()));
        cfg.workers = 2;
        cfg.policy = PolicyKind::Independent;

        Dispatcher::new(cfg).run(false).await.expect("run");
        let runs = std::fs::read_to_string(&marker).expect("marker");
        assert_eq!(runs.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_terminate_signal_stops_a_long_worker() {
        let started = Instant::now();
        let dispatcher = Dispatcher::new(shell("sleep 30"));

        // Queue the shutdown before the loop starts: tick one launches the
        // worker and consumes the signal, the drain reaps the SIGTERMed child.
        dispatcher.signals().notify(PendingSignal::Terminate);
        dispatcher.run(true).await.expect("run");

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            dispatcher.pool.slot(0).state(),
            SlotState::Done(Outcome::Fail)
        );
    }

    #[tokio::test]
    async fn test_worker_output_is_multiplexed_into_the_log() {
        let dir = TempDir::new().expect("tempdir");
        let log = dir.path().join("workers.log");

        let mut cfg = shell("echo hello from a worker");
        cfg.run_once = 1;
        cfg.log_stdout = Some(log.clone());

        Dispatcher::new(cfg).run(false).await.expect("run");
        let logged = std::fs::read_to_string(&log).expect("read log");
        assert!(logged.contains("hello from a worker"), "got {logged:?}");
    }
}
