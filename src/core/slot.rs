//! # Worker slots: the pool's per-unit state machine.
//!
//! A [`Slot`] is one concurrency unit. It is allocated once at pool creation,
//! reused for every invocation, and only torn down with the pool. The slot
//! cycle is:
//!
//! ```text
//! Idle ──► Starting ──► Running(pid) ──► Done(outcome) ──► Idle
//!   ▲                       │
//!   └── Sleeping(until) ◄───┘ (via policy backoff)
//! ```
//!
//! `Starting` reserves the slot for the instant between "decided to launch"
//! and "child pid known", so two scheduling passes can never double-book it.
//! A termination request is not a state of its own: it is a timestamp layered
//! on `Running`, because the pid stays authoritative for signaling while the
//! worker winds down.
//!
//! ## Sharing
//! Each slot sits behind its own mutex in the [`SlotPool`]. The control task
//! reads and writes scheduling fields; the slot's supervisor thread writes the
//! pid and the terminal outcome. Critical sections are a few field accesses.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::config::DispatchConfig;

/// Classified result of a finished worker, derived from its exit status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Exit code 0: success, no more immediate work.
    Ok,
    /// Exit code 64: success, more work is ready right now.
    OkMore,
    /// Any other exit code, or termination by signal.
    Fail,
}

/// Exit code a worker uses to report "success, more work available".
pub const EXIT_STATUS_OK_MORE: i32 = 64;

impl Outcome {
    /// Classifies a worker exit code.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Outcome::Ok,
            EXIT_STATUS_OK_MORE => Outcome::OkMore,
            _ => Outcome::Fail,
        }
    }
}

/// Current status of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Nothing running; the slot may be given work.
    Idle,
    /// Reserved: launch decided, child pid not yet known.
    Starting,
    /// A worker is running under this pid.
    Running {
        /// Process id of the worker's child process.
        pid: Pid,
    },
    /// Policy backoff: ineligible until the wake deadline passes.
    Sleeping {
        /// Absolute wake deadline.
        until: Instant,
    },
    /// The worker finished; the policy has not reacted to the outcome yet.
    Done(Outcome),
}

/// What the per-tick duration check decided for one slot.
///
/// [`Slot::check`] is pure so it can be tested without sending signals; the
/// dispatcher applies the action via [`Slot::enforce`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotAction {
    /// Nothing to do.
    None,
    /// Run time exceeded the warning threshold; warn once.
    Warn,
    /// Run time exceeded the hard limit; request graceful termination.
    Terminate,
    /// The termination grace period expired; escalate to SIGKILL.
    Kill,
}

/// One concurrency unit of the worker pool.
#[derive(Debug)]
pub struct Slot {
    /// Stable identity, 0..workers.
    pub(crate) index: usize,
    /// Current status.
    pub(crate) state: SlotState,
    /// When the current (or most recent) worker was launched.
    pub(crate) last_started_at: Option<Instant>,
    /// When graceful termination was requested; `None` = not requested.
    pub(crate) termination_requested_at: Option<Instant>,
    /// Whether the run-time warning already fired for this run.
    pub(crate) duration_warned: bool,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            state: SlotState::Idle,
            last_started_at: None,
            termination_requested_at: None,
            duration_warned: false,
        }
    }

    /// Stable slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current state.
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// Reserves the slot for a launch and stamps the start time.
    pub(crate) fn begin_start(&mut self, now: Instant) {
        debug_assert!(
            !matches!(self.state, SlotState::Starting | SlotState::Running { .. }),
            "slot {} double-booked",
            self.index
        );
        self.state = SlotState::Starting;
        self.last_started_at = Some(now);
    }

    /// Records the spawned child's pid. Called only by the owning supervisor.
    pub(crate) fn set_running(&mut self, pid: Pid) {
        self.state = SlotState::Running { pid };
    }

    /// Writes the terminal outcome and clears the per-run transient fields.
    /// Called only by the owning supervisor.
    pub(crate) fn finish(&mut self, outcome: Outcome) {
        self.state = SlotState::Done(outcome);
        self.reset();
    }

    /// Clears per-run fields, readying the slot for its next invocation.
    pub(crate) fn reset(&mut self) {
        self.termination_requested_at = None;
        self.duration_warned = false;
    }

    /// True when no supervisor thread is attached: idle, sleeping, or holding
    /// an unconsumed terminal outcome.
    pub(crate) fn is_stopped(&self) -> bool {
        matches!(
            self.state,
            SlotState::Idle | SlotState::Sleeping { .. } | SlotState::Done(_)
        )
    }

    /// Per-tick duration check for a running slot.
    ///
    /// Precedence, as one chain: a pending termination past its grace period
    /// escalates to SIGKILL; otherwise an exceeded hard limit requests
    /// termination; otherwise an exceeded warning threshold warns, at most
    /// once per run.
    pub(crate) fn check(&self, cfg: &DispatchConfig, now: Instant) -> SlotAction {
        if !matches!(self.state, SlotState::Running { .. }) {
            return SlotAction::None;
        }

        if let Some(requested) = self.termination_requested_at {
            if now >= requested + cfg.termination_timeout {
                return SlotAction::Kill;
            }
            return SlotAction::None;
        }

        let Some(started) = self.last_started_at else {
            return SlotAction::None;
        };
        let run_time = now.saturating_duration_since(started);

        if let Some(max) = cfg.run_time_max() {
            if run_time > max {
                return SlotAction::Terminate;
            }
        }
        if let Some(threshold) = cfg.run_time_warn() {
            if run_time > threshold && !self.duration_warned {
                return SlotAction::Warn;
            }
        }
        SlotAction::None
    }

    /// Applies the result of [`Slot::check`]: logs and signals as decided.
    pub(crate) fn enforce(&mut self, action: SlotAction, cfg: &DispatchConfig, now: Instant) {
        match action {
            SlotAction::None => {}
            SlotAction::Warn => {
                warn!(
                    slot = self.index,
                    threshold = ?cfg.run_time_warn,
                    "worker running longer than the warning threshold"
                );
                self.duration_warned = true;
            }
            SlotAction::Terminate => {
                warn!(
                    slot = self.index,
                    limit = ?cfg.run_time_max,
                    "worker exceeded the maximum run time, requesting termination"
                );
                self.signal_term(now);
            }
            SlotAction::Kill => {
                warn!(
                    slot = self.index,
                    grace = ?cfg.termination_timeout,
                    "worker has not shut down after SIGTERM"
                );
                self.signal_kill();
            }
        }
    }

    /// Requests graceful termination: sends SIGTERM and stamps the request.
    ///
    /// Idempotent per run: a repeat request is logged and dropped so the
    /// grace-period clock is never restarted.
    pub(crate) fn signal_term(&mut self, now: Instant) {
        if self.termination_requested_at.is_some() {
            warn!(
                slot = self.index,
                "attempted termination of a worker already pending termination"
            );
            return;
        }
        let SlotState::Running { pid } = self.state else {
            warn!(
                slot = self.index,
                "attempted termination of a worker that is not running"
            );
            return;
        };

        let sent = signal::kill(pid, Signal::SIGTERM);
        self.termination_requested_at = Some(now);
        info!(
            slot = self.index,
            pid = pid.as_raw(),
            delivered = sent.is_ok(),
            "sent SIGTERM to worker"
        );
    }

    /// Forced termination after the grace period: sends SIGKILL.
    pub(crate) fn signal_kill(&self) {
        if let SlotState::Running { pid } = self.state {
            let sent = signal::kill(pid, Signal::SIGKILL);
            info!(
                slot = self.index,
                pid = pid.as_raw(),
                delivered = sent.is_ok(),
                "sent SIGKILL to worker"
            );
        }
    }
}

/// Fixed-size pool of worker slots, one per configured concurrency unit.
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<Mutex<Slot>>,
}

impl SlotPool {
    /// Creates a pool of `workers` idle slots.
    pub fn new(workers: usize) -> Self {
        Self {
            slots: (0..workers).map(|i| Mutex::new(Slot::new(i))).collect(),
        }
    }

    /// Number of slots in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the pool has no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Locks and returns the slot at `index`.
    ///
    /// A poisoned mutex is recovered rather than propagated: slot fields are
    /// plain scalars, so a panicking writer cannot leave them torn.
    pub(crate) fn slot(&self, index: usize) -> MutexGuard<'_, Slot> {
        self.slots[index]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests graceful termination of one running slot.
    pub(crate) fn request_termination(&self, index: usize, now: Instant) {
        self.slot(index).signal_term(now);
    }

    /// Asks every running worker to terminate gracefully.
    pub(crate) fn terminate_all(&self, now: Instant) {
        for index in 0..self.slots.len() {
            let mut slot = self.slot(index);
            if matches!(slot.state, SlotState::Running { .. }) {
                slot.signal_term(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cfg() -> DispatchConfig {
        DispatchConfig {
            run_time_warn: Duration::from_secs(60),
            run_time_max: Duration::from_secs(120),
            termination_timeout: Duration::from_secs(30),
            ..DispatchConfig::default()
        }
    }

    fn running(index: usize, started: Instant) -> Slot {
        let mut slot = Slot::new(index);
        slot.begin_start(started);
        slot.set_running(Pid::from_raw(4242));
        slot
    }

    #[test]
    fn test_lifecycle_passes_through_starting() {
        let now = Instant::now();
        let mut slot = Slot::new(0);
        assert_eq!(slot.state(), SlotState::Idle);

        slot.begin_start(now);
        assert_eq!(slot.state(), SlotState::Starting);
        assert_eq!(slot.last_started_at, Some(now));

        slot.set_running(Pid::from_raw(4242));
        assert!(matches!(slot.state(), SlotState::Running { .. }));

        slot.finish(Outcome::Ok);
        assert_eq!(slot.state(), SlotState::Done(Outcome::Ok));
        assert!(slot.is_stopped());
    }

    #[test]
    fn test_finish_clears_transient_fields() {
        let now = Instant::now();
        let mut slot = running(0, now);
        slot.termination_requested_at = Some(now);
        slot.duration_warned = true;

        slot.finish(Outcome::Fail);
        assert_eq!(slot.termination_requested_at, None);
        assert!(!slot.duration_warned);
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(Outcome::from_exit_code(0), Outcome::Ok);
        assert_eq!(Outcome::from_exit_code(64), Outcome::OkMore);
        assert_eq!(Outcome::from_exit_code(1), Outcome::Fail);
        assert_eq!(Outcome::from_exit_code(255), Outcome::Fail);
    }

    #[test]
    fn test_check_ignores_non_running_slots() {
        let now = Instant::now();
        let slot = Slot::new(0);
        assert_eq!(slot.check(&cfg(), now + Duration::from_secs(999)), SlotAction::None);
    }

    #[test]
    fn test_check_warns_once_then_terminates() {
        let cfg = cfg();
        let start = Instant::now();
        let mut slot = running(0, start);

        // Under both thresholds: nothing.
        assert_eq!(slot.check(&cfg, start + Duration::from_secs(30)), SlotAction::None);

        // Past the warning threshold: warn, then stay quiet once warned.
        let at_warn = start + Duration::from_secs(61);
        assert_eq!(slot.check(&cfg, at_warn), SlotAction::Warn);
        slot.duration_warned = true;
        assert_eq!(slot.check(&cfg, at_warn), SlotAction::None);

        // Past the hard limit: terminate, regardless of the warned flag.
        assert_eq!(
            slot.check(&cfg, start + Duration::from_secs(121)),
            SlotAction::Terminate
        );
    }

    #[test]
    fn test_check_escalates_to_kill_after_grace() {
        let cfg = cfg();
        let start = Instant::now();
        let mut slot = running(0, start);
        slot.termination_requested_at = Some(start + Duration::from_secs(130));

        // Within the grace period nothing further happens, even though the
        // hard run-time limit is long past.
        assert_eq!(
            slot.check(&cfg, start + Duration::from_secs(140)),
            SlotAction::None
        );
        assert_eq!(
            slot.check(&cfg, start + Duration::from_secs(160)),
            SlotAction::Kill
        );
    }

    #[test]
    fn test_check_disabled_thresholds() {
        let mut cfg = cfg();
        cfg.run_time_warn = Duration::ZERO;
        cfg.run_time_max = Duration::ZERO;

        let start = Instant::now();
        let slot = running(0, start);
        assert_eq!(
            slot.check(&cfg, start + Duration::from_secs(100_000)),
            SlotAction::None
        );
    }

    #[test]
    fn test_pool_slots_are_independent() {
        let pool = SlotPool::new(3);
        assert_eq!(pool.len(), 3);

        pool.slot(1).begin_start(Instant::now());
        assert_eq!(pool.slot(0).state(), SlotState::Idle);
        assert_eq!(pool.slot(1).state(), SlotState::Starting);
        assert_eq!(pool.slot(2).state(), SlotState::Idle);
    }
}
