//! # Fixed-interval policy: a new worker every `sleep` seconds.
//!
//! The cadence is anchored to launch times, not completions: a launch is due
//! once `sleep` has elapsed since the previous launch, regardless of whether
//! that worker is still running. When a launch is due but every slot is
//! occupied, [`MaxWait`](crate::MaxWait) decides how long to hold the cadence
//! before making room:
//!
//! ```text
//! Indefinite → wait for a slot to free up on its own (default)
//! Immediate  → request graceful termination of the longest-running worker now
//! After(d)   → wait up to d, then request termination of the longest-running
//! ```
//!
//! Eviction is a graceful termination request; the worker still gets the
//! configured grace period before any SIGKILL. A failed worker pauses the
//! cadence entirely for `sleep_on_error`.
//!
//! The longest-running candidate is recomputed from slot launch timestamps on
//! every tick, so a worker that exits between ticks can never be named as the
//! eviction victim.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use crate::config::{DispatchConfig, MaxWait};
use crate::core::slot::{Outcome, Slot, SlotPool, SlotState};
use crate::policies::SchedulingPolicy;

/// How long the policy has been holding a due launch for want of a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wait {
    /// Not waiting; the next due launch starts a fresh wait if needed.
    None,
    /// Waiting until the deadline, then evicting.
    Until(Instant),
    /// Waiting for a slot to free up on its own, however long that takes.
    Indefinite,
}

pub(crate) struct FixedInterval {
    cfg: Arc<DispatchConfig>,
    /// A launch is due (interval elapsed, or nothing launched yet).
    new_worker_required: bool,
    /// Oldest occupied slot this tick, with its launch time.
    longest_running: Option<(usize, Instant)>,
    /// Slot that performed the most recent launch.
    last_run: Option<usize>,
    /// Cadence paused after a failed worker.
    is_sleeping: bool,
    /// Wake deadline for the failure pause.
    sleep_until: Option<Instant>,
    wait: Wait,
}

impl FixedInterval {
    pub(crate) fn new(cfg: Arc<DispatchConfig>) -> Self {
        Self {
            cfg,
            new_worker_required: false,
            longest_running: None,
            last_run: None,
            is_sleeping: false,
            sleep_until: None,
            wait: Wait::None,
        }
    }
}

impl SchedulingPolicy for FixedInterval {
    fn pre_tick(&mut self, pool: &SlotPool, now: Instant) {
        if self.is_sleeping {
            if self.sleep_until.is_some_and(|until| until <= now) {
                debug!("failure pause over, resuming cadence");
                self.is_sleeping = false;
                self.sleep_until = None;
            }
        }

        if !self.new_worker_required {
            match self.last_run {
                None => self.new_worker_required = true,
                Some(index) => {
                    let started = pool.slot(index).last_started_at;
                    let elapsed = started
                        .map_or(true, |at| now.saturating_duration_since(at) >= self.cfg.sleep);
                    if elapsed {
                        debug!("interval elapsed, new worker required");
                        self.new_worker_required = true;
                    }
                }
            }
        }

        // Rebuilt from scratch every tick; see module docs.
        self.longest_running = None;
    }

    fn decide(&mut self, slot: &mut Slot, _daemon: bool, _running: &mut bool, now: Instant) -> bool {
        match slot.state {
            SlotState::Done(Outcome::Ok) | SlotState::Done(Outcome::OkMore) => {
                slot.state = SlotState::Idle;
            }
            SlotState::Done(Outcome::Fail) => {
                debug!(slot = slot.index, "worker failed, pausing cadence");
                self.is_sleeping = true;
                self.sleep_until = Some(now + self.cfg.sleep_on_error);
                slot.state = SlotState::Idle;
            }
            _ => {}
        }

        match slot.state {
            SlotState::Idle => {
                if self.new_worker_required && !self.is_sleeping {
                    self.new_worker_required = false;
                    self.wait = Wait::None;
                    self.last_run = Some(slot.index);
                    return true;
                }
                false
            }
            SlotState::Starting | SlotState::Running { .. } | SlotState::Sleeping { .. } => {
                if let Some(started) = slot.last_started_at {
                    let older = match self.longest_running {
                        None => true,
                        Some((_, candidate)) => candidate > started,
                    };
                    if older {
                        self.longest_running = Some((slot.index, started));
                    }
                }
                false
            }
            SlotState::Done(_) => false,
        }
    }

    fn post_tick(&mut self, pool: &SlotPool, now: Instant) -> Option<usize> {
        // Only relevant while a due launch is being held back.
        if !(self.new_worker_required && !self.is_sleeping) {
            return None;
        }

        match self.cfg.max_launch_wait {
            MaxWait::Indefinite => {
                if self.wait == Wait::None {
                    debug!("no free slot, waiting indefinitely");
                }
                self.wait = Wait::Indefinite;
                None
            }
            MaxWait::After(limit) if self.wait == Wait::None => {
                debug!(?limit, "no free slot, starting launch wait");
                self.wait = Wait::Until(now + limit);
                None
            }
            _ => {
                let due = matches!(self.cfg.max_launch_wait, MaxWait::Immediate)
                    || matches!(self.wait, Wait::Until(deadline) if deadline <= now);
                if due {
                    if let Some((index, _)) = self.longest_running {
                        if pool.slot(index).termination_requested_at.is_none() {
                            debug!(slot = index, "evicting longest-running worker");
                            return Some(index);
                        }
                    } else {
                        error!("launch due but no longest-running slot identified");
                    }
                }
                None
            }
        }
    }
}
