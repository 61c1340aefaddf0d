//! # Independent policy: every slot schedules itself.
//!
//! Idle slots launch unconditionally. After a terminal outcome the slot backs
//! off on its own:
//!
//! ```text
//! OkMore → back to idle, relaunch immediately
//! Ok     → Sleeping(now + sleep)
//! Fail   → Sleeping(now + sleep_on_error)
//! ```
//!
//! Backoff is an absolute wake deadline computed at transition time. Sleeping
//! slots wake only in daemon mode (strictly after the deadline); in
//! application mode they stay asleep, and once every slot is asleep the
//! policy clears the running flag so the loop can drain and exit.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::DispatchConfig;
use crate::core::slot::{Outcome, Slot, SlotPool, SlotState};
use crate::policies::SchedulingPolicy;

pub(crate) struct Independent {
    cfg: Arc<DispatchConfig>,
    /// Slots seen asleep this tick (application mode only).
    unavailable_slots: usize,
}

impl Independent {
    pub(crate) fn new(cfg: Arc<DispatchConfig>) -> Self {
        Self {
            cfg,
            unavailable_slots: 0,
        }
    }
}

impl SchedulingPolicy for Independent {
    fn pre_tick(&mut self, _pool: &SlotPool, _now: Instant) {
        self.unavailable_slots = 0;
    }

    fn decide(&mut self, slot: &mut Slot, daemon: bool, running: &mut bool, now: Instant) -> bool {
        match slot.state {
            SlotState::Idle => true,

            SlotState::Done(Outcome::OkMore) => {
                debug!(slot = slot.index, "worker has more work, returning to pool");
                slot.state = SlotState::Idle;
                true
            }
            SlotState::Done(Outcome::Ok) => {
                debug!(slot = slot.index, "worker done, putting slot to sleep");
                slot.state = SlotState::Sleeping {
                    until: now + self.cfg.sleep,
                };
                false
            }
            SlotState::Done(Outcome::Fail) => {
                debug!(slot = slot.index, "worker failed, backing off");
                slot.state = SlotState::Sleeping {
                    until: now + self.cfg.sleep_on_error,
                };
                false
            }

            SlotState::Sleeping { until } => {
                if daemon {
                    if now > until {
                        // Slept long enough; eligible again from the next tick.
                        slot.state = SlotState::Idle;
                    }
                } else {
                    self.unavailable_slots += 1;
                    if self.unavailable_slots == self.cfg.workers {
                        debug!("all workers finished");
                        *running = false;
                    }
                }
                false
            }

            SlotState::Starting | SlotState::Running { .. } => false,
        }
    }
}
