//! # Dependent policy: one wave shared by every slot.
//!
//! Concurrency ramps up only while the workload keeps reporting more work,
//! and collapses back to a single worker the moment it runs dry or fails:
//!
//! ```text
//! OkMore → wave grows by one (capped at the pool size)
//! Ok     → wave resets to 1, global gate = now + sleep
//! Fail   → wave resets to 1, global gate = now + sleep_on_error
//! ```
//!
//! Only slots with `index < wave` may launch, and nothing launches while the
//! shared gate deadline lies in the future. The gate belongs to the policy,
//! not to any slot, so one exhausted worker pauses the whole pool.
//!
//! In application mode an `Ok` or `Fail` outcome ends the run outright; only
//! `OkMore` keeps a one-shot invocation going.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::config::DispatchConfig;
use crate::core::slot::{Outcome, Slot, SlotState};
use crate::policies::SchedulingPolicy;

pub(crate) struct Dependent {
    cfg: Arc<DispatchConfig>,
    /// Slots currently allowed to run (`index < wave`). Never below 1.
    wave: usize,
    /// Pool-wide launch gate; launches resume strictly after this deadline.
    gate: Option<Instant>,
}

impl Dependent {
    pub(crate) fn new(cfg: Arc<DispatchConfig>) -> Self {
        Self {
            cfg,
            wave: 1,
            gate: None,
        }
    }

    fn collapse(&mut self, slot: &mut Slot, backoff: std::time::Duration, now: Instant, daemon: bool, running: &mut bool) {
        self.wave = 1;
        self.gate = Some(now + backoff);
        slot.state = SlotState::Idle;
        if !daemon {
            debug!("workload exhausted, ending one-shot run");
            *running = false;
        }
    }
}

impl SchedulingPolicy for Dependent {
    fn decide(&mut self, slot: &mut Slot, daemon: bool, running: &mut bool, now: Instant) -> bool {
        match slot.state {
            SlotState::Idle => {
                slot.index < self.wave && self.gate.map_or(true, |gate| now > gate)
            }

            SlotState::Done(Outcome::OkMore) => {
                if self.wave < self.cfg.workers {
                    self.wave += 1;
                    debug!(wave = self.wave, "worker reported more work, widening wave");
                }
                slot.state = SlotState::Idle;
                false
            }
            SlotState::Done(Outcome::Ok) => {
                debug!(slot = slot.index, "worker done, collapsing wave");
                self.collapse(slot, self.cfg.sleep, now, daemon, running);
                false
            }
            SlotState::Done(Outcome::Fail) => {
                debug!(slot = slot.index, "worker failed, collapsing wave");
                self.collapse(slot, self.cfg.sleep_on_error, now, daemon, running);
                false
            }

            SlotState::Sleeping { .. } | SlotState::Starting | SlotState::Running { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::slot::SlotPool;
    use std::time::Duration;

    fn policy(workers: usize) -> Dependent {
        Dependent::new(Arc::new(DispatchConfig {
            workers,
            sleep: Duration::from_secs(5),
            sleep_on_error: Duration::from_secs(30),
            ..DispatchConfig::default()
        }))
    }

    #[test]
    fn test_wave_starts_at_one() {
        let pool = SlotPool::new(4);
        let mut policy = policy(4);
        let mut running = true;
        let now = Instant::now();

        assert!(policy.decide(&mut pool.slot(0), true, &mut running, now));
        assert!(!policy.decide(&mut pool.slot(1), true, &mut running, now));
        assert!(!policy.decide(&mut pool.slot(2), true, &mut running, now));
    }

    #[test]
    fn test_wave_grows_on_ok_more_and_caps_at_pool_size() {
        // concurrency=4 and every worker keeps reporting more work: running
        // workers go 1, 2, 3, 4 and stay at 4.
        let pool = SlotPool::new(4);
        let mut policy = policy(4);
        let mut running = true;
        let now = Instant::now();

        for expected_wave in [2, 3, 4, 4, 4] {
            pool.slot(0).state = SlotState::Done(Outcome::OkMore);
            assert!(!policy.decide(&mut pool.slot(0), true, &mut running, now));
            assert_eq!(policy.wave, expected_wave);
            assert_eq!(pool.slot(0).state, SlotState::Idle);
        }

        for index in 0..4 {
            assert!(policy.decide(&mut pool.slot(index), true, &mut running, now));
        }
    }

    #[test]
    fn test_ok_collapses_wave_and_gates_the_pool() {
        let pool = SlotPool::new(3);
        let mut policy = policy(3);
        let mut running = true;
        let t0 = Instant::now();

        policy.wave = 3;
        pool.slot(1).state = SlotState::Done(Outcome::Ok);
        assert!(!policy.decide(&mut pool.slot(1), true, &mut running, t0));
        assert_eq!(policy.wave, 1);
        assert_eq!(pool.slot(1).state, SlotState::Idle);

        // Even slot 0 may not launch while the gate holds.
        assert!(!policy.decide(&mut pool.slot(0), true, &mut running, t0 + Duration::from_secs(4)));
        assert!(policy.decide(&mut pool.slot(0), true, &mut running, t0 + Duration::from_secs(6)));
    }

    #[test]
    fn test_fail_gates_for_sleep_on_error() {
        let pool = SlotPool::new(2);
        let mut policy = policy(2);
        let mut running = true;
        let t0 = Instant::now();

        pool.slot(0).state = SlotState::Done(Outcome::Fail);
        assert!(!policy.decide(&mut pool.slot(0), true, &mut running, t0));

        assert!(!policy.decide(&mut pool.slot(0), true, &mut running, t0 + Duration::from_secs(29)));
        assert!(policy.decide(&mut pool.slot(0), true, &mut running, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn test_one_shot_ends_on_terminal_outcome_but_not_ok_more() {
        let pool = SlotPool::new(2);
        let mut policy = policy(2);
        let now = Instant::now();

        let mut running = true;
        pool.slot(0).state = SlotState::Done(Outcome::OkMore);
        policy.decide(&mut pool.slot(0), false, &mut running, now);
        assert!(running);

        pool.slot(0).state = SlotState::Done(Outcome::Ok);
        policy.decide(&mut pool.slot(0), false, &mut running, now);
        assert!(!running);

        let mut running = true;
        pool.slot(1).state = SlotState::Done(Outcome::Fail);
        policy.decide(&mut pool.slot(1), false, &mut running, now);
        assert!(!running);
    }
}
