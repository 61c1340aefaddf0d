//! # Scheduling policies: who launches, and when.
//!
//! A [`SchedulingPolicy`] decides, once per tick and per slot, whether that
//! slot should start new work, and how to react to a slot's terminal outcome.
//! Exactly one policy value exists per dispatch run, selected by
//! [`PolicyKind`](crate::PolicyKind); all of its state lives in explicit
//! fields constructed fresh per run, so the scheduler carries no hidden
//! non-reentrant state.
//!
//! ## The three variants
//! | Policy                         | Model                                                                 |
//! |--------------------------------|-----------------------------------------------------------------------|
//! | [`Independent`]                | every slot schedules itself, with per-slot backoff deadlines          |
//! | [`Dependent`]                  | one growing/shrinking wave shared by all slots, one global gate       |
//! | [`FixedInterval`]              | a new worker every `sleep` seconds, evicting the oldest if necessary  |
//!
//! ## Tick shape
//! The dispatch loop calls `pre_tick` once, then `decide` for every slot in
//! ascending index order, then `post_tick` once. `decide` may mutate the slot
//! (backoff transitions) and clear the `running` flag in application mode;
//! `post_tick` may name a slot whose termination the dispatcher should
//! request (fixed-interval eviction).

mod dependent;
mod fixed_interval;
mod independent;

pub(crate) use dependent::Dependent;
pub(crate) use fixed_interval::FixedInterval;
pub(crate) use independent::Independent;

use std::sync::Arc;
use std::time::Instant;

use crate::config::{DispatchConfig, PolicyKind};
use crate::core::slot::{Slot, SlotPool};

/// One scheduling algorithm driving the slot pool.
pub(crate) trait SchedulingPolicy: Send {
    /// Runs once per tick, before any slot is evaluated.
    fn pre_tick(&mut self, _pool: &SlotPool, _now: Instant) {}

    /// Decides whether `slot` should launch new work this tick.
    ///
    /// Reacts to the slot's terminal outcome as a side effect, and may clear
    /// `running` to request loop shutdown (application mode only).
    fn decide(&mut self, slot: &mut Slot, daemon: bool, running: &mut bool, now: Instant) -> bool;

    /// Runs once per tick, after every slot was evaluated. Returns the index
    /// of a slot whose graceful termination the dispatcher should request.
    fn post_tick(&mut self, _pool: &SlotPool, _now: Instant) -> Option<usize> {
        None
    }
}

/// Builds the policy selected by the configuration.
pub(crate) fn build(cfg: &Arc<DispatchConfig>) -> Box<dyn SchedulingPolicy> {
    match cfg.policy {
        PolicyKind::Independent => Box::new(Independent::new(Arc::clone(cfg))),
        PolicyKind::Dependent => Box::new(Dependent::new(Arc::clone(cfg))),
        PolicyKind::FixedInterval => Box::new(FixedInterval::new(Arc::clone(cfg))),
    }
}
