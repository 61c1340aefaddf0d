//! Core runtime: the dispatch loop, slot pool, per-worker supervisors and
//! signal coordination.

pub mod dispatcher;
pub mod signals;
pub mod slot;

pub(crate) mod supervisor;

pub use dispatcher::{run, Dispatcher};
pub use signals::{PendingSignal, SignalCoordinator};
pub use slot::{Outcome, Slot, SlotPool, SlotState, EXIT_STATUS_OK_MORE};
