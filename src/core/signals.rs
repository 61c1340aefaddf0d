//! # OS signal coordination.
//!
//! A dedicated listener task translates asynchronous OS signals into one
//! shared, lock-protected pending value that the dispatch loop consumes
//! cooperatively; signals are never acted on preemptively inside scheduling
//! logic.
//!
//! ## Unix mapping
//! - **SIGTERM / SIGQUIT / SIGINT** → [`PendingSignal::Terminate`]
//! - **SIGHUP** → [`PendingSignal::Reload`] (log sinks are reopened,
//!   supporting external rotation)
//!
//! A newly caught signal overwrites any unconsumed prior value; the loop
//! consumes at most one per tick via [`SignalCoordinator::take`].

use std::io;
use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tracing::debug;

/// The one signal-derived instruction the dispatch loop may find per tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PendingSignal {
    /// Stop issuing new work and begin graceful shutdown.
    Terminate,
    /// Reopen the log sinks without disturbing anything else.
    Reload,
}

/// Shared pending-signal cell plus the listener that feeds it.
#[derive(Clone, Debug, Default)]
pub struct SignalCoordinator {
    pending: Arc<Mutex<Option<PendingSignal>>>,
}

impl SignalCoordinator {
    /// Creates a coordinator with no pending signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the signal streams and spawns the listener task.
    ///
    /// The task lives for the rest of the process; it only writes to the
    /// shared cell, so an abandoned listener after `run` returns is inert.
    pub fn listen(&self) -> io::Result<()> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            loop {
                let caught = tokio::select! {
                    _ = sigterm.recv() => PendingSignal::Terminate,
                    _ = sigquit.recv() => PendingSignal::Terminate,
                    _ = sigint.recv() => PendingSignal::Terminate,
                    _ = sighup.recv() => PendingSignal::Reload,
                };
                debug!(signal = ?caught, "caught signal");
                store(&pending, caught);
            }
        });
        Ok(())
    }

    /// Stores a signal as if it had been caught, overwriting any unconsumed
    /// value.
    pub fn notify(&self, sig: PendingSignal) {
        store(&self.pending, sig);
    }

    /// Consumes and clears the pending signal, if any.
    pub fn take(&self) -> Option<PendingSignal> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

fn store(pending: &Mutex<Option<PendingSignal>>, sig: PendingSignal) {
    *pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sig);
}
