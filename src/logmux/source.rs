//! One registered subprocess output source.

use std::os::fd::OwnedFd;

/// Lifecycle of a registered source.
///
/// Removal is two-phase: marking a source [`Mothballed`](SourceState::Mothballed)
/// never closes it. The handles are closed and the entry unlinked only after
/// the next drain pass, so output arriving between "process exited" and "next
/// flush" is never dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SourceState {
    /// Drained on every flush.
    Active,
    /// Drained one final time on the next flush, then released.
    Mothballed,
}

/// The two readable pipe ends belonging to one subprocess.
///
/// Owned by the multiplexer's registry; dropping the entry closes both fds.
#[derive(Debug)]
pub(crate) struct LogSource {
    /// Registry id handed back to the supervisor for later removal.
    pub(crate) id: u32,
    /// Read end of the subprocess stdout pipe (non-blocking).
    pub(crate) stdout: OwnedFd,
    /// Read end of the subprocess stderr pipe (non-blocking).
    pub(crate) stderr: OwnedFd,
    /// Current lifecycle state.
    pub(crate) state: SourceState,
}
