//! Error types used by the jobvisor runtime.
//!
//! [`RuntimeError`] covers failures of the dispatch runtime itself. Errors in
//! the log multiplexer have their own type, [`MuxError`](crate::MuxError),
//! because the dispatcher degrades differently on them: the subsystem is
//! disabled rather than the run aborted, except at initialization.
//!
//! Recoverable conditions (spawn failure, a worker exiting non-zero) never
//! surface here: they are classified as a `Fail` outcome and absorbed by the
//! active scheduling policy's backoff path.

use thiserror::Error;

use crate::logmux::MuxError;

/// Errors that abort a dispatch run.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The log multiplexer could not open its sinks at startup.
    #[error("log multiplexer initialization failed: {0}")]
    LogInit(#[from] MuxError),

    /// The OS signal listener could not be installed.
    #[error("could not install signal listener: {0}")]
    SignalListener(#[source] std::io::Error),

    /// Waiting on a child process failed; the child's fate is unknown, so the
    /// scheduler cannot safely continue.
    #[error("wait failed for worker {slot}: {errno}")]
    WaitFailed {
        /// Index of the slot whose supervisor lost track of its child.
        slot: usize,
        /// The underlying errno from `waitpid`.
        errno: nix::errno::Errno,
    },
}
