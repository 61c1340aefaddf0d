//! # Log multiplexer: streams subprocess output into shared sinks.
//!
//! The [`LogMultiplexer`] owns two append-mode log sinks (stdout and stderr,
//! one shared handle when both paths are equal) and a registry of active byte
//! sources, the pipe read ends of every running subprocess. It drains
//! sources into sinks on demand; the output is raw byte passthrough,
//! interleaved across children, with no added framing or timestamps.
//!
//! ```text
//! worker 1 stdout ──┐
//! worker 1 stderr ──┤                      ┌──► stdout sink (append)
//! worker 2 stdout ──┼──► flush() drains ───┤
//! worker 2 stderr ──┤    (registry order)  └──► stderr sink (append)
//! worker N ...    ──┘
//! ```
//!
//! ## Rules
//! - **Two-phase removal**: `remove_source` only marks; handles close after
//!   the marked source's final drain on the next `flush` (see
//!   [`SourceState`](source::SourceState)).
//! - **Rotation-safe**: `reinitialize` closes and reopens both sinks without
//!   touching the registry, so a SIGHUP after logrotate loses nothing.
//! - **Non-blocking**: a read yielding no data is normal; real read errors
//!   are logged and that stream is skipped for the rest of the pass.
//! - **Soft-degrading sinks**: write/flush errors surface as
//!   [`MuxError::SinkWrite`] so the dispatcher can stop invoking the
//!   subsystem while the scheduler keeps running.
//!
//! ## Locking
//! The sink state sits behind an `RwLock`: `flush` and `append_source` take
//! read access and may run concurrently, while `initialize`/`reinitialize`/
//! `deinitialize` take write access and exclude them. The source registry has
//! its own mutex.

mod source;

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd;
use thiserror::Error;
use tracing::{debug, error};

use source::{LogSource, SourceState};

/// Read-buffer size for one non-blocking drain step.
const DRAIN_BUF: usize = 255;

/// Source ids wrap to zero above this bound.
const SOURCE_ID_WRAP: u32 = 65_000;

/// Errors produced by the log multiplexer.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MuxError {
    /// An operation requiring open sinks was called before `initialize` (or
    /// after `deinitialize`).
    #[error("log multiplexer is not initialized")]
    NotInitialized,

    /// `initialize` was called while sinks were already open.
    #[error("log multiplexer is already initialized")]
    AlreadyInitialized,

    /// A log sink could not be opened.
    #[error("could not open log sink {path}: {source}")]
    OpenSink {
        /// Path of the sink that failed to open.
        path: PathBuf,
        /// The underlying open error.
        source: io::Error,
    },

    /// Writing to or flushing a sink failed.
    #[error("could not write to log sink: {0}")]
    SinkWrite(#[source] io::Error),

    /// A pipe fd could not be switched to non-blocking mode.
    #[error("could not set pipe non-blocking: {0}")]
    SetNonblocking(#[source] Errno),

    /// `remove_source` was called with an id not present in the registry.
    #[error("no registered source with id {0}")]
    UnknownSource(u32),
}

/// The open sink pair plus the paths they were opened from (kept for
/// `reinitialize`).
#[derive(Debug)]
struct Sinks {
    stdout: File,
    /// `None` when both paths are equal: stderr shares the stdout handle.
    stderr: Option<File>,
    path_stdout: PathBuf,
    path_stderr: PathBuf,
}

impl Sinks {
    fn open(path_stdout: &Path, path_stderr: &Path) -> Result<Self, MuxError> {
        let stdout = open_append(path_stdout)?;
        let stderr = if path_stdout == path_stderr {
            None
        } else {
            Some(open_append(path_stderr)?)
        };
        Ok(Self {
            stdout,
            stderr,
            path_stdout: path_stdout.to_path_buf(),
            path_stderr: path_stderr.to_path_buf(),
        })
    }

    fn stderr(&self) -> &File {
        self.stderr.as_ref().unwrap_or(&self.stdout)
    }
}

fn open_append(path: &Path) -> Result<File, MuxError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| MuxError::OpenSink {
            path: path.to_path_buf(),
            source,
        })
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u32,
    sources: Vec<LogSource>,
}

/// Shared log aggregator for all worker subprocesses.
#[derive(Debug, Default)]
pub struct LogMultiplexer {
    sinks: RwLock<Option<Sinks>>,
    registry: Mutex<Registry>,
}

impl LogMultiplexer {
    /// Creates an uninitialized multiplexer with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens both sinks in append mode. When the two paths are equal a single
    /// handle is shared.
    pub fn initialize(&self, path_stdout: &Path, path_stderr: &Path) -> Result<(), MuxError> {
        debug!(
            stdout = %path_stdout.display(),
            stderr = %path_stderr.display(),
            "initializing subprocess log sinks"
        );
        let mut sinks = self.write_sinks();
        if sinks.is_some() {
            return Err(MuxError::AlreadyInitialized);
        }
        *sinks = Some(Sinks::open(path_stdout, path_stderr)?);
        Ok(())
    }

    /// Atomically closes and reopens both sinks, leaving the registered
    /// source list untouched. Called on SIGHUP to support external rotation.
    pub fn reinitialize(&self) -> Result<(), MuxError> {
        debug!("reinitializing subprocess log sinks");
        let mut sinks = self.write_sinks();
        let previous = sinks.take().ok_or(MuxError::NotInitialized)?;
        let (path_stdout, path_stderr) = (previous.path_stdout, previous.path_stderr);
        drop((previous.stdout, previous.stderr));

        *sinks = Some(Sinks::open(&path_stdout, &path_stderr)?);
        Ok(())
    }

    /// Marks every source for removal, performs one final drain, then closes
    /// both sinks.
    pub fn deinitialize(&self) -> Result<(), MuxError> {
        debug!("deinitializing subprocess log sinks");
        let mut sinks = self.write_sinks();
        let open = sinks.take().ok_or(MuxError::NotInitialized)?;

        let mut registry = self.lock_registry();
        for source in &mut registry.sources {
            source.state = SourceState::Mothballed;
        }
        drain_all(&open, &mut registry)
    }

    /// True while the sinks are open.
    pub fn is_initialized(&self) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Registers a new active source and switches both read ends to
    /// non-blocking mode. Returns the id used to remove it later.
    ///
    /// New sources go to the front of the registry, so drain order is
    /// most-recently-added first (deterministic, but of no external
    /// significance).
    pub fn append_source(&self, stdout: OwnedFd, stderr: OwnedFd) -> Result<u32, MuxError> {
        let sinks = self.read_sinks();
        if sinks.is_none() {
            return Err(MuxError::NotInitialized);
        }

        set_nonblocking(stdout.as_fd())?;
        set_nonblocking(stderr.as_fd())?;

        let mut registry = self.lock_registry();
        if registry.next_id > SOURCE_ID_WRAP {
            registry.next_id = 0;
        }
        let id = registry.next_id;
        registry.next_id += 1;

        debug!(id, "registering subprocess output source");
        registry.sources.insert(
            0,
            LogSource {
                id,
                stdout,
                stderr,
                state: SourceState::Active,
            },
        );
        Ok(id)
    }

    /// Marks one source for removal after its next drain.
    pub fn remove_source(&self, id: u32) -> Result<(), MuxError> {
        debug!(id, "mothballing subprocess output source");
        let mut registry = self.lock_registry();
        let source = registry
            .sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(MuxError::UnknownSource(id))?;
        source.state = SourceState::Mothballed;
        Ok(())
    }

    /// Marks every source for removal after its next drain.
    pub fn remove_all_sources(&self) {
        let mut registry = self.lock_registry();
        for source in &mut registry.sources {
            source.state = SourceState::Mothballed;
        }
    }

    /// Drains every registered source into the sinks, then releases the
    /// sources that were marked for removal.
    pub fn flush(&self) -> Result<(), MuxError> {
        let sinks = self.read_sinks();
        let Some(open) = sinks.as_ref() else {
            return Err(MuxError::NotInitialized);
        };
        let mut registry = self.lock_registry();
        drain_all(open, &mut registry)
    }

    fn read_sinks(&self) -> std::sync::RwLockReadGuard<'_, Option<Sinks>> {
        self.sinks
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sinks(&self) -> std::sync::RwLockWriteGuard<'_, Option<Sinks>> {
        self.sinks
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One full drain pass: every source, both streams, in registry order.
/// Mothballed sources are released only after the pass completes.
fn drain_all(sinks: &Sinks, registry: &mut Registry) -> Result<(), MuxError> {
    for source in &registry.sources {
        drain_stream(source.stdout.as_fd(), &sinks.stdout)?;
        drain_stream(source.stderr.as_fd(), sinks.stderr())?;
    }

    registry.sources.retain(|source| {
        if source.state == SourceState::Mothballed {
            debug!(id = source.id, "releasing drained source");
            false
        } else {
            true
        }
    });
    Ok(())
}

/// Non-blocking-reads all currently available bytes from `fd` into `sink`,
/// then flushes the sink.
fn drain_stream(fd: BorrowedFd<'_>, sink: &File) -> Result<(), MuxError> {
    let mut buf = [0u8; DRAIN_BUF];
    let mut out = sink;
    loop {
        match unistd::read(fd, &mut buf) {
            // Writer side closed; nothing more will arrive.
            Ok(0) => break,
            Ok(n) => out.write_all(&buf[..n]).map_err(MuxError::SinkWrite)?,
            // No data right now, not an error.
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                error!(%errno, "cannot read from subprocess pipe");
                break;
            }
        }
    }
    out.flush().map_err(MuxError::SinkWrite)
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<(), MuxError> {
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map(|_| ())
        .map_err(MuxError::SetNonblocking)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        unistd::pipe().expect("pipe")
    }

    fn write_end(fd: &OwnedFd, bytes: &[u8]) {
        unistd::write(fd, bytes).expect("write to pipe");
    }

    struct Fixture {
        mux: LogMultiplexer,
        dir: TempDir,
    }

    impl Fixture {
        fn shared_sink() -> Self {
            let dir = TempDir::new().expect("tempdir");
            let path = dir.path().join("out.log");
            let mux = LogMultiplexer::new();
            mux.initialize(&path, &path).expect("initialize");
            Fixture { mux, dir }
        }

        fn split_sinks() -> Self {
            let dir = TempDir::new().expect("tempdir");
            let mux = LogMultiplexer::new();
            mux.initialize(&dir.path().join("out.log"), &dir.path().join("err.log"))
                .expect("initialize");
            Fixture { mux, dir }
        }

        fn sink(&self, name: &str) -> String {
            fs::read_to_string(self.dir.path().join(name)).expect("read sink")
        }
    }

    #[test]
    fn test_flush_before_initialize_is_an_error() {
        let mux = LogMultiplexer::new();
        assert!(matches!(mux.flush(), Err(MuxError::NotInitialized)));

        let (r, _w) = pipe_pair();
        let (r2, _w2) = pipe_pair();
        assert!(matches!(
            mux.append_source(r, r2),
            Err(MuxError::NotInitialized)
        ));
    }

    #[test]
    fn test_double_initialize_is_an_error() {
        let fx = Fixture::shared_sink();
        let path = fx.dir.path().join("out.log");
        assert!(matches!(
            fx.mux.initialize(&path, &path),
            Err(MuxError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_flush_drains_available_bytes_from_both_streams() {
        let fx = Fixture::split_sinks();
        let (out_r, out_w) = pipe_pair();
        let (err_r, err_w) = pipe_pair();
        fx.mux.append_source(out_r, err_r).expect("append");

        write_end(&out_w, b"to stdout\n");
        write_end(&err_w, b"to stderr\n");
        fx.mux.flush().expect("flush");

        assert_eq!(fx.sink("out.log"), "to stdout\n");
        assert_eq!(fx.sink("err.log"), "to stderr\n");
    }

    #[test]
    fn test_equal_paths_share_one_sink() {
        let fx = Fixture::shared_sink();
        let (out_r, out_w) = pipe_pair();
        let (err_r, err_w) = pipe_pair();
        fx.mux.append_source(out_r, err_r).expect("append");

        write_end(&out_w, b"A");
        write_end(&err_w, b"B");
        fx.mux.flush().expect("flush");

        assert_eq!(fx.sink("out.log"), "AB");
    }

    #[test]
    fn test_mothballed_source_is_drained_before_release() {
        let fx = Fixture::shared_sink();
        let (out_r, out_w) = pipe_pair();
        let (err_r, _err_w) = pipe_pair();
        let id = fx.mux.append_source(out_r, err_r).expect("append");

        // Bytes written before removal must survive into the sink even though
        // the handles close during that same flush.
        write_end(&out_w, b"final words");
        fx.mux.remove_source(id).expect("remove");
        fx.mux.flush().expect("flush");

        assert_eq!(fx.sink("out.log"), "final words");
        // The source is gone from the registry after the drain.
        assert!(matches!(
            fx.mux.remove_source(id),
            Err(MuxError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_remove_unknown_source() {
        let fx = Fixture::shared_sink();
        assert!(matches!(
            fx.mux.remove_source(7),
            Err(MuxError::UnknownSource(7))
        ));
    }

    #[test]
    fn test_drain_order_is_most_recently_added_first() {
        let fx = Fixture::shared_sink();
        let (first_r, first_w) = pipe_pair();
        let (e1, _w1) = pipe_pair();
        let (second_r, second_w) = pipe_pair();
        let (e2, _w2) = pipe_pair();

        fx.mux.append_source(first_r, e1).expect("append first");
        fx.mux.append_source(second_r, e2).expect("append second");

        write_end(&first_w, b"old");
        write_end(&second_w, b"new");
        fx.mux.flush().expect("flush");

        assert_eq!(fx.sink("out.log"), "newold");
    }

    #[test]
    fn test_reinitialize_keeps_registered_sources() {
        let fx = Fixture::shared_sink();
        let (out_r, out_w) = pipe_pair();
        let (err_r, _err_w) = pipe_pair();
        fx.mux.append_source(out_r, err_r).expect("append");

        write_end(&out_w, b"before rotation");
        fx.mux.reinitialize().expect("reinitialize");
        write_end(&out_w, b" and after");
        fx.mux.flush().expect("flush");

        assert_eq!(fx.sink("out.log"), "before rotation and after");
    }

    #[test]
    fn test_deinitialize_performs_final_drain() {
        let fx = Fixture::shared_sink();
        let (out_r, out_w) = pipe_pair();
        let (err_r, _err_w) = pipe_pair();
        fx.mux.append_source(out_r, err_r).expect("append");

        write_end(&out_w, b"last bytes");
        fx.mux.deinitialize().expect("deinitialize");

        assert_eq!(fx.sink("out.log"), "last bytes");
        assert!(!fx.mux.is_initialized());
        assert!(matches!(fx.mux.flush(), Err(MuxError::NotInitialized)));
    }

    #[test]
    fn test_source_ids_wrap() {
        let fx = Fixture::shared_sink();
        fx.mux.lock_registry().next_id = SOURCE_ID_WRAP + 1;

        let (r, _w) = pipe_pair();
        let (r2, _w2) = pipe_pair();
        let id = fx.mux.append_source(r, r2).expect("append");
        assert_eq!(id, 0);
    }
}
