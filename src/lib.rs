//! # Jobvisor
//!
//! A single-host job dispatcher: it runs a fixed pool of worker slots, each
//! repeatedly invoking one configured command as a child process, with a
//! pluggable scheduling policy deciding who launches and when. Think
//! "supervised cron at second granularity, driven by worker exit codes".
//!
//! - **Slot pool**: fixed concurrency, slots reused across invocations
//! - **Three policies**: independent backoff, dependent wave, fixed interval
//! - **Exit-code protocol**: `0` done, `64` more work ready, anything else
//!   (or death by signal) is a failure with its own backoff
//! - **Duration limits**: warn once, then SIGTERM, then SIGKILL after a grace
//!   period
//! - **Log multiplexing**: all worker stdout/stderr streamed into shared
//!   append-mode sinks, rotation-safe via SIGHUP
//! - **Graceful shutdown**: SIGTERM/SIGINT/SIGQUIT stop launches, terminate
//!   workers and drain
//!
//! ## Architecture
//!
//! ```text
//!                    ┌────────────────────────────┐
//!   SIGTERM/SIGHUP ─►│ SignalCoordinator          │
//!                    └──────────────┬─────────────┘
//!                                   │ pending signal (≤1/tick)
//!                    ┌──────────────▼─────────────┐
//!                    │ Dispatcher (200ms tick)     │
//!                    │  duration checks · policy   │
//!                    │  decisions · log flushing   │
//!                    └──┬───────────┬──────────┬──┘
//!                       │ spawn     │          │ flush
//!          ┌────────────▼──┐   ┌────▼────────┐ │
//!          │ Supervisor 0  │   │ Supervisor N│ │
//!          │ spawn+waitpid │   │             │ │
//!          └───────┬───────┘   └────┬────────┘ │
//!                  │ outcome        │          │
//!            ┌─────▼────────────────▼───┐ ┌────▼─────────────┐
//!            │ SlotPool (state machine) │ │ LogMultiplexer   │
//!            └──────────────────────────┘ └──────────────────┘
//! ```
//!
//! The dispatcher makes every scheduling decision on one control task, once
//! per tick. Supervisors are blocking attendants (spawn, register output
//! pipes, `waitpid`) that only ever touch their own slot.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use jobvisor::{DispatchConfig, PolicyKind, RuntimeError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RuntimeError> {
//!     let cfg = DispatchConfig {
//!         command: "/usr/local/bin/fetch-batch".into(),
//!         workers: 4,
//!         policy: PolicyKind::Dependent,
//!         sleep: Duration::from_secs(30),
//!         sleep_on_error: Duration::from_secs(300),
//!         log_stdout: Some("/var/log/fetch-batch.log".into()),
//!         ..DispatchConfig::default()
//!     };
//!
//!     // Daemon mode: keep dispatching until a termination signal arrives.
//!     jobvisor::run(cfg, true).await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod logmux;

pub(crate) mod policies;

pub use config::{DispatchConfig, MaxWait, PolicyKind};
pub use self::core::{
    run, Dispatcher, Outcome, PendingSignal, SignalCoordinator, Slot, SlotPool, SlotState,
    EXIT_STATUS_OK_MORE,
};
pub use error::RuntimeError;
pub use logmux::{LogMultiplexer, MuxError};
