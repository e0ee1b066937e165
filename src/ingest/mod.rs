//! `SourceIngest`: file and HTTP byte sources feeding the NAL/AU parser.
//!
//! Both variants are driven the same way `StreamContext` drives everything
//! else: non-blocking reads dispatched from poll readiness, never a
//! dedicated I/O thread.

pub mod file;
pub mod http;

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::PlayerError;
use crate::parser::FrameSink;

pub use file::FileIngest;
pub use http::HttpIngest;

/// Outcome of a readiness callback, telling `StreamContext` whether to
/// keep the fd registered, and whether the source just failed.
pub enum IngestEvent {
    /// Bytes were read and fed to the parser; still open.
    Progressed,
    /// End of file/stream reached without error (for `File`, this is
    /// permanent; for `Http`, this behaves like a transient close).
    Eof,
    /// A transient error (connection reset, read error). Caller should
    /// close and arm a reconnect/backoff timer.
    Transient(String),
    /// Nothing to do right now (would-block).
    Idle,
}

/// Shared idle-timeout bookkeeping: `StreamContext::tick` advances this
/// once per tick and `SourceIngest` impls reset it on any read/write
/// progress, per the "centralize timer advances at the top of tick" design
/// decision recorded in DESIGN.md.
pub struct IdleTimer {
    last_progress: Instant,
    timeout: Duration,
}

impl IdleTimer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_progress: Instant::now(),
            timeout,
        }
    }

    pub fn mark_progress(&mut self) {
        self.last_progress = Instant::now();
    }

    pub fn elapsed(&self) -> bool {
        self.last_progress.elapsed() >= self.timeout
    }
}

/// Common surface `StreamContext` drives both ingest variants through.
pub trait SourceIngest {
    /// Starts (or restarts) the connection sequence: opens the file or
    /// spawns the DNS resolver thread, per variant.
    fn open(&mut self) -> Result<(), PlayerError>;

    /// Polled once per tick before readiness dispatch; only `HttpIngest`
    /// does anything here (advancing DNS resolution).
    fn poll(&mut self) -> Result<(), PlayerError> {
        Ok(())
    }

    /// The fd to register in the poll set, if currently open.
    fn poll_fd(&self) -> Option<RawFd>;

    /// Which readiness events this source currently wants.
    fn wants_read(&self) -> bool;
    fn wants_write(&self) -> bool;

    /// Handle one readiness callback, feeding any read bytes to `sink`'s
    /// parser via `parser.feed(sink, bytes)`.
    fn on_readable(
        &mut self,
        parser: &mut crate::parser::NalParser,
        sink: &mut dyn FrameSink,
    ) -> IngestEvent;

    fn on_writable(&mut self) -> IngestEvent;

    /// Suspend read readiness until the next tick (file backpressure tied
    /// to render cadence).
    fn suspend_read_until_next_tick(&mut self);
    fn resume_read(&mut self);

    /// True once the idle timer has elapsed without progress.
    fn idle_timed_out(&self) -> bool;

    /// Tear down the current connection/file handle, clearing any
    /// in-progress read state, without forgetting configuration needed to
    /// reopen.
    fn close(&mut self);

    /// True if reconnect/reopen is meaningful for this source kind.
    fn is_reconnectable(&self) -> bool;
}
