//! Typed error kinds surfaced by the player's internal state machines.
//!
//! Per the error-handling design, these never escape the main loop: a
//! component that detects one of these conditions logs it and folds it into
//! a per-stream flag or timer (`shutdown.is_active`, `flushing.*`, a reopen
//! backoff, ...). `main` only ever sees an `anyhow::Result` from setup code
//! that runs before the loop starts (opening configured framebuffers,
//! binding the poll registry).

use thiserror::Error;

/// A condition a stream or device can hit while the player is running.
///
/// Every variant maps to one of the error kinds enumerated in the
/// error-handling design: transient device error, permanent source error,
/// unsupported format, timeout, flush/shutdown timeout, allocation
/// under-grant, and would-block.
#[derive(Debug, Error)]
pub enum PlayerError {
    /// The decoder device reported an I/O error or dequeue failure
    /// classified as recoverable. The owning stream should close the
    /// decoder and arm a reopen backoff.
    #[error("transient decoder error on device {device}: {reason}")]
    TransientDevice { device: String, reason: String },

    /// The source (file or socket) hit a non-recoverable condition: the
    /// file was closed by its owner, or configuration makes reconnection
    /// meaningless. The owning stream should shut down permanently.
    #[error("permanent source error for stream {stream}: {reason}")]
    PermanentSource { stream: String, reason: String },

    /// `set_format`/`query_formats` rejected the desired pixel format.
    /// The stream remains registered but never opens a decoder.
    #[error("pixel format {format:?} not supported by device {device}")]
    FormatNotSupported { device: String, format: String },

    /// A connection or decoder idle timeout elapsed.
    #[error("{what} timed out after {secs}s")]
    Timeout { what: &'static str, secs: u64 },

    /// The flush or shutdown hard cap elapsed before completion; the
    /// caller should force-complete and proceed.
    #[error("{what} did not complete within {cap_ms}ms, forcing completion")]
    HardCapElapsed { what: &'static str, cap_ms: u64 },

    /// The device granted fewer buffers than requested but at least the
    /// minimum required; caller should warn and continue.
    #[error("device {device} granted {granted} of {requested} requested buffers")]
    UnderGrant {
        device: String,
        requested: usize,
        granted: usize,
    },

    /// A non-blocking I/O call would have blocked; always ignored by the
    /// caller and retried on the next readiness event. Kept as a variant
    /// so device adapters have a uniform `Result` return type.
    #[error("operation would block")]
    WouldBlock,
}

impl PlayerError {
    /// True for errors that should trigger a transient (reopen-eligible)
    /// close rather than a permanent shutdown.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PlayerError::TransientDevice { .. } | PlayerError::Timeout { .. }
        )
    }
}
