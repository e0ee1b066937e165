//! The kernel video-codec capability surface, abstracted behind a trait so
//! `DecoderBuffers`/`Decoder` contain no ioctl plumbing of their own.
//!
//! This is the "minimal device-capability interface" the external
//! interfaces section calls out: query/enumerate formats, get/set format,
//! allocate/map/enqueue/dequeue buffers, stream on/off, and the
//! source-change/end-of-stream event subscription M2M decoding needs.

use std::os::unix::io::RawFd;

use crate::error::PlayerError;

/// Which queue an operation targets. Named after the stream's perspective
/// (`Input` = compressed NALs the stream feeds in, `Output` = decoded
/// pixels the stream reads back), matching the `side` field on
/// `DecoderBuffers` in the data model rather than the V4L2 OUTPUT/CAPTURE
/// naming (which is from the device's perspective and easy to transpose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Input,
    Output,
}

/// A pixel format the compositor can classify (derived from bit depth and
/// channel offsets, see `display::framebuffer`), plus the device's own
/// fourcc naming the caller should not need to interpret directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb565,
    Bgra8888,
    /// Decoder-native YUV (e.g. NV12) on the output side; compositing
    /// always goes through whatever the decoder actually produces, never
    /// a format conversion the player performs itself (non-goal).
    Yuv420,
}

/// One frame-size descriptor the device reports for a given pixel format:
/// either a single discrete size or a continuous/stepwise range.
#[derive(Debug, Clone, Copy)]
pub enum FrameSizeDesc {
    Discrete { width: u32, height: u32 },
    Stepwise {
        min_width: u32,
        max_width: u32,
        min_height: u32,
        max_height: u32,
        step_width: u32,
        step_height: u32,
    },
}

/// Result of `query_formats`: every format/size pair the device reports,
/// plus whether the caller's desired format was among them.
#[derive(Debug, Clone)]
pub struct FormatQuery {
    pub formats: Vec<(PixelFormat, Vec<FrameSizeDesc>)>,
    pub desired_present: bool,
}

/// The visible sub-region of a coded frame, reported by the device after
/// `set_format` when requested. The compositor draws this region, not the
/// coded (possibly padded) dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Negotiated format, read back after `set_format`.
#[derive(Debug, Clone)]
pub struct NegotiatedFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes_per_line: Vec<u32>,
    pub size_per_plane: Vec<u32>,
    pub composition_rect: Option<CompositionRect>,
}

/// A raw, unmapped memory region description for one plane of one
/// allocated buffer, as reported by the device after `alloc`.
#[derive(Debug, Clone, Copy)]
pub struct PlaneAllocation {
    pub length: usize,
    pub mem_offset: usize,
}

/// Out-of-band device events the decoder subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderEvent {
    /// The capture side's negotiated format no longer matches the stream
    /// (resolution change). The capture side must be torn down and
    /// reinitialized.
    SourceChange,
    EndOfStream,
}

/// A dequeued buffer: which buffer index completed, and its timestamp
/// field (encoding `iSeq` on the input side; device-assigned on output).
#[derive(Debug, Clone, Copy)]
pub struct Dequeued {
    pub index: usize,
    pub sec: u64,
    pub usec: u64,
    pub bytes_used: usize,
}

/// The kernel video-codec device capability surface.
///
/// Implementations are expected to be non-blocking: `dequeue` returns
/// `PlayerError::WouldBlock` rather than blocking when nothing is ready,
/// and readiness is instead delivered by registering `poll_fd()` with the
/// player's poll set.
pub trait DecoderDevice {
    fn poll_fd(&self) -> RawFd;

    fn query_formats(&self, side: Side, desired: PixelFormat) -> Result<FormatQuery, PlayerError>;

    fn set_format(
        &mut self,
        side: Side,
        format: PixelFormat,
        planes_per_buffer: usize,
        size_per_plane: &[u32],
        read_composition_rect: bool,
    ) -> Result<NegotiatedFormat, PlayerError>;

    /// Request `count` buffers; returns the number actually granted
    /// (`alloc(.., 0)` deallocates and returns 0).
    fn alloc(&mut self, side: Side, count: usize) -> Result<Vec<Vec<PlaneAllocation>>, PlayerError>;

    /// Map one plane of one buffer into process memory. Returns a raw
    /// pointer/length pair; the caller (`decoder::buffer::MappedRegion`)
    /// is responsible for unmapping in reverse acquisition order.
    fn mmap_plane(&self, side: Side, buffer_index: usize, plane_index: usize) -> Result<(*mut u8, usize), PlayerError>;

    fn enqueue(&mut self, side: Side, buffer_index: usize, bytes_used: &[usize], timestamp: Option<(u64, u64)>) -> Result<(), PlayerError>;

    fn dequeue(&mut self, side: Side) -> Result<Dequeued, PlayerError>;

    fn start(&mut self, side: Side) -> Result<(), PlayerError>;
    fn stop(&mut self, side: Side) -> Result<(), PlayerError>;

    fn subscribe_event(&mut self, event: DecoderEvent) -> Result<(), PlayerError>;

    /// Drain and classify any pending device events (source-change,
    /// end-of-stream) without blocking.
    fn dequeue_events(&mut self) -> Vec<DecoderEvent>;

    /// Read the device's authoritative minimum-queued-buffers control for
    /// the capture side (spec: "the minimum-queued count for the capture
    /// side is authoritative").
    fn min_buffers_for_capture(&self) -> Result<usize, PlayerError>;
}
