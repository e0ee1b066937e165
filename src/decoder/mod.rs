//! The per-stream kernel video decoder: buffer bookkeeping layered over a
//! `DecoderDevice`, plus the in-memory mock backend this crate ships by
//! default (see `decoder::mock` for why there is no real V4L2 backend
//! here: the raw ioctl/mmap surface is an explicit external collaborator,
//! not something this crate implements).

pub mod buffer;
pub mod device;
pub mod mock;

use std::collections::VecDeque;

use crate::error::PlayerError;
use crate::frame::i_seq_to_timestamp;
use buffer::Buffer;
use device::{CompositionRect, DecoderDevice, DecoderEvent, PixelFormat, Side};

/// Buffer bookkeeping for one side (input or output) of a decoder. Holds
/// every allocated `Buffer` plus the subset of indices not currently
/// queued to the device.
pub struct DecoderBuffers {
    side: Side,
    buffers: Vec<Buffer>,
    unqueued: VecDeque<usize>,
    pub bytes_per_line: Vec<u32>,
    pub width: u32,
    pub height: u32,
    pub composition_rect: Option<CompositionRect>,
}

impl DecoderBuffers {
    fn empty(side: Side) -> Self {
        Self {
            side,
            buffers: Vec::new(),
            unqueued: VecDeque::new(),
            bytes_per_line: Vec::new(),
            width: 0,
            height: 0,
            composition_rect: None,
        }
    }

    fn adopt(&mut self, buffers: Vec<Buffer>) {
        self.unqueued = (0..buffers.len()).collect();
        self.buffers = buffers;
    }

    pub fn count(&self) -> usize {
        self.buffers.len()
    }

    pub fn queued_count(&self) -> usize {
        self.buffers.len() - self.unqueued.len()
    }

    pub fn get(&self, index: usize) -> &Buffer {
        &self.buffers[index]
    }
}

/// Owns the device handle and both sides' buffer bookkeeping for one
/// stream's decoder. A resolution-change event is handled by tearing down
/// and reallocating `output` in place; `input` is unaffected.
pub struct Decoder {
    device: Box<dyn DecoderDevice>,
    pub input: DecoderBuffers,
    pub output: DecoderBuffers,
    min_output_buffers: usize,
    started_input: bool,
    started_output: bool,
}

impl Decoder {
    pub fn new(device: Box<dyn DecoderDevice>) -> Self {
        Self {
            device,
            input: DecoderBuffers::empty(Side::Input),
            output: DecoderBuffers::empty(Side::Output),
            min_output_buffers: 1,
            started_input: false,
            started_output: false,
        }
    }

    pub fn poll_fd(&self) -> std::os::unix::io::RawFd {
        self.device.poll_fd()
    }

    /// Negotiates the compressed input side and allocates `count` buffers
    /// of `buffer_size` bytes each (one plane per buffer: the bitstream is
    /// unstructured, so there is no per-plane layout to negotiate).
    pub fn open_input(&mut self, buffer_size: usize, count: usize) -> Result<(), PlayerError> {
        // The input side carries compressed NAL bytes, not pixels; the
        // pixel-format argument is unused by real backends here but kept
        // for a uniform `set_format` signature across both sides.
        self.device
            .set_format(Side::Input, PixelFormat::Yuv420, 1, &[buffer_size as u32], false)?;
        let allocs = self.device.alloc(Side::Input, count)?;
        self.adopt_allocations(Side::Input, allocs)?;
        self.device.subscribe_event(DecoderEvent::EndOfStream)?;
        self.device.start(Side::Input)?;
        self.started_input = true;
        Ok(())
    }

    /// Negotiates the decoded output side, honoring the device's
    /// authoritative minimum-queued-buffers control, and subscribes to
    /// source-change events.
    pub fn open_output(
        &mut self,
        pixel_format: PixelFormat,
        desired_count: usize,
    ) -> Result<(), PlayerError> {
        let query = self.device.query_formats(Side::Output, pixel_format)?;
        if !query.desired_present {
            return Err(PlayerError::FormatNotSupported {
                device: "decoder".into(),
                format: format!("{pixel_format:?}"),
            });
        }
        let negotiated = self
            .device
            .set_format(Side::Output, pixel_format, 1, &[0], true)?;
        self.output.bytes_per_line = negotiated.bytes_per_line.clone();
        self.output.width = negotiated.width;
        self.output.height = negotiated.height;
        self.output.composition_rect = negotiated.composition_rect;

        self.min_output_buffers = self.device.min_buffers_for_capture()?;
        let requested = desired_count.max(self.min_output_buffers);
        let allocs = self.device.alloc(Side::Output, requested)?;
        let granted = allocs.len();
        if granted < self.min_output_buffers {
            return Err(PlayerError::TransientDevice {
                device: "decoder".into(),
                reason: format!(
                    "output side granted {granted} buffers, below device minimum {}",
                    self.min_output_buffers
                ),
            });
        }
        if granted < requested {
            let e = PlayerError::UnderGrant {
                device: "decoder".into(),
                requested,
                granted,
            };
            tracing::warn!(error = %e, "decoder output under-allocated");
        }
        self.adopt_allocations(Side::Output, allocs)?;
        self.device.subscribe_event(DecoderEvent::SourceChange)?;

        for index in 0..self.output.buffers.len() {
            self.device.enqueue(Side::Output, index, &[0], None)?;
            self.output.buffers[index].is_queued = true;
        }
        self.output.unqueued.clear();
        self.device.start(Side::Output)?;
        self.started_output = true;
        Ok(())
    }

    fn adopt_allocations(
        &mut self,
        side: Side,
        allocs: Vec<Vec<device::PlaneAllocation>>,
    ) -> Result<(), PlayerError> {
        let mut buffers = Vec::with_capacity(allocs.len());
        for (buffer_index, planes) in allocs.into_iter().enumerate() {
            let mut out_planes = Vec::with_capacity(planes.len());
            for (plane_index, _alloc) in planes.iter().enumerate() {
                let (ptr, len) = self.device.mmap_plane(side, buffer_index, plane_index)?;
                let region = buffer::MappedRegion::new(ptr, len);
                let bytes_per_line = match side {
                    Side::Output => self
                        .output
                        .bytes_per_line
                        .get(plane_index)
                        .copied()
                        .unwrap_or(0),
                    Side::Input => 0,
                };
                out_planes.push(buffer::Plane::mapped(region, bytes_per_line));
            }
            buffers.push(Buffer::new(buffer_index, out_planes));
        }
        match side {
            Side::Input => self.input.adopt(buffers),
            Side::Output => self.output.adopt(buffers),
        }
        Ok(())
    }

    /// Feeds one coded frame: finds an unqueued input buffer, copies the
    /// payload into plane 0, and enqueues it with `iSeq` encoded as the
    /// buffer timestamp. Returns `Ok(false)` without consuming `payload`
    /// if no input buffer is currently free.
    pub fn feed(&mut self, i_seq: u64, payload: &[u8]) -> Result<bool, PlayerError> {
        let Some(index) = self.input.unqueued.pop_front() else {
            return Ok(false);
        };
        let buffer = &mut self.input.buffers[index];
        if let Err(e) = buffer.copy_into_plane0(payload) {
            self.input.unqueued.push_front(index);
            return Err(e);
        }
        let bytes_used = buffer.planes[0].bytes_used;
        let (sec, usec) = i_seq_to_timestamp(i_seq);
        self.device
            .enqueue(Side::Input, index, &[bytes_used], Some((sec, usec)))?;
        self.input.buffers[index].is_queued = true;
        Ok(true)
    }

    /// Dequeues one completed input buffer if available, returning the
    /// `iSeq` recovered from its timestamp and freeing the buffer for
    /// reuse by `feed`.
    pub fn try_dequeue_input(&mut self) -> Result<Option<u64>, PlayerError> {
        match self.device.dequeue(Side::Input) {
            Ok(dq) => {
                self.input.buffers[dq.index].is_queued = false;
                self.input.unqueued.push_back(dq.index);
                Ok(Some(crate::frame::timestamp_to_i_seq(dq.sec, dq.usec)))
            }
            Err(PlayerError::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Dequeues one completed output buffer if available, returning its
    /// index and the `iSeq` recovered from its timestamp (the decoder
    /// passes through whatever timestamp accompanied the matching fed
    /// input, per the external timestamp-encoding contract). The caller
    /// must call `release_output` once done reading it (after compositing,
    /// or after `keep_last_as_clone`).
    pub fn try_dequeue_output(&mut self) -> Result<Option<(usize, u64)>, PlayerError> {
        match self.device.dequeue(Side::Output) {
            Ok(dq) => {
                self.output.buffers[dq.index].is_queued = false;
                let i_seq = crate::frame::timestamp_to_i_seq(dq.sec, dq.usec);
                Ok(Some((dq.index, i_seq)))
            }
            Err(PlayerError::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn release_output(&mut self, index: usize) -> Result<(), PlayerError> {
        self.device.enqueue(Side::Output, index, &[0], None)?;
        self.output.buffers[index].is_queued = true;
        Ok(())
    }

    /// Deep-copies a dequeued output buffer's planes to the heap so the
    /// draw pipeline can hold onto the last decoded frame across the
    /// original buffer being re-enqueued to the device.
    pub fn keep_last_as_clone(&self, index: usize) -> Buffer {
        self.output.buffers[index].deep_clone()
    }

    pub fn poll_events(&mut self) -> Vec<DecoderEvent> {
        self.device.dequeue_events()
    }

    /// Tears down and reallocates the output side after a `SourceChange`
    /// event, per the resolution-change handling in the data model.
    pub fn reinit_output(
        &mut self,
        pixel_format: PixelFormat,
        desired_count: usize,
    ) -> Result<(), PlayerError> {
        if self.started_output {
            self.device.stop(Side::Output)?;
            self.device.alloc(Side::Output, 0)?;
            self.started_output = false;
        }
        self.output = DecoderBuffers::empty(Side::Output);
        self.open_output(pixel_format, desired_count)
    }

    pub fn stop_all(&mut self) -> Result<(), PlayerError> {
        if self.started_input {
            self.device.stop(Side::Input)?;
            self.started_input = false;
        }
        if self.started_output {
            self.device.stop(Side::Output)?;
            self.started_output = false;
        }
        Ok(())
    }
}
