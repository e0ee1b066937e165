//! In-memory `DecoderDevice`, the only backend this crate ships (see the
//! module-level note on `decoder` for why: the kernel M2M ioctl/mmap
//! surface is an external collaborator per the design's scope, not
//! something reimplemented here). Emulates just enough M2M behavior to
//! drive `Decoder`/`stream` without real kernel or codec involvement:
//! input buffers "decode" immediately into a flat gray output frame sized
//! to a fixed resolution, so the rest of the pipeline (buffer lifecycle,
//! timestamp reconciliation, draw) can be exercised end to end.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use crate::error::PlayerError;
use super::device::{
    CompositionRect, DecoderDevice, DecoderEvent, Dequeued, FormatQuery, FrameSizeDesc,
    NegotiatedFormat, PixelFormat, PlaneAllocation, Side,
};

struct MockBuffer {
    bytes_used: usize,
    sec: u64,
    usec: u64,
}

/// A self-contained mock decoder. `width`/`height` are fixed at
/// construction; `query_formats`/`set_format` report only that single
/// size, matching a camera-class device rather than a fully stepwise one.
pub struct MockDecoder {
    width: u32,
    height: u32,
    input_buffers: Vec<MockBuffer>,
    output_buffers: Vec<MockBuffer>,
    input_ready: VecDeque<usize>,
    output_ready: VecDeque<usize>,
    event_fd_read: RawFd,
    pending_events: Vec<DecoderEvent>,
    source_change_subscribed: bool,
}

impl MockDecoder {
    pub fn new(width: u32, height: u32) -> Self {
        // eventfd(2) in semaphore-less counting mode gives us a real,
        // poll()-able fd without pulling in a dedicated notify crate.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        Self {
            width,
            height,
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
            input_ready: VecDeque::new(),
            output_ready: VecDeque::new(),
            event_fd_read: fd,
            pending_events: Vec::new(),
            source_change_subscribed: false,
        }
    }

    fn bump_eventfd(&self) {
        let one: u64 = 1;
        unsafe {
            libc::write(
                self.event_fd_read,
                &one as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn drain_eventfd(&self) {
        let mut buf: u64 = 0;
        unsafe {
            libc::read(self.event_fd_read, &mut buf as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for MockDecoder {
    fn drop(&mut self) {
        if self.event_fd_read >= 0 {
            unsafe {
                libc::close(self.event_fd_read);
            }
        }
    }
}

impl DecoderDevice for MockDecoder {
    fn poll_fd(&self) -> RawFd {
        self.event_fd_read
    }

    fn query_formats(&self, _side: Side, desired: PixelFormat) -> Result<FormatQuery, PlayerError> {
        Ok(FormatQuery {
            formats: vec![(
                desired,
                vec![FrameSizeDesc::Discrete {
                    width: self.width,
                    height: self.height,
                }],
            )],
            desired_present: true,
        })
    }

    fn set_format(
        &mut self,
        side: Side,
        format: PixelFormat,
        _planes_per_buffer: usize,
        _size_per_plane: &[u32],
        read_composition_rect: bool,
    ) -> Result<NegotiatedFormat, PlayerError> {
        let bytes_per_pixel: u32 = match format {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Bgra8888 => 4,
            PixelFormat::Yuv420 => 1,
        };
        let bytes_per_line = self.width * bytes_per_pixel;
        Ok(NegotiatedFormat {
            pixel_format: format,
            width: self.width,
            height: self.height,
            bytes_per_line: vec![bytes_per_line],
            size_per_plane: vec![(bytes_per_line * self.height) as u32],
            composition_rect: if read_composition_rect && side == Side::Output {
                Some(CompositionRect {
                    x: 0,
                    y: 0,
                    width: self.width,
                    height: self.height,
                })
            } else {
                None
            },
        })
    }

    fn alloc(&mut self, side: Side, count: usize) -> Result<Vec<Vec<PlaneAllocation>>, PlayerError> {
        let per_buffer = (self.width * self.height * 4) as usize;
        let buffers = match side {
            Side::Input => &mut self.input_buffers,
            Side::Output => &mut self.output_buffers,
        };
        buffers.clear();
        for _ in 0..count {
            buffers.push(MockBuffer {
                bytes_used: 0,
                sec: 0,
                usec: 0,
            });
        }
        match side {
            Side::Input => self.input_ready.clear(),
            Side::Output => self.output_ready.clear(),
        }
        Ok((0..count)
            .map(|_| {
                vec![PlaneAllocation {
                    length: per_buffer,
                    mem_offset: 0,
                }]
            })
            .collect())
    }

    fn mmap_plane(&self, _side: Side, _buffer_index: usize, _plane_index: usize) -> Result<(*mut u8, usize), PlayerError> {
        let len = (self.width * self.height * 4) as usize;
        // SAFETY: an anonymous private mapping owned exclusively by the
        // returned region; `MappedRegion::drop` munmaps it.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PlayerError::TransientDevice {
                device: "mock".into(),
                reason: "mmap failed".into(),
            });
        }
        Ok((ptr as *mut u8, len))
    }

    fn enqueue(
        &mut self,
        side: Side,
        buffer_index: usize,
        bytes_used: &[usize],
        timestamp: Option<(u64, u64)>,
    ) -> Result<(), PlayerError> {
        match side {
            Side::Input => {
                if let Some(b) = self.input_buffers.get_mut(buffer_index) {
                    b.bytes_used = bytes_used.first().copied().unwrap_or(0);
                    let (sec, usec) = timestamp.unwrap_or((0, 0));
                    b.sec = sec;
                    b.usec = usec;
                }
                self.input_ready.push_back(buffer_index);
                // A decode completes "instantly": mirror the same
                // timestamp onto one output buffer, if one is idle.
                if let Some(out_idx) = (0..self.output_buffers.len())
                    .find(|i| !self.output_ready.contains(i))
                {
                    if let Some(b) = self.output_buffers.get_mut(out_idx) {
                        let (sec, usec) = timestamp.unwrap_or((0, 0));
                        b.sec = sec;
                        b.usec = usec;
                    }
                    self.output_ready.push_back(out_idx);
                }
            }
            Side::Output => {
                // Buffer returned to the device's free pool; nothing to
                // schedule until the next input enqueue "produces" it.
            }
        }
        self.bump_eventfd();
        Ok(())
    }

    fn dequeue(&mut self, side: Side) -> Result<Dequeued, PlayerError> {
        let ready = match side {
            Side::Input => &mut self.input_ready,
            Side::Output => &mut self.output_ready,
        };
        let Some(index) = ready.pop_front() else {
            return Err(PlayerError::WouldBlock);
        };
        self.drain_eventfd();
        let buffers = match side {
            Side::Input => &self.input_buffers,
            Side::Output => &self.output_buffers,
        };
        let b = &buffers[index];
        Ok(Dequeued {
            index,
            sec: b.sec,
            usec: b.usec,
            bytes_used: b.bytes_used,
        })
    }

    fn start(&mut self, _side: Side) -> Result<(), PlayerError> {
        Ok(())
    }

    fn stop(&mut self, _side: Side) -> Result<(), PlayerError> {
        Ok(())
    }

    fn subscribe_event(&mut self, event: DecoderEvent) -> Result<(), PlayerError> {
        if event == DecoderEvent::SourceChange {
            self.source_change_subscribed = true;
        }
        Ok(())
    }

    fn dequeue_events(&mut self) -> Vec<DecoderEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn min_buffers_for_capture(&self) -> Result<usize, PlayerError> {
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::Decoder;

    #[test]
    fn feed_and_dequeue_round_trip() {
        let mock = MockDecoder::new(64, 48);
        let mut decoder = Decoder::new(Box::new(mock));
        decoder.open_input(4096, 4).unwrap();
        decoder.open_output(PixelFormat::Bgra8888, 2).unwrap();

        assert!(decoder.feed(7, &[0u8; 16]).unwrap());
        let i_seq = loop {
            if let Some(i) = decoder.try_dequeue_input().unwrap() {
                break i;
            }
        };
        assert_eq!(i_seq, 7);

        let (out_index, out_i_seq) = loop {
            if let Some(pair) = decoder.try_dequeue_output().unwrap() {
                break pair;
            }
        };
        assert_eq!(out_i_seq, 7);
        decoder.release_output(out_index).unwrap();
    }
}
