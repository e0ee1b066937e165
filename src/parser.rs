//! Streaming byte scanner that detects Annex-B start codes, classifies NAL
//! units, groups them into H.264 access units per the boundary rules below,
//! and emits completed frames that pass the acceptance filter.
//!
//! The parser owns no frame queues itself — it is fed a [`FrameSink`] (the
//! `StreamContext`'s [`crate::frame::FramePool`]) on every call so the
//! pooling/reuse policy lives in one place.

use crate::frame::{Frame, NalType};

/// Named NAL unit types used by the boundary/invalidation rules below.
pub mod nal_type {
    use crate::frame::NalType;
    pub const SLICE_NON_IDR: NalType = 1;
    pub const SLICE_IDR: NalType = 5;
    pub const SEI: NalType = 6;
    pub const SPS: NalType = 7;
    pub const PPS: NalType = 8;
    pub const AU_DELIMITER: NalType = 9;
    pub const END_OF_SEQUENCE: NalType = 10;
}

/// Sink a [`NalParser`] pulls fresh frames from and returns completed ones
/// to, implemented by [`crate::frame::FramePool`].
pub trait FrameSink {
    fn pull_for_fill(&mut self) -> Frame;
    fn commit_filled(&mut self, frame: Frame);
    fn return_ignored(&mut self, frame: Frame);
    fn drain_filled(&mut self);
}

impl FrameSink for crate::frame::FramePool {
    fn pull_for_fill(&mut self) -> Frame {
        crate::frame::FramePool::pull_for_fill(self)
    }
    fn commit_filled(&mut self, frame: Frame) {
        crate::frame::FramePool::commit_filled(self, frame)
    }
    fn return_ignored(&mut self, frame: Frame) {
        crate::frame::FramePool::return_ignored(self, frame)
    }
    fn drain_filled(&mut self) {
        crate::frame::FramePool::drain_filled(self)
    }
}

/// Byte-level Annex-B scanner and access-unit assembler.
///
/// Only the canonical 4-byte start code (`00 00 00 01`) begins a NAL; a
/// bare 3-byte `00 00 01` is left as ordinary payload bytes, per design.
pub struct NalParser {
    zero_run: u32,
    awaiting_header: bool,
    current_nal_type: Option<NalType>,
    prev_completed_nal_type: Option<NalType>,
    filling: Option<Frame>,
    /// Networked sources drain `filled` on a new independent frame since
    /// resyncing is cheaper than feeding stale references after a
    /// reconnect; file sources never drain.
    networked: bool,
    pub nals_started: u64,
    pub nals_completed: u64,
}

impl NalParser {
    pub fn new(networked: bool) -> Self {
        Self {
            zero_run: 0,
            awaiting_header: false,
            current_nal_type: None,
            prev_completed_nal_type: None,
            filling: None,
            networked,
            nals_started: 0,
            nals_completed: 0,
        }
    }

    /// Feed a chunk of bytes from the source into the scanner.
    pub fn feed(&mut self, sink: &mut dyn FrameSink, bytes: &[u8]) {
        for &b in bytes {
            self.feed_byte(sink, b);
        }
    }

    fn feed_byte(&mut self, sink: &mut dyn FrameSink, b: u8) {
        if self.awaiting_header {
            self.awaiting_header = false;
            self.begin_nal(sink, b);
            return;
        }
        match b {
            0x00 => self.zero_run += 1,
            0x01 if self.zero_run >= 3 => {
                self.zero_run = 0;
                self.on_start_code(sink);
            }
            other => {
                self.flush_zero_run_as_payload(sink);
                self.append_byte(sink, other);
            }
        }
    }

    fn flush_zero_run_as_payload(&mut self, sink: &mut dyn FrameSink) {
        let n = self.zero_run;
        self.zero_run = 0;
        for _ in 0..n {
            self.append_byte(sink, 0x00);
        }
    }

    fn append_byte(&mut self, sink: &mut dyn FrameSink, b: u8) {
        if self.current_nal_type.is_some() {
            self.filling_mut(sink).data.push(b);
        }
        // Bytes outside any NAL (before the very first start code) are
        // discarded: there is nothing to append them to.
    }

    fn filling_mut(&mut self, sink: &mut dyn FrameSink) -> &mut Frame {
        self.filling.get_or_insert_with(|| sink.pull_for_fill())
    }

    fn current_has_vcl(&self) -> bool {
        self.filling.as_ref().map(Frame::has_vcl).unwrap_or(false)
    }

    fn current_is_empty(&self) -> bool {
        self.filling.as_ref().map(|f| f.data.is_empty()).unwrap_or(true)
    }

    fn on_start_code(&mut self, sink: &mut dyn FrameSink) {
        self.nals_started += 1;
        if let Some(t) = self.current_nal_type.take() {
            self.nals_completed += 1;
            self.prev_completed_nal_type = Some(t);
            if t == nal_type::END_OF_SEQUENCE {
                // Boundary policy: the new frame opens *after* this NAL is
                // appended, i.e. end-of-sequence stays in the current frame.
                self.rotate_frame(sink);
            }
        }
        self.awaiting_header = true;
    }

    fn begin_nal(&mut self, sink: &mut dyn FrameSink, header_byte: u8) {
        let nal_type = header_byte & 0x1F;
        let should_rotate_before = match nal_type {
            t if t == nal_type::AU_DELIMITER => !self.current_is_empty(),
            7 | 8 | 6 | 14..=18 => self.current_has_vcl(),
            1..=5 => self.current_has_vcl(),
            _ => false,
        };
        if should_rotate_before {
            self.rotate_frame(sink);
        }
        self.check_invalidation(sink, nal_type);

        let frame = self.filling_mut(sink);
        frame.nal_counts.increment(nal_type);
        frame.data.push(header_byte);
        self.current_nal_type = Some(nal_type);
    }

    fn check_invalidation(&mut self, sink: &mut dyn FrameSink, nal_type: NalType) {
        let invalid = match nal_type {
            13 => self.prev_completed_nal_type != Some(nal_type::SPS),
            19 => !self.current_has_vcl(),
            0 | 12 => !self.current_has_vcl(),
            20..=31 => !self.current_has_vcl(),
            _ => false,
        };
        if invalid {
            self.filling_mut(sink).is_invalid = true;
        }
    }

    /// Close out the in-progress NAL/frame (if any) and hand it to the sink
    /// for acceptance filtering. Frames never complete on their own at the
    /// end of a feed chunk — only a following start code or an explicit
    /// call to this method closes them — so a permanently-shutting-down
    /// stream should call this once to recycle whatever was in flight.
    pub fn finish(&mut self, sink: &mut dyn FrameSink) {
        if self.current_nal_type.take().is_some() {
            self.nals_completed += 1;
        }
        self.rotate_frame(sink);
    }

    fn rotate_frame(&mut self, sink: &mut dyn FrameSink) {
        if let Some(mut frame) = self.filling.take() {
            frame.is_independent = frame.nal_counts.count(nal_type::SLICE_IDR) > 0;
            if frame.is_emittable() {
                if self.networked && frame.is_independent {
                    sink.drain_filled();
                }
                sink.commit_filled(frame);
            } else {
                sink.return_ignored(frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FramePool;

    fn start_code() -> [u8; 4] {
        [0x00, 0x00, 0x00, 0x01]
    }

    fn push_nal(buf: &mut Vec<u8>, header: u8, payload: &[u8]) {
        buf.extend_from_slice(&start_code());
        buf.push(header);
        buf.extend_from_slice(payload);
    }

    #[test]
    fn nals_started_counts_distinct_start_codes() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x67, &[1, 2, 3]); // SPS
        push_nal(&mut stream, 0x68, &[4, 5]); // PPS
        push_nal(&mut stream, 0x65, &[6, 7, 8]); // IDR
        parser.feed(&mut pool, &stream);
        assert_eq!(parser.nals_started, 3);
    }

    #[test]
    fn three_byte_start_code_not_honored() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        // A bare 3-byte prefix should not begin a NAL at all.
        let stream = vec![0x00, 0x00, 0x01, 0x67, 0x01, 0x02];
        parser.feed(&mut pool, &stream);
        assert_eq!(parser.nals_started, 0);
        assert_eq!(pool.filled_len(), 0);
    }

    #[test]
    fn idr_access_unit_emitted_on_next_au_boundary() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x67, &[0xAA]); // SPS
        push_nal(&mut stream, 0x68, &[0xBB]); // PPS
        push_nal(&mut stream, 0x65, &[0xCC, 0xDD]); // IDR
        push_nal(&mut stream, 0x09, &[0x10]); // AUD opens next AU
        parser.feed(&mut pool, &stream);

        assert_eq!(pool.filled_len(), 1);
        let frame = pool.pop_filled().unwrap();
        assert!(frame.is_independent);
        assert!(frame.matches_accepted_shape());
        assert_eq!(frame.nal_counts.count(7), 1);
        assert_eq!(frame.nal_counts.count(8), 1);
        assert_eq!(frame.nal_counts.count(5), 1);
    }

    #[test]
    fn lone_non_idr_slice_is_accepted_shape() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x41, &[0x01, 0x02]); // non-IDR slice, type 1
        push_nal(&mut stream, 0x41, &[0x03, 0x04]); // next AU's slice closes the first
        parser.feed(&mut pool, &stream);

        assert_eq!(pool.filled_len(), 1);
        let frame = pool.pop_filled().unwrap();
        assert!(!frame.is_independent);
        assert!(frame.matches_accepted_shape());
    }

    #[test]
    fn sei_allowed_alongside_idr_group() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x67, &[0xAA]);
        push_nal(&mut stream, 0x68, &[0xBB]);
        push_nal(&mut stream, 0x06, &[0xEE]); // SEI
        push_nal(&mut stream, 0x65, &[0xCC]);
        push_nal(&mut stream, 0x09, &[0x10]);
        parser.feed(&mut pool, &stream);

        let frame = pool.pop_filled().unwrap();
        assert!(frame.matches_accepted_shape());
    }

    /// Minimal [`FrameSink`] that keeps committed/ignored frames around for
    /// inspection instead of recycling them, so a test can check flags a
    /// real pool's reset-on-reuse would otherwise erase.
    #[derive(Default)]
    struct VecSink {
        filled: Vec<Frame>,
        ignored: Vec<Frame>,
        next_i_seq: u64,
    }

    impl FrameSink for VecSink {
        fn pull_for_fill(&mut self) -> Frame {
            let mut f = Frame::new();
            f.arrived_at = Some(std::time::Instant::now());
            f
        }
        fn commit_filled(&mut self, mut frame: Frame) {
            frame.i_seq = self.next_i_seq;
            self.next_i_seq += 1;
            self.filled.push(frame);
        }
        fn return_ignored(&mut self, frame: Frame) {
            self.ignored.push(frame);
        }
        fn drain_filled(&mut self) {
            self.filled.clear();
        }
    }

    #[test]
    fn nal13_invalid_unless_after_sps() {
        let mut sink = VecSink::default();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x65, &[0xCC]); // IDR slice first (has VCL)
        push_nal(&mut stream, 0x6D, &[0x01]); // type 13, not immediately after SPS(7)
        push_nal(&mut stream, 0x09, &[0x10]); // close AU
        parser.feed(&mut sink, &stream);

        assert_eq!(sink.filled.len(), 0);
        assert_eq!(sink.ignored.len(), 1);
        assert!(sink.ignored[0].is_invalid);
    }

    #[test]
    fn nal13_valid_immediately_after_sps_is_not_flagged_invalid() {
        let mut sink = VecSink::default();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x67, &[0xAA]); // SPS
        push_nal(&mut stream, 0x6D, &[0x01]); // type 13 right after SPS: valid
        push_nal(&mut stream, 0x68, &[0xBB]); // PPS
        push_nal(&mut stream, 0x65, &[0xCC]); // IDR
        push_nal(&mut stream, 0x09, &[0x10]);
        parser.feed(&mut sink, &stream);

        // Type 13 is never part of an accepted multiset, so the frame is
        // still discarded — but it is discarded as a shape mismatch, not
        // because of the NAL-13-placement invalidation rule.
        assert_eq!(sink.filled.len(), 0);
        assert_eq!(sink.ignored.len(), 1);
        assert!(!sink.ignored[0].is_invalid);
    }

    #[test]
    fn nal19_invalid_without_preceding_vcl() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x13, &[0x01]); // type 19, no VCL yet
        push_nal(&mut stream, 0x65, &[0xCC]); // then IDR
        push_nal(&mut stream, 0x09, &[0x10]);
        parser.feed(&mut pool, &stream);

        assert_eq!(pool.filled_len(), 0);
        assert_eq!(pool.ignored_count, 1);
    }

    #[test]
    fn networked_source_drains_filled_on_new_independent_frame() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(true);
        let mut stream = Vec::new();
        // First AU: a stale non-IDR slice frame.
        push_nal(&mut stream, 0x41, &[0x01]);
        push_nal(&mut stream, 0x41, &[0x02]); // closes first, opens second (also non-IDR)
        push_nal(&mut stream, 0x67, &[0xAA]); // SPS starts a fresh IDR group, closes second
        push_nal(&mut stream, 0x68, &[0xBB]);
        push_nal(&mut stream, 0x65, &[0xCC]);
        push_nal(&mut stream, 0x09, &[0x10]); // closes the IDR group
        parser.feed(&mut pool, &stream);

        // Only the IDR group should remain; the two stale non-IDR frames
        // were drained when the independent frame committed.
        assert_eq!(pool.filled_len(), 1);
        let frame = pool.pop_filled().unwrap();
        assert!(frame.is_independent);
    }

    #[test]
    fn file_source_does_not_drain_on_independent_frame() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x41, &[0x01]);
        push_nal(&mut stream, 0x67, &[0xAA]);
        push_nal(&mut stream, 0x68, &[0xBB]);
        push_nal(&mut stream, 0x65, &[0xCC]);
        push_nal(&mut stream, 0x09, &[0x10]);
        parser.feed(&mut pool, &stream);

        assert_eq!(pool.filled_len(), 2);
    }

    #[test]
    fn finish_recycles_in_progress_frame() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        push_nal(&mut stream, 0x67, &[0xAA]);
        parser.feed(&mut pool, &stream);
        assert_eq!(pool.filled_len(), 0);
        parser.finish(&mut pool);
        // SPS alone doesn't match an accepted shape, so it's ignored, not filled.
        assert_eq!(pool.filled_len(), 0);
        assert_eq!(pool.ignored_count, 1);
    }

    #[test]
    fn i_seq_strictly_increasing_across_many_aus() {
        let mut pool = FramePool::new();
        let mut parser = NalParser::new(false);
        let mut stream = Vec::new();
        for i in 0..20u8 {
            push_nal(&mut stream, 0x41, &[i]);
        }
        push_nal(&mut stream, 0x09, &[0]); // flush the last one
        parser.feed(&mut pool, &stream);

        let mut last = None;
        while let Some(f) = pool.pop_filled() {
            if let Some(l) = last {
                assert!(f.i_seq > l);
            }
            last = Some(f.i_seq);
        }
        assert!(last.is_some());
    }
}
