//! Per-access-unit metadata and the appendable byte container NALs are
//! copied into, plus the `filled`/`reusable` pool pair a `StreamContext`
//! pulls from and returns to.

use std::collections::VecDeque;
use std::time::Instant;

/// H.264 NAL unit type (low 5 bits of the byte following the start code).
pub type NalType = u8;

/// Counts, per NAL type, how many times it appeared while filling a frame.
/// A fixed-size array indexed by NAL type (0..=31) avoids a hash map for
/// what is a tiny, frequently-mutated counter set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NalTypeCounts([u32; 32]);

impl NalTypeCounts {
    pub fn increment(&mut self, nal_type: NalType) {
        self.0[(nal_type & 0x1F) as usize] += 1;
    }

    pub fn count(&self, nal_type: NalType) -> u32 {
        self.0[(nal_type & 0x1F) as usize]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    /// True if the set of NAL types present (count > 0) equals exactly
    /// `wanted`, ignoring types not listed in `wanted`'s complement.
    pub fn types_present(&self) -> Vec<NalType> {
        (0u8..32)
            .filter(|&t| self.0[t as usize] > 0)
            .collect()
    }

    pub fn reset(&mut self) {
        self.0 = [0; 32];
    }
}

/// One H.264 access unit: the concatenation of NALs between the parser's
/// boundary decisions, plus bookkeeping used by acceptance filtering,
/// decoder feeding, and frame-state reconciliation.
#[derive(Debug)]
pub struct Frame {
    /// Raw payload, NALs concatenated without start codes (the decoder
    /// input queue wants a pure Annex-B/bitstream region per plane; the
    /// 4-byte start code is re-added by the stream context when copying
    /// into the decoder's input plane so `openh264`/V4L2-style decoders
    /// that expect Annex-B framing see a faithful re-encoding).
    pub data: Vec<u8>,
    pub nal_counts: NalTypeCounts,
    pub is_invalid: bool,
    pub is_independent: bool,
    pub arrived_at: Option<Instant>,
    pub processed_at: Option<Instant>,
    pub i_seq: u64,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            nal_counts: NalTypeCounts::default(),
            is_invalid: false,
            is_independent: false,
            arrived_at: None,
            processed_at: None,
            i_seq: 0,
        }
    }

    /// Reset metadata but keep the byte vector's capacity — this is the
    /// whole point of pooling frames instead of allocating fresh ones.
    fn reset_for_fill(&mut self) {
        self.data.clear();
        self.nal_counts.reset();
        self.is_invalid = false;
        self.is_independent = false;
        self.arrived_at = Some(Instant::now());
        self.processed_at = None;
        self.i_seq = 0;
    }

    pub fn has_vcl(&self) -> bool {
        (1u8..=5).any(|t| self.nal_counts.count(t) > 0)
    }

    /// Accepted access-unit shapes per the parser's emission filter: either
    /// `{SPS, PPS, IDR}` optionally with SEI, or a lone `{non-IDR slice}`.
    pub fn matches_accepted_shape(&self) -> bool {
        let present = self.nal_counts.types_present();
        let is_idr_au = present.iter().all(|&t| matches!(t, 7 | 8 | 5 | 6))
            && self.nal_counts.count(7) > 0
            && self.nal_counts.count(8) > 0
            && self.nal_counts.count(5) > 0;
        let is_slice_only = present.iter().all(|&t| t == 1) && self.nal_counts.count(1) > 0;
        is_idr_au || is_slice_only
    }

    /// Whether this frame, as currently filled, is eligible for the
    /// `filled` queue: non-empty, not invalidated, has at least one VCL
    /// NAL, and matches one of the two accepted shapes.
    pub fn is_emittable(&self) -> bool {
        !self.data.is_empty() && !self.is_invalid && self.has_vcl() && self.matches_accepted_shape()
    }
}

/// One entry in a `StreamContext`'s frame-state log: records when an input
/// frame was fed so an output dequeue can be reconciled against it via its
/// encoded `iSeq`.
#[derive(Debug, Clone, Copy)]
pub struct FrameStateEntry {
    pub i_seq: u64,
    pub arrived_at: Instant,
    pub fed_at: Instant,
    pub is_independent: bool,
}

/// Ordered (newest first) log of fed-but-not-yet-reconciled frames.
///
/// Entries are pushed on enqueue and removed, oldest first, once a
/// dequeued output's `iSeq` is greater than or equal to the trailing
/// entry's `iSeq`: anything left behind when a newer-or-equal `iSeq`
/// arrives was effectively skipped by the decoder and is dropped
/// without counting as reconciled.
#[derive(Debug, Default)]
pub struct FrameStateLog {
    // Back is oldest (FIFO fed order); front is newest.
    entries: VecDeque<FrameStateEntry>,
}

impl FrameStateLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_fed(&mut self, entry: FrameStateEntry) {
        debug_assert!(
            self.entries.front().map(|e| e.i_seq < entry.i_seq).unwrap_or(true),
            "iSeq must be strictly increasing within a stream"
        );
        self.entries.push_front(entry);
    }

    /// Reconcile a dequeued output against the log. Returns the matching
    /// entry (if `i_seq` is found) plus the count of older entries dropped
    /// along the way. A dropped entry without an exact match means that
    /// fed frame was skipped by the decoder (its output was never dequeued
    /// before a newer `iSeq` arrived) — the caller folds that count into
    /// the per-stream skipped-frame statistic.
    ///
    /// Any entries older (smaller `i_seq`) than `i_seq` are dropped: a
    /// dequeue with an equal-or-greater sequence number means those older
    /// frames were skipped by the decoder.
    pub fn reconcile(&mut self, i_seq: u64) -> (Option<FrameStateEntry>, usize) {
        let mut found = None;
        let mut skipped = 0usize;
        // Oldest entries are at the back; drop from the back while they're
        // older than or equal to i_seq, remembering an exact match.
        while let Some(back) = self.entries.back() {
            if back.i_seq < i_seq {
                self.entries.pop_back();
                skipped += 1;
            } else if back.i_seq == i_seq {
                found = self.entries.pop_back();
                break;
            } else {
                break;
            }
        }
        (found, skipped)
    }

    pub fn max_tracked(&self) -> Option<u64> {
        self.entries.front().map(|e| e.i_seq)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Encodes a monotonic `iSeq` into the `(sec, usec)` pair the decoder's
/// timestamp field carries, per the external timestamp-encoding contract.
pub fn i_seq_to_timestamp(i_seq: u64) -> (u64, u64) {
    (i_seq / 1000, i_seq % 1000)
}

/// Inverse of [`i_seq_to_timestamp`].
pub fn timestamp_to_i_seq(sec: u64, usec: u64) -> u64 {
    sec * 1000 + usec
}

/// Owns the `filled` (ready to feed) and `reusable` (pooled, empty) frame
/// queues for one stream, plus the running sequence counter.
#[derive(Debug, Default)]
pub struct FramePool {
    filled: VecDeque<Frame>,
    reusable: VecDeque<Frame>,
    next_i_seq: u64,
    pub ignored_count: u64,
}

impl FramePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull a frame to fill: reuse a pooled one if available, else
    /// allocate. Metadata is reset; capacity is preserved.
    pub fn pull_for_fill(&mut self) -> Frame {
        let mut frame = self.reusable.pop_front().unwrap_or_else(Frame::new);
        frame.reset_for_fill();
        frame
    }

    /// Return a frame to the pool without it ever reaching `filled`
    /// (rejected by the acceptance filter).
    pub fn return_ignored(&mut self, frame: Frame) {
        self.ignored_count += 1;
        self.reusable.push_back(frame);
    }

    /// Commit a filled frame: assigns it the next `iSeq` and pushes it onto
    /// the `filled` queue.
    pub fn commit_filled(&mut self, mut frame: Frame) {
        frame.i_seq = self.next_i_seq;
        self.next_i_seq += 1;
        self.filled.push_back(frame);
    }

    pub fn peek_filled(&self) -> Option<&Frame> {
        self.filled.front()
    }

    pub fn pop_filled(&mut self) -> Option<Frame> {
        self.filled.pop_front()
    }

    pub fn filled_len(&self) -> usize {
        self.filled.len()
    }

    pub fn return_to_pool(&mut self, frame: Frame) {
        self.reusable.push_back(frame);
    }

    /// Drop every pending `filled` frame (network resync: cheaper to
    /// resync than feed stale references after a reconnect). Each dropped
    /// frame is recycled into `reusable` rather than freed.
    pub fn drain_filled(&mut self) {
        while let Some(f) = self.filled.pop_front() {
            self.reusable.push_back(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepted_shape_idr_group() {
        let mut f = Frame::new();
        f.nal_counts.increment(7);
        f.nal_counts.increment(8);
        f.nal_counts.increment(5);
        f.data.push(0);
        assert!(f.matches_accepted_shape());
        assert!(f.is_emittable());
    }

    #[test]
    fn accepted_shape_idr_group_with_sei() {
        let mut f = Frame::new();
        f.nal_counts.increment(7);
        f.nal_counts.increment(8);
        f.nal_counts.increment(5);
        f.nal_counts.increment(6);
        f.data.push(0);
        assert!(f.matches_accepted_shape());
    }

    #[test]
    fn accepted_shape_lone_non_idr_slice() {
        let mut f = Frame::new();
        f.nal_counts.increment(1);
        f.data.push(0);
        assert!(f.matches_accepted_shape());
    }

    #[test]
    fn rejects_missing_vcl() {
        let mut f = Frame::new();
        f.nal_counts.increment(7);
        f.nal_counts.increment(8);
        f.data.push(0);
        assert!(!f.matches_accepted_shape());
        assert!(!f.is_emittable());
    }

    #[test]
    fn rejects_mixed_idr_and_slice() {
        let mut f = Frame::new();
        f.nal_counts.increment(7);
        f.nal_counts.increment(8);
        f.nal_counts.increment(5);
        f.nal_counts.increment(1);
        f.data.push(0);
        assert!(!f.matches_accepted_shape());
    }

    #[test]
    fn rejects_invalid_flag() {
        let mut f = Frame::new();
        f.nal_counts.increment(1);
        f.data.push(0);
        f.is_invalid = true;
        assert!(!f.is_emittable());
    }

    #[test]
    fn pool_reuses_capacity() {
        let mut pool = FramePool::new();
        let mut f = pool.pull_for_fill();
        f.data.extend_from_slice(&[1, 2, 3, 4, 5]);
        let cap = f.data.capacity();
        pool.return_to_pool(f);
        let f2 = pool.pull_for_fill();
        assert!(f2.data.is_empty());
        assert!(f2.data.capacity() >= cap);
    }

    #[test]
    fn i_seq_assigned_monotonically() {
        let mut pool = FramePool::new();
        for _ in 0..5 {
            let f = pool.pull_for_fill();
            pool.commit_filled(f);
        }
        let mut last = None;
        while let Some(f) = pool.pop_filled() {
            if let Some(l) = last {
                assert!(f.i_seq > l);
            }
            last = Some(f.i_seq);
        }
    }

    #[test]
    fn timestamp_roundtrip() {
        for i_seq in [0u64, 1, 999, 1000, 1001, 4_294_967_295 * 1000 + 999] {
            let (sec, usec) = i_seq_to_timestamp(i_seq);
            assert_eq!(timestamp_to_i_seq(sec, usec), i_seq);
        }
    }

    #[test]
    fn frame_state_log_reconciles_exact() {
        let mut log = FrameStateLog::new();
        let now = Instant::now();
        for i in 0..3u64 {
            log.push_fed(FrameStateEntry {
                i_seq: i,
                arrived_at: now,
                fed_at: now,
                is_independent: i == 0,
            });
        }
        assert_eq!(log.len(), 3);
        let (entry, skipped) = log.reconcile(1);
        let entry = entry.unwrap();
        assert_eq!(entry.i_seq, 1);
        // i_seq 0 was older than the reconciled entry and gets dropped too.
        assert_eq!(skipped, 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.max_tracked(), Some(2));
    }

    #[test]
    fn frame_state_log_reconcile_counts_every_skipped_entry() {
        let mut log = FrameStateLog::new();
        let now = Instant::now();
        for i in 0..5u64 {
            log.push_fed(FrameStateEntry {
                i_seq: i,
                arrived_at: now,
                fed_at: now,
                is_independent: i == 0,
            });
        }
        // Decoder dequeues i_seq=3 first: 0,1,2 were all skipped.
        let (entry, skipped) = log.reconcile(3);
        assert_eq!(entry.unwrap().i_seq, 3);
        assert_eq!(skipped, 3);
        assert_eq!(log.max_tracked(), Some(4));
    }

    #[test]
    fn frame_state_log_skip_when_greater_than_tracked() {
        let mut log = FrameStateLog::new();
        let now = Instant::now();
        log.push_fed(FrameStateEntry {
            i_seq: 5,
            arrived_at: now,
            fed_at: now,
            is_independent: true,
        });
        let (entry, skipped) = log.reconcile(9);
        assert!(entry.is_none());
        assert_eq!(skipped, 1);
        assert!(log.is_empty());
    }

    #[test]
    fn drain_filled_recycles_frames() {
        let mut pool = FramePool::new();
        for _ in 0..4 {
            let f = pool.pull_for_fill();
            pool.commit_filled(f);
        }
        assert_eq!(pool.filled_len(), 4);
        pool.drain_filled();
        assert_eq!(pool.filled_len(), 0);
        // Frames went back to the reusable pool, not lost.
        let _ = pool.pull_for_fill();
    }
}
