//! `Plane`/`Buffer`: the memory-mapped (or heap) regions `DecoderBuffers`
//! manages, with mmap release ordering guaranteed by `Drop`.

use crate::error::PlayerError;

/// An mmap'd region, unmapped in `Drop`. Plane release order (reverse of
/// acquisition) falls out of Rust's normal drop order for a `Vec<Plane>`
/// as long as planes are never reordered after `mmap()`, which
/// `DecoderBuffers` never does.
pub struct MappedRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapped region is exclusively owned by the `Plane` that holds
// it; no other code retains the pointer. `Buffer`s are moved between
// `DecoderBuffers`' unqueued/queued bookkeeping and the draw pipeline, both
// of which treat the region as plain bytes.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Wraps an already-mapped `(ptr, len)` pair as reported by
    /// `DecoderDevice::mmap_plane`. The region must have been produced by
    /// `mmap(2)` (or equivalent) so that `Drop` may `munmap` it.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr..ptr+len` was mapped for read/write by the device
        // adapter and is not touched by the kernel while queued; the
        // decoder's own enqueue/dequeue contract prevents the device from
        // writing into a buffer that is not currently queued to it.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; exclusive access is guaranteed by `Plane`
        // requiring `&mut self` here.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if !self.ptr.is_null() && self.len > 0 {
            // SAFETY: the region was mapped by the device adapter that
            // produced this `MappedRegion`; we own it exclusively.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

/// Backing storage for one plane: either a real mmap'd device region, or a
/// heap allocation (used by `decoder::mock` and by planes that are
/// deep-copied via `keep_last_as_clone`).
pub enum PlaneStorage {
    Mapped(MappedRegion),
    Heap(Vec<u8>),
}

/// One plane of a `Buffer`: a byte region, its length, bytes-per-line, and
/// (for real DMA-capable devices) an opaque descriptor the compositor
/// never interprets — it is only ever handed back to the device.
pub struct Plane {
    storage: PlaneStorage,
    pub bytes_per_line: u32,
    pub bytes_used: usize,
    pub dma_fd: Option<i32>,
}

impl Plane {
    pub fn mapped(region: MappedRegion, bytes_per_line: u32) -> Self {
        Self {
            storage: PlaneStorage::Mapped(region),
            bytes_per_line,
            bytes_used: 0,
            dma_fd: None,
        }
    }

    pub fn heap(len: usize, bytes_per_line: u32) -> Self {
        Self {
            storage: PlaneStorage::Heap(vec![0u8; len]),
            bytes_per_line,
            bytes_used: 0,
            dma_fd: None,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.storage {
            PlaneStorage::Mapped(r) => r.as_slice(),
            PlaneStorage::Heap(v) => v.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.storage {
            PlaneStorage::Mapped(r) => r.as_mut_slice(),
            PlaneStorage::Heap(v) => v.as_mut_slice(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.storage {
            PlaneStorage::Mapped(r) => r.len(),
            PlaneStorage::Heap(v) => v.len(),
        }
    }

    /// Deep-copy this plane's bytes into a fresh heap-backed plane, used
    /// by `keep_last_as_clone` so the original buffer can be re-enqueued
    /// to the device immediately.
    pub fn clone_to_heap(&self) -> Plane {
        Plane {
            storage: PlaneStorage::Heap(self.as_slice().to_vec()),
            bytes_per_line: self.bytes_per_line,
            bytes_used: self.bytes_used,
            dma_fd: None,
        }
    }
}

/// One buffer: a stable index (identity-stable for the device's lifetime)
/// and its ordered planes. `is_queued` is the source of truth for which of
/// `DecoderBuffers`' unqueued/queued partitions a buffer belongs to.
pub struct Buffer {
    pub index: usize,
    pub planes: Vec<Plane>,
    pub is_queued: bool,
}

impl Buffer {
    pub fn new(index: usize, planes: Vec<Plane>) -> Self {
        Self {
            index,
            planes,
            is_queued: false,
        }
    }

    /// Copies `payload` into plane 0, the decoder's only input plane.
    pub fn copy_into_plane0(&mut self, payload: &[u8]) -> Result<(), PlayerError> {
        let plane = self
            .planes
            .first_mut()
            .ok_or_else(|| PlayerError::TransientDevice {
                device: "decoder".into(),
                reason: "buffer has no planes".into(),
            })?;
        if payload.len() > plane.len() {
            return Err(PlayerError::TransientDevice {
                device: "decoder".into(),
                reason: format!(
                    "payload {} bytes exceeds plane capacity {} bytes",
                    payload.len(),
                    plane.len()
                ),
            });
        }
        plane.as_mut_slice()[..payload.len()].copy_from_slice(payload);
        plane.bytes_used = payload.len();
        Ok(())
    }

    pub fn deep_clone(&self) -> Buffer {
        Buffer {
            index: self.index,
            planes: self.planes.iter().map(Plane::clone_to_heap).collect(),
            is_queued: false,
        }
    }
}
