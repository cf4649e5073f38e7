//! DMA staging memory.
//!
//! A [`DmaBuffer`] is a fixed, page-aligned allocation that RDMA reads and
//! writes land in. Buffers are shared between the agent thread and the
//! file-service thread through `Arc`, so all access goes through interior
//! mutability; the protocol guarantees each byte range has a single writer
//! at any time (the engine hands a range to the file service and does not
//! touch it again until the slot's result word flips).

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

const PAGE_SIZE: usize = 4096;

pub struct DmaBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    pub fn zeroed(len: usize) -> Arc<Self> {
        assert!(len > 0);
        let layout = Layout::from_size_align(len, PAGE_SIZE.min(len.next_power_of_two())).unwrap();
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Arc::new(DmaBuffer { ptr, len, layout })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// # Safety
    ///
    /// The caller must hold the only reference that reads or writes
    /// `[off, off + len)` for the lifetime of the returned slice.
    #[inline]
    pub unsafe fn slice(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.len);
        std::slice::from_raw_parts(self.ptr.as_ptr().add(off), len)
    }

    /// # Safety
    ///
    /// Same single-writer requirement as [`DmaBuffer::slice`].
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn slice_mut(&self, off: usize, len: usize) -> &mut [u8] {
        assert!(off + len <= self.len);
        std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(off), len)
    }

    /// Reads a little-endian u32 at `off`.
    #[inline]
    pub fn read_u32(&self, off: usize) -> u32 {
        let bytes: &[u8] = unsafe { self.slice(off, 4) };
        u32::from_le_bytes(bytes.try_into().unwrap())
    }

    /// Writes a little-endian u32 at `off`.
    #[inline]
    pub fn write_u32(&self, off: usize, val: u32) {
        let bytes = unsafe { self.slice_mut(off, 4) };
        bytes.copy_from_slice(&val.to_le_bytes());
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A logical byte range in a staging arena that may straddle the ring
/// wrap. `second_len == 0` means the range is contiguous; a split range's
/// second part always starts at offset 0 of the arena.
#[derive(Clone)]
pub struct SplittableBuffer {
    arena: Arc<DmaBuffer>,
    pub first_off: usize,
    pub first_len: usize,
    pub second_len: usize,
}

impl SplittableBuffer {
    pub fn new(arena: Arc<DmaBuffer>, at: usize, total: usize) -> Self {
        let capacity = arena.len();
        assert!(total <= capacity);
        let at = at % capacity;
        if at + total <= capacity {
            SplittableBuffer {
                arena,
                first_off: at,
                first_len: total,
                second_len: 0,
            }
        } else {
            let first_len = capacity - at;
            SplittableBuffer {
                arena,
                first_off: at,
                first_len,
                second_len: total - first_len,
            }
        }
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.first_len + self.second_len
    }

    #[inline]
    pub fn is_split(&self) -> bool {
        self.second_len != 0
    }

    /// Copies the whole range out into `dst`.
    pub fn copy_to(&self, dst: &mut [u8]) {
        assert_eq!(dst.len(), self.total_len());
        unsafe {
            dst[..self.first_len].copy_from_slice(self.arena.slice(self.first_off, self.first_len));
            if self.second_len > 0 {
                dst[self.first_len..].copy_from_slice(self.arena.slice(0, self.second_len));
            }
        }
    }

    /// Fills the whole range from `src`.
    pub fn copy_from(&self, src: &[u8]) {
        assert_eq!(src.len(), self.total_len());
        unsafe {
            self.arena
                .slice_mut(self.first_off, self.first_len)
                .copy_from_slice(&src[..self.first_len]);
            if self.second_len > 0 {
                self.arena
                    .slice_mut(0, self.second_len)
                    .copy_from_slice(&src[self.first_len..]);
            }
        }
    }
}

impl std::fmt::Debug for SplittableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplittableBuffer")
            .field("first_off", &self.first_off)
            .field("first_len", &self.first_len)
            .field("second_len", &self.second_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_range() {
        let arena = DmaBuffer::zeroed(4096);
        let sb = SplittableBuffer::new(arena, 100, 32);
        assert!(!sb.is_split());
        assert_eq!(sb.total_len(), 32);

        sb.copy_from(&[7u8; 32]);
        let mut out = [0u8; 32];
        sb.copy_to(&mut out);
        assert_eq!(out, [7u8; 32]);
    }

    #[test]
    fn split_range_wraps_to_start() {
        let arena = DmaBuffer::zeroed(4096);
        let sb = SplittableBuffer::new(arena.clone(), 4080, 48);
        assert!(sb.is_split());
        assert_eq!(sb.first_off, 4080);
        assert_eq!(sb.first_len, 16);
        assert_eq!(sb.second_len, 32);

        let src: Vec<u8> = (0..48).collect();
        sb.copy_from(&src);
        assert_eq!(unsafe { arena.slice(4080, 16) }, &src[..16]);
        assert_eq!(unsafe { arena.slice(0, 32) }, &src[16..]);
    }
}
