//! Byte-addressable memory shared with the kernel.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Memory mapped from the device, or something standing in for it.
///
/// The other side of the mapping writes to it concurrently, so the region is
/// only ever touched through raw pointer copies and atomic cursor accesses,
/// never through Rust references to its contents.
///
/// # Safety
///
/// `as_ptr()` must return a pointer to `len()` bytes that stay valid for reads
/// and writes for as long as `self` is alive, aligned to at least 8 bytes.
pub unsafe trait SharedRegion: Send + Sync {
    fn as_ptr(&self) -> *mut u8;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `buf.len()` bytes starting at `offset` out of the region.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.len(), offset, buf.len())?;
        // SAFETY: the range was bounds checked and the trait contract
        // guarantees the pointer is valid for `len()` bytes.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().add(offset), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copies `bytes` into the region starting at `offset`.
    fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        check_bounds(self.len(), offset, bytes.len())?;
        // SAFETY: same as `read_at`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(offset), bytes.len()) };
        Ok(())
    }

    /// Atomically loads the `u32` at `offset`.
    fn load_u32(&self, offset: usize, order: Ordering) -> Result<u32> {
        Ok(self.atomic_u32(offset)?.load(order))
    }

    /// Atomically stores `val` at `offset`.
    fn store_u32(&self, offset: usize, val: u32, order: Ordering) -> Result<()> {
        self.atomic_u32(offset)?.store(val, order);
        Ok(())
    }

    #[doc(hidden)]
    fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        check_bounds(self.len(), offset, 4)?;
        if offset % 4 != 0 {
            return Err(Error::corrupt(format!("unaligned cursor offset {offset}")));
        }
        // SAFETY: in bounds, 4-byte aligned because the base is 8-byte aligned,
        // and the memory lives as long as `self`.
        Ok(unsafe { AtomicU32::from_ptr(self.as_ptr().add(offset).cast()) })
    }
}

fn check_bounds(len: usize, offset: usize, n: usize) -> Result<()> {
    match offset.checked_add(n) {
        Some(end) if end <= len => Ok(()),
        _ => Err(Error::corrupt(format!(
            "access of {n} bytes at {offset} is outside the {len} byte region"
        ))),
    }
}

// SAFETY: forwards to the inner region, which `Arc` keeps alive.
unsafe impl<R: SharedRegion> SharedRegion for Arc<R> {
    fn as_ptr(&self) -> *mut u8 {
        (**self).as_ptr()
    }

    fn len(&self) -> usize {
        (**self).len()
    }
}

/// Zeroed heap memory with the alignment of a real mapping.
///
/// Stands in for the device mapping when building fixtures or driving the ring
/// from a simulated kernel.
pub struct HeapRegion {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        Self { words, len }
    }

    /// Copies the whole region out.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = vec![0; self.len];
        // infallible: the range is the whole region
        let _ = self.read_at(0, &mut out);
        out
    }
}

// SAFETY: the words are 8-byte aligned, cover at least `len` bytes, and the
// atomics' interior mutability makes writes through the shared pointer sound.
unsafe impl SharedRegion for HeapRegion {
    fn as_ptr(&self) -> *mut u8 {
        self.words.as_ptr().cast_mut().cast()
    }

    fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_region_is_zeroed_and_aligned() {
        let region = HeapRegion::new(13);
        assert_eq!(region.len(), 13);
        assert_eq!(region.as_ptr() as usize % 8, 0);
        assert_eq!(region.snapshot(), vec![0; 13]);
    }

    #[test]
    fn reads_back_writes() {
        let region = HeapRegion::new(64);
        region.write_at(10, &[1, 2, 3]).unwrap();
        let mut buf = [0; 4];
        region.read_at(9, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        region.store_u32(12, 0xdead_beef, Ordering::Release).unwrap();
        assert_eq!(region.load_u32(12, Ordering::Acquire).unwrap(), 0xdead_beef);
        assert_eq!(&region.snapshot()[12..16], &0xdead_beefu32.to_ne_bytes());
    }

    #[test]
    fn out_of_bounds_access_is_corruption() {
        let region = HeapRegion::new(16);
        let e = region.write_at(14, &[0; 4]).expect_err("past the end");
        assert!(e.is_fatal());
        assert!(region.load_u32(16, Ordering::Acquire).is_err());
        assert!(region.load_u32(usize::MAX, Ordering::Acquire).is_err());
        assert!(region.load_u32(2, Ordering::Acquire).is_err());
    }

    #[test]
    fn shared_through_arc() {
        let region = Arc::new(HeapRegion::new(8));
        let other = Arc::clone(&region);
        other.write_at(0, &[7]).unwrap();
        assert_eq!(region.snapshot()[0], 7);
    }
}
