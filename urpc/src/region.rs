//! Offset-addressed view over mapped memory.
//!
//! Every access to the shared segment and to the private mirror goes
//! through [`Region`], so bounds and alignment are checked in one place.
//! Scalar fields shared with the other process are accessed as atomics.

use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// A contiguous range of memory addressed by byte offset.
#[derive(Clone, Copy)]
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Creates a region from a base pointer and length.
    ///
    /// # Safety
    /// `base` must be valid for `len` bytes, 8-byte aligned, and outlive
    /// every copy of the returned view.
    pub unsafe fn from_raw(base: NonNull<u8>, len: usize) -> Self {
        debug_assert!((base.as_ptr() as usize).is_multiple_of(8));
        Self { base, len }
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
        self.base.as_ptr()
    }

    /// Absolute address of `off`, as handed to a DMA engine.
    #[inline]
    pub fn addr(&self, off: usize) -> u64 {
        self.check(off, 0, 1);
        self.base.as_ptr() as u64 + off as u64
    }

    /// Sub-view of `len` bytes starting at `off`.
    pub fn sub(&self, off: usize, len: usize) -> Region {
        self.check(off, len, 8);
        // SAFETY: in bounds of self, alignment checked above.
        unsafe { Region::from_raw(NonNull::new_unchecked(self.as_ptr().add(off)), len) }
    }

    #[inline]
    fn check(&self, off: usize, size: usize, align: usize) {
        assert!(
            off.checked_add(size).is_some_and(|end| end <= self.len),
            "access [{off}, +{size}) out of bounds (len={})",
            self.len
        );
        assert!(off.is_multiple_of(align), "offset {off} not {align}-byte aligned");
    }

    #[inline]
    fn atomic_u64(&self, off: usize) -> &AtomicU64 {
        self.check(off, 8, 8);
        unsafe { &*(self.as_ptr().add(off) as *const AtomicU64) }
    }

    #[inline]
    fn atomic_i64(&self, off: usize) -> &AtomicI64 {
        self.check(off, 8, 8);
        unsafe { &*(self.as_ptr().add(off) as *const AtomicI64) }
    }

    #[inline]
    fn atomic_u32(&self, off: usize) -> &AtomicU32 {
        self.check(off, 4, 4);
        unsafe { &*(self.as_ptr().add(off) as *const AtomicU32) }
    }

    #[inline]
    pub fn load_u64(&self, off: usize) -> u64 {
        self.atomic_u64(off).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u64(&self, off: usize, value: u64) {
        self.atomic_u64(off).store(value, Ordering::Release)
    }

    #[inline]
    pub fn load_i64(&self, off: usize) -> i64 {
        self.atomic_i64(off).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_i64(&self, off: usize, value: i64) {
        self.atomic_i64(off).store(value, Ordering::Release)
    }

    #[inline]
    pub fn load_u32(&self, off: usize) -> u32 {
        self.atomic_u32(off).load(Ordering::Acquire)
    }

    #[inline]
    pub fn store_u32(&self, off: usize, value: u32) {
        self.atomic_u32(off).store(value, Ordering::Release)
    }

    /// Atomically ORs `bits` into the u32 at `off`.
    #[inline]
    pub fn or_u32(&self, off: usize, bits: u32) {
        self.atomic_u32(off).fetch_or(bits, Ordering::AcqRel);
    }

    /// Atomically clears `bits` in the u32 at `off`.
    #[inline]
    pub fn clear_u32(&self, off: usize, bits: u32) {
        self.atomic_u32(off).fetch_and(!bits, Ordering::AcqRel);
    }

    /// Copies `src` into the region at `off`.
    pub fn write_bytes(&self, off: usize, src: &[u8]) {
        self.check(off, src.len(), 1);
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(off), src.len()) }
    }

    /// Copies `dst.len()` bytes starting at `off` into `dst`.
    pub fn read_bytes(&self, off: usize, dst: &mut [u8]) {
        self.check(off, dst.len(), 1);
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().add(off), dst.as_mut_ptr(), dst.len()) }
    }

    /// Copies `len` bytes at `off` into `dst` at the same offset, one
    /// 64-bit word at a time.
    pub fn copy_words_to(&self, dst: &Region, off: usize, len: usize) {
        let words = len.div_ceil(8);
        self.check(off, words * 8, 8);
        dst.check(off, words * 8, 8);
        for i in 0..words {
            let w = unsafe { ptr::read_volatile(self.as_ptr().add(off + i * 8) as *const u64) };
            unsafe { ptr::write_volatile(dst.as_ptr().add(off + i * 8) as *mut u64, w) };
        }
    }

    /// Borrows `len` bytes at `off`.
    ///
    /// # Safety
    /// The mapping must outlive `'a` and no one may write the range while
    /// the slice is alive.
    pub unsafe fn slice<'a>(&self, off: usize, len: usize) -> &'a [u8] {
        self.check(off, len, 1);
        unsafe { std::slice::from_raw_parts(self.as_ptr().add(off), len) }
    }

    /// Mutably borrows `len` bytes at `off`.
    ///
    /// # Safety
    /// The mapping must outlive `'a` and the caller must hold exclusive
    /// ownership of the range.
    pub unsafe fn slice_mut<'a>(&self, off: usize, len: usize) -> &'a mut [u8] {
        self.check(off, len, 1);
        unsafe { std::slice::from_raw_parts_mut(self.as_ptr().add(off), len) }
    }
}

/// Zeroed, 64-byte aligned private memory exposed as a [`Region`].
///
/// Backs the staged mirror of a communicator's data area.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    pub fn new_zeroed(size: usize) -> Self {
        let layout = match Layout::from_size_align(size.max(1), 64) {
            Ok(layout) => layout,
            Err(_) => panic!("heap region of {size} bytes exceeds the address space"),
        };
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout)
        };
        Self {
            base,
            len: size,
            layout,
        }
    }

    #[inline]
    pub fn region(&self) -> Region {
        unsafe { Region::from_raw(self.base, self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_access() {
        let heap = HeapRegion::new_zeroed(64);
        let r = heap.region();
        r.store_u32(0, 7);
        r.store_u32(4, 9);
        r.store_i64(8, -1);
        r.store_u64(16, u64::MAX);
        assert_eq!(r.load_u32(0), 7);
        assert_eq!(r.load_u32(4), 9);
        assert_eq!(r.load_i64(8), -1);
        assert_eq!(r.load_u64(16), u64::MAX);
        r.or_u32(0, 0b1000);
        r.clear_u32(0, 0b0001);
        assert_eq!(r.load_u32(0), 0b1110);
    }

    #[test]
    fn test_sub_region_offsets() {
        let heap = HeapRegion::new_zeroed(128);
        let r = heap.region();
        let sub = r.sub(64, 64);
        sub.store_u64(0, 5);
        assert_eq!(r.load_u64(64), 5);
        assert_eq!(sub.addr(0), r.addr(64));
    }

    #[test]
    fn test_word_copy() {
        let a = HeapRegion::new_zeroed(64);
        let b = HeapRegion::new_zeroed(64);
        a.region().write_bytes(8, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
        a.region().copy_words_to(&b.region(), 8, 11);
        let mut out = [0u8; 11];
        b.region().read_bytes(8, &mut out);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn test_out_of_bounds() {
        let heap = HeapRegion::new_zeroed(16);
        heap.region().load_u64(16);
    }

    #[test]
    #[should_panic(expected = "aligned")]
    fn test_misaligned() {
        let heap = HeapRegion::new_zeroed(16);
        heap.region().load_u64(4);
    }
}
