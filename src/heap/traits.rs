//! Standard allocator trait implementations for [`Heap`].
//!
//! Layouts aligned to at most [`WORD_SIZE`] map straight onto the heap's own
//! operations. Larger alignments go through [`Heap::allocate_aligned`].

use core::alloc::{GlobalAlloc, Layout};

use super::*;

impl<P, L> Heap<P, L>
where
    P: BreakProvider,
    L: Lock,
{
    fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        self.allocate_aligned(layout.size(), layout.align())
    }

    /// Like `allocate_layout`, with the whole usable size zeroed.
    fn allocate_layout_zeroed(&self, layout: Layout) -> Result<NonNull<u8>, HeapError> {
        if layout.align() <= WORD_SIZE {
            return self.allocate_clear(1, layout.size());
        }
        let ptr = self.allocate_layout(layout)?;
        // Safety: `ptr` was just allocated, so its whole usable range is ours.
        unsafe { ptr.as_ptr().write_bytes(0, self.usable_size(ptr)) };
        Ok(ptr)
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(feature = "allocator_api", feature = "allocator_api2"))] {
        use crate::{AllocError, Allocator};

        unsafe impl<P, L> Allocator for Heap<P, L>
        where
            P: BreakProvider,
            L: Lock,
        {
            fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                if layout.size() == 0 {
                    return Ok(dangling(layout));
                }
                let ptr = self.allocate_layout(layout).map_err(|_| AllocError)?;
                // Safety: `ptr` is a live block of this heap.
                let len = unsafe { self.usable_size(ptr) };
                Ok(NonNull::slice_from_raw_parts(ptr, len))
            }

            fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
                if layout.size() == 0 {
                    return Ok(dangling(layout));
                }
                let ptr = self.allocate_layout_zeroed(layout).map_err(|_| AllocError)?;
                // Safety: `ptr` is a live block of this heap.
                let len = unsafe { self.usable_size(ptr) };
                Ok(NonNull::slice_from_raw_parts(ptr, len))
            }

            unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
                if layout.size() == 0 {
                    return;
                }
                self.release(ptr);
            }
        }

        /// A non-null, suitably aligned pointer for a zero-sized allocation.
        #[inline]
        fn dangling(layout: Layout) -> NonNull<[u8]> {
            // Safety: alignments are never zero.
            let ptr = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
            NonNull::slice_from_raw_parts(ptr, 0)
        }
    }
}

unsafe impl<P, L> GlobalAlloc for Heap<P, L>
where
    P: BreakProvider,
    L: Lock,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.allocate_layout_zeroed(layout)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.release(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= WORD_SIZE {
            return match self.resize(NonNull::new(ptr), new_size) {
                Ok(Some(new)) => new.as_ptr(),
                Ok(None) | Err(_) => ptr::null_mut(),
            };
        }

        // `resize` only keeps word alignment, so over-aligned blocks move by
        // hand.
        let Ok(new) = self.allocate_aligned(new_size, layout.align()) else {
            return ptr::null_mut();
        };
        ptr::copy_nonoverlapping(ptr, new.as_ptr(), cmp::min(layout.size(), new_size));
        self.dealloc(ptr, layout);
        new.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Region, SingleThreadedLock};
    use std::{vec, vec::Vec};

    fn heap(buf: &mut Vec<u64>) -> Heap<Region, SingleThreadedLock> {
        let region = unsafe { Region::new(buf.as_mut_ptr().cast(), buf.len() * 8) };
        Heap::new(region, SingleThreadedLock::new())
    }

    #[test]
    fn global_alloc_round_trip() {
        let mut buf = vec![0u64; 1024];
        let heap = heap(&mut buf);
        unsafe {
            let layout = Layout::new::<[u64; 4]>();
            let p = heap.alloc(layout).cast::<u64>();
            assert!(!p.is_null());
            for i in 0..4 {
                p.add(i).write(i as u64 + 1);
            }

            let q = heap.realloc(p.cast(), layout, 64).cast::<u64>();
            assert!(!q.is_null());
            for i in 0..4 {
                assert_eq!(q.add(i).read(), i as u64 + 1);
            }

            let z = heap.alloc_zeroed(Layout::new::<[u8; 40]>());
            assert!(core::slice::from_raw_parts(z, 40).iter().all(|b| *b == 0));

            heap.dealloc(q.cast(), Layout::from_size_align(64, 8).unwrap());
            heap.dealloc(z, Layout::new::<[u8; 40]>());
        }
        heap.verify().unwrap();
        assert_eq!(heap.stats().unwrap().arena_size, 0);
    }

    #[test]
    fn over_aligned_layouts_are_served() {
        let mut buf = vec![0u64; 4096];
        let heap = heap(&mut buf);
        unsafe {
            let small = heap.alloc(Layout::from_size_align(24, 8).unwrap());
            let mut held = Vec::new();
            for align in [16, 64, 256, 4096] {
                let layout = Layout::from_size_align(32, align).unwrap();
                let p = heap.alloc_zeroed(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                assert!(core::slice::from_raw_parts(p, 32).iter().all(|b| *b == 0));
                p.write_bytes(0x5A, 32);
                held.push((p, layout));
            }
            heap.verify().unwrap();

            // Moving an over-aligned block keeps its alignment and contents.
            let (p, layout) = held.pop().unwrap();
            let q = heap.realloc(p, layout, 100);
            assert!(!q.is_null());
            assert_eq!(q as usize % layout.align(), 0);
            assert!(core::slice::from_raw_parts(q, 32).iter().all(|b| *b == 0x5A));
            held.push((q, Layout::from_size_align(100, layout.align()).unwrap()));

            for (p, layout) in held {
                heap.dealloc(p, layout);
            }
            heap.dealloc(small, Layout::from_size_align(24, 8).unwrap());
        }
        heap.verify().unwrap();
        assert_eq!(heap.stats().unwrap().arena_size, 0);
    }

    #[test]
    fn over_aligned_layouts_fail_cleanly_when_full() {
        let mut buf = vec![0u64; 32];
        let heap = heap(&mut buf);
        unsafe {
            assert!(heap.alloc(Layout::from_size_align(64, 1024).unwrap()).is_null());
        }
        heap.verify().unwrap();
        assert_eq!(heap.stats().unwrap().arena_size, 0);
    }

    #[cfg(feature = "allocator_api2")]
    #[test]
    fn backs_a_vec() {
        let mut buf = vec![0u64; 4096];
        let heap = heap(&mut buf);
        {
            let mut v = allocator_api2::vec::Vec::new_in(&heap);
            for i in 0..1000u32 {
                v.push(i);
            }
            assert_eq!(v.iter().copied().sum::<u32>(), 999 * 1000 / 2);
            heap.verify().unwrap();

            let empty: allocator_api2::vec::Vec<u8, _> = allocator_api2::vec::Vec::new_in(&heap);
            assert!(empty.is_empty());

            #[repr(align(64))]
            struct Line([u8; 64]);
            let mut lines = allocator_api2::vec::Vec::new_in(&heap);
            for i in 0..10u8 {
                lines.push(Line([i; 64]));
                assert_eq!(lines.as_ptr() as usize % 64, 0);
            }
            assert!(lines.iter().enumerate().all(|(i, l)| l.0[63] == i as u8));
        }
        heap.verify().unwrap();
        assert_eq!(heap.stats().unwrap().arena_size, 0);
    }
}
