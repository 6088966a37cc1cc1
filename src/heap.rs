//! The heap engine.
//!
//! A [`Heap`] owns one arena, obtained lazily from its [`BreakProvider`], and
//! partitions it into boundary-tagged blocks (see [`layout`](crate::layout)).
//! Free blocks are kept on an explicit, circular free list threaded through
//! their own payloads.
//!
//! Allocation picks the best-fitting free block, splitting off the tail when
//! the leftover is big enough to be a block of its own, and only grows the
//! arena when nothing on the free list fits. Release merges the block with any
//! free neighbours on either side, puts the result back on the free list, and
//! hands it back to the provider instead when it is the top-most block of the
//! arena.

use core::{cmp, ops::Range, ptr, ptr::NonNull};

use crate::arena::BreakProvider;
use crate::block::Block;
use crate::error::HeapError;
use crate::free_list::FreeList;
use crate::layout::{self, Tag, ALIGN, MIN_SIZE, WORD_SIZE};
use crate::mutex::{Lock, Mutex};

mod inspect;
mod traits;

pub use inspect::{BlockInfo, HeapStats};

/// A dynamic memory allocator over a single growable arena.
///
/// `P` supplies the arena's memory and `L` decides how the heap may be shared:
/// see [`Lock`].
///
/// ```
/// use brk_heap::{Heap, Region, SingleThreadedLock};
///
/// let mut buf = vec![0u64; 1024];
/// let region = unsafe { Region::new(buf.as_mut_ptr().cast(), buf.len() * 8) };
/// let heap = Heap::new(region, SingleThreadedLock::new());
///
/// let p = heap.allocate(100).unwrap();
/// unsafe {
///     p.as_ptr().write_bytes(0xAB, 100);
///     let p = heap.resize(Some(p), 200).unwrap().unwrap();
///     assert_eq!(p.as_ptr().read(), 0xAB);
///     heap.release(p);
/// }
/// assert_eq!(heap.stats().unwrap().arena_size, 0);
/// ```
pub struct Heap<P, L>
where
    L: Lock,
{
    state: Mutex<State<P>, L>,
}

/// The arena's bounds, fixed at `start` and currently ending at `end`.
#[derive(Clone, Copy, Debug)]
struct Bounds {
    start: NonNull<u8>,
    end: NonNull<u8>,
}

impl Bounds {
    fn contains_strictly(&self, addr: usize) -> bool {
        (self.start.as_ptr() as usize) < addr && addr < (self.end.as_ptr() as usize)
    }
}

struct State<P> {
    provider: P,

    /// `None` until the first allocation.
    bounds: Option<Bounds>,

    free_list: FreeList,
}

// Safety: the raw pointers in `bounds` and the free list point into the arena,
// which is owned by `provider`; the state as a whole can move between threads
// whenever the provider can.
unsafe impl<P> Send for State<P> where P: Send {}

impl<P, L> Heap<P, L>
where
    P: BreakProvider,
    L: Lock,
{
    /// Create a heap drawing memory from `provider`.
    ///
    /// Nothing is requested from the provider until the first allocation.
    #[inline]
    pub const fn new(provider: P, lock: L) -> Self {
        let state = State {
            provider,
            bounds: None,
            free_list: FreeList::new(),
        };
        Heap {
            state: Mutex::new(state, lock),
        }
    }

    /// Allocate a block with at least `size` usable bytes.
    ///
    /// The returned pointer is aligned to [`WORD_SIZE`] and the memory is
    /// uninitialized.
    ///
    /// Fails with [`HeapError::InvalidArgument`] when `size` is zero and with
    /// [`HeapError::OutOfMemory`] when the arena cannot grow; either way the
    /// heap is left unchanged.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.state.lock().allocate(size)
    }

    /// Allocate a zero-filled block for `count` elements of `element_size`
    /// bytes each.
    pub fn allocate_clear(
        &self,
        count: usize,
        element_size: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let size = count
            .checked_mul(element_size)
            .ok_or(HeapError::OutOfMemory)?;
        let mut state = self.state.lock();
        let ptr = state.allocate(size)?;
        // Safety: `ptr` was just allocated, so its whole usable range is ours.
        unsafe {
            let usable = Block::from_payload(ptr).usable_size();
            ptr.as_ptr().write_bytes(0, usable);
        }
        Ok(ptr)
    }

    /// Release a block.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not lie inside the arena or is not a live block
    /// ([`HeapError::InvalidPointer`]), or if its block was already released
    /// ([`HeapError::DoubleFree`]). The heap is not modified in either case.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this heap's `allocate`,
    /// `allocate_clear`, or `resize`. Addresses inside the arena that are not
    /// such pointers are only detected on a best-effort basis.
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        if let Err(e) = self.try_release(ptr) {
            fatal(e);
        }
    }

    /// Release a block, reporting invalid and double frees as errors instead
    /// of panicking.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::release`].
    pub unsafe fn try_release(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        self.state.lock().release(ptr)
    }

    /// Resize a block, moving it.
    ///
    /// * With `ptr == None` this is [`Heap::allocate`].
    /// * With `new_size == 0` this is [`Heap::release`] and returns `None`.
    /// * Otherwise a new block is allocated, the first
    ///   `min(usable_size(ptr), new_size)` bytes are copied over, and the old
    ///   block is released. If the allocation fails the old block is left
    ///   intact and still owned by the caller.
    ///
    /// # Panics
    ///
    /// Panics like [`Heap::release`] when `ptr` is not a live block.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::release`] for `ptr`.
    pub unsafe fn resize(
        &self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        // The guard must be gone before `fatal` unwinds: unwinding may
        // allocate, and with this heap as the global allocator that would
        // wait on our own lock.
        let result = self.state.lock().resize(ptr, new_size);
        match result {
            Err(e) if e.is_fatal() => fatal(e),
            result => result,
        }
    }

    /// Allocate at least `size` usable bytes at an address that is a multiple
    /// of `align`.
    ///
    /// Alignments up to [`WORD_SIZE`] cost nothing extra. Larger ones
    /// over-allocate by `align` and give the unused front and back of the
    /// block straight back to the free list.
    ///
    /// Fails with [`HeapError::InvalidArgument`] when `size` is zero or
    /// `align` is not a power of two.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        self.state.lock().allocate_aligned(size, align)
    }

    /// The number of usable bytes in a live block, which may exceed what was
    /// requested.
    ///
    /// # Panics
    ///
    /// Panics like [`Heap::release`] when `ptr` is not a live block.
    ///
    /// # Safety
    ///
    /// Same as [`Heap::release`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        let result = self
            .state
            .lock()
            .live_block(ptr)
            .map(|block| block.usable_size());
        match result {
            Ok(usable) => usable,
            Err(e) => fatal(e),
        }
    }

    /// The arena's current address range, or `None` before the first
    /// allocation.
    pub fn arena(&self) -> Option<Range<usize>> {
        let state = self.state.lock();
        state
            .bounds
            .map(|b| b.start.as_ptr() as usize..b.end.as_ptr() as usize)
    }
}

/// Report a fatal condition. Never returns.
#[cold]
#[inline(never)]
fn fatal(error: HeapError) -> ! {
    debug_assert!(error.is_fatal());
    log_error!("fatal heap error: {error}");
    panic!("{error}")
}

impl<P> State<P>
where
    P: BreakProvider,
{
    /// Set up the arena on first use. Returns the bounds either way.
    fn bounds(&mut self) -> Result<Bounds, HeapError> {
        if let Some(bounds) = self.bounds {
            return Ok(bounds);
        }

        let brk = self.provider.current();
        let pad = brk.align_offset(ALIGN);
        if pad != 0 {
            let pad = isize::try_from(pad).map_err(|_| HeapError::OutOfMemory)?;
            self.provider
                .adjust(pad)
                .map_err(|_| HeapError::OutOfMemory)?;
        }
        let start = NonNull::new(self.provider.current()).ok_or(HeapError::OutOfMemory)?;
        debug_assert_eq!(start.as_ptr() as usize % ALIGN, 0);
        log_trace!("arena initialized at {start:p}");

        let bounds = Bounds { start, end: start };
        self.bounds = Some(bounds);
        Ok(bounds)
    }

    fn allocate(&mut self, requested: usize) -> Result<NonNull<u8>, HeapError> {
        self.bounds()?;

        if requested == 0 {
            return Err(HeapError::InvalidArgument);
        }
        let size = layout::adjust_size(requested).ok_or(HeapError::OutOfMemory)?;

        // Safety: every block on the free list lies inside the arena, and the
        // arena bytes past the old break are handed to us by `grow`.
        unsafe {
            let (block, size) = match self.free_list.find_best_fit(size) {
                Some(block) => {
                    self.free_list.remove(block);
                    (block, self.split(block, size))
                }
                None => (self.grow(size)?, size),
            };
            block.set_tag(Tag::allocated(size));
            Ok(block.payload())
        }
    }

    /// # Safety
    ///
    /// Same as [`Heap::resize`].
    unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size).map(Some);
        };

        if new_size == 0 {
            self.release(ptr)?;
            return Ok(None);
        }

        // Validate before allocating, so a bad pointer is reported even when
        // the arena is full.
        let old_usable = self.live_block(ptr)?.usable_size();
        let new = self.allocate(new_size)?;
        ptr::copy_nonoverlapping(
            ptr.as_ptr().cast_const(),
            new.as_ptr(),
            cmp::min(old_usable, new_size),
        );
        self.release(ptr)?;
        Ok(Some(new))
    }

    fn allocate_aligned(&mut self, requested: usize, align: usize) -> Result<NonNull<u8>, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidArgument);
        }
        if align <= WORD_SIZE {
            return self.allocate(requested);
        }
        self.bounds()?;
        if requested == 0 {
            return Err(HeapError::InvalidArgument);
        }

        let size = layout::adjust_size(requested).ok_or(HeapError::OutOfMemory)?;
        // Room for the payload, plus up to `align` bytes of slack to reach an
        // aligned address, plus a leading block of at least `MIN_SIZE` to
        // give back.
        let padded = requested
            .max(layout::MIN_PAYLOAD)
            .checked_add(align)
            .and_then(|n| n.checked_add(MIN_SIZE))
            .ok_or(HeapError::OutOfMemory)?;
        let ptr = self.allocate(padded)?;

        // Safety: `ptr` is a fresh allocated block, and the front and back
        // pieces cut from it are whole blocks of at least `MIN_SIZE`.
        unsafe {
            let mut block = Block::from_payload(ptr);
            let addr = ptr.as_ptr() as usize;
            let mut aligned = addr.next_multiple_of(align);
            if aligned != addr && aligned - addr < MIN_SIZE {
                aligned += align;
            }

            let lead = aligned - addr;
            if lead != 0 {
                let rest = Block::from_base(block.base().add(lead));
                rest.set_tag(Tag::allocated(block.size() - lead));
                block.set_tag(Tag::allocated(lead));
                self.free_block(block);
                block = rest;
            }
            debug_assert!(block.size() >= size);
            self.trim(block, size);

            debug_assert_eq!(block.payload().as_ptr() as usize % align, 0);
            Ok(block.payload())
        }
    }

    /// Give everything past the first `size` bytes of the allocated `block`
    /// back, if that is big enough to be a block of its own.
    unsafe fn trim(&mut self, block: Block, size: usize) {
        let total = block.size();
        if total - size < MIN_SIZE {
            return;
        }
        let tail = Block::from_base(block.base().add(size));
        tail.set_tag(Tag::allocated(total - size));
        block.set_tag(Tag::allocated(size));
        self.free_block(tail);
    }

    /// Carve `size` bytes off the front of the free, unlisted `block`. Returns
    /// the size the allocation actually gets.
    unsafe fn split(&mut self, block: Block, size: usize) -> usize {
        let total = block.size();
        let remainder = total - size;
        if remainder < MIN_SIZE {
            return total;
        }

        let rest = Block::from_base(block.base().add(size));
        rest.set_tag(Tag::free(remainder));
        self.free_list.insert(rest);
        size
    }

    /// Extend the arena by exactly `size` bytes and return the new space as a
    /// block (without a tag yet).
    fn grow(&mut self, size: usize) -> Result<Block, HeapError> {
        let mut bounds = self.bounds()?;
        let delta = isize::try_from(size).map_err(|_| HeapError::OutOfMemory)?;

        let prev = self
            .provider
            .adjust(delta)
            .map_err(|_| HeapError::OutOfMemory)?;
        if prev != bounds.end.as_ptr() {
            // Someone else moved the break; the new memory is not contiguous
            // with the arena.
            log_warn!(
                "break moved underneath the heap: expected {:p}, found {prev:p}",
                bounds.end
            );
            if self.provider.adjust(-delta).is_err() {
                log_warn!("could not undo growth by {size} bytes at {prev:p}");
            }
            return Err(HeapError::OutOfMemory);
        }

        // Safety: the provider just handed us `[prev, prev + size)`.
        let end = unsafe { bounds.end.add(size) };
        log_trace!("arena grown by {size} bytes to {end:p}");
        bounds.end = end;
        self.bounds = Some(bounds);

        // Safety: `prev` is the old break, which is `ALIGN`-aligned because
        // the arena start is and every block size is a multiple of `ALIGN`.
        Ok(unsafe { Block::from_base(bounds.end.sub(size)) })
    }

    /// Validate that `ptr` is the payload of a live block and return it.
    ///
    /// Nothing is written.
    fn live_block(&self, ptr: NonNull<u8>) -> Result<Block, HeapError> {
        let addr = ptr.as_ptr() as usize;
        let invalid = HeapError::InvalidPointer(addr);

        let bounds = self.bounds.ok_or(invalid)?;
        if !bounds.contains_strictly(addr) || (addr - WORD_SIZE) % ALIGN != 0 {
            return Err(invalid);
        }

        // Safety: `addr` is strictly above `start` and aligned so that the
        // header word lies inside the arena.
        unsafe {
            let block = Block::from_payload(ptr);
            let tag = block.tag();
            if !tag.is_allocated() {
                return Err(HeapError::DoubleFree(addr));
            }

            let room = bounds.end.as_ptr() as usize - block.addr();
            if !tag.is_well_formed() || tag.size() > room || block.footer() != tag {
                return Err(invalid);
            }
            Ok(block)
        }
    }

    fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let block = self.live_block(ptr)?;
        // Safety: `live_block` established that `block` is a well-formed
        // allocated block inside the arena.
        unsafe { self.free_block(block) };
        Ok(())
    }

    /// Free an allocated block: merge it with its free neighbours, then list
    /// the result or give it back to the provider.
    ///
    /// # Safety
    ///
    /// `block` must be a well-formed allocated block inside the arena, so its
    /// neighbours (when they exist) are blocks too and free neighbours are on
    /// the free list.
    unsafe fn free_block(&mut self, block: Block) {
        let Some(mut bounds) = self.bounds else {
            unreachable!("a live block implies an initialized arena");
        };

        let mut size = block.size();
        block.set_tag(Tag::free(size));
        let mut merged = block;

        if block.end() < bounds.end.as_ptr() {
            let right = block.right();
            let right_tag = right.tag();
            if !right_tag.is_allocated() {
                self.free_list.remove(right);
                size += right_tag.size();
                merged.set_tag(Tag::free(size));
            }
        }

        if merged.base() > bounds.start {
            let left_tag = merged.left_tag();
            if !left_tag.is_allocated() {
                let left = merged.left();
                self.free_list.remove(left);
                size += left_tag.size();
                left.set_tag(Tag::free(size));
                merged = left;
            }
        }

        if merged.end() == bounds.end.as_ptr() && self.shrink(&mut bounds, merged) {
            self.bounds = Some(bounds);
            return;
        }

        self.free_list.insert(merged);
    }

    /// Give the top-most, unlisted free `block` back to the provider. Returns
    /// `false` if the break could not be moved, in which case the caller keeps
    /// the block.
    unsafe fn shrink(&mut self, bounds: &mut Bounds, block: Block) -> bool {
        if self.provider.current() != bounds.end.as_ptr() {
            log_warn!(
                "break moved above the heap's end {:p}; keeping the top block",
                bounds.end
            );
            return false;
        }

        let size = block.size();
        let Ok(delta) = isize::try_from(size) else {
            return false;
        };
        if self.provider.adjust(-delta).is_err() {
            return false;
        }

        debug_assert_eq!(self.provider.current(), block.base().as_ptr());
        bounds.end = block.base();
        log_trace!("arena shrunk by {size} bytes to {:p}", bounds.end);
        true
    }
}
