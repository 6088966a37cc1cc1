//! Break providers: where the arena's memory comes from.
//!
//! The heap owns a single contiguous range `[start, end)` whose upper bound,
//! the *break*, can be moved up to obtain memory and down to give it back. A
//! [`BreakProvider`] is anything that can move such a bound.
//!
//! * [`Sbrk`] moves the process's real program break with `sbrk(2)`.
//! * [`Region`] hands out a fixed, caller-supplied buffer. This lets several
//!   independent heaps coexist, which is what the tests rely on.

use thiserror::Error;

cfg_if::cfg_if! {
    if #[cfg(all(feature = "sbrk", unix))] {
        mod sbrk;
        pub use sbrk::Sbrk;
    }
}

/// The provider could not move the break.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Error)]
#[error("cannot move the break")]
pub struct BreakError;

/// A source of memory with a single movable upper bound.
///
/// # Safety
///
/// Implementations must guarantee that:
///
/// * After `adjust(delta)` with a positive `delta` returns `Ok(prev)`, the
///   bytes `[prev, prev + delta)` are valid for reads and writes and are not
///   used by anything else until the break is moved back below them.
///
/// * `current()` reports the break as last left by `adjust` (other parties
///   moving a shared break, as with `sbrk`, is tolerated: the heap checks for
///   it).
///
/// * The break never moves below the address reported by the first call to
///   `current()` as a result of `adjust` calls made by the heap.
pub unsafe trait BreakProvider {
    /// The current break.
    fn current(&self) -> *mut u8;

    /// Move the break by `delta` bytes and return where it was before.
    fn adjust(&mut self, delta: isize) -> Result<*mut u8, BreakError>;
}

/// A break provider over a fixed region of memory.
///
/// The break starts at the region's base and may move anywhere within
/// `[base, base + capacity]`.
#[derive(Debug)]
pub struct Region {
    base: *mut u8,
    capacity: usize,
    brk: usize,
}

// Safety: a `Region` is the exclusive owner of the memory it describes, per
// `Region::new`'s contract, so moving it to another thread moves that
// ownership along with it.
unsafe impl Send for Region {}

impl Region {
    /// Create a provider handing out `capacity` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `[base, base + capacity)` must be valid for reads and writes for as
    /// long as the provider (and any heap using it) is alive, and must not be
    /// accessed by anything else in the meantime.
    pub const unsafe fn new(base: *mut u8, capacity: usize) -> Self {
        Region {
            base,
            capacity,
            brk: 0,
        }
    }

    /// Create a provider over a `'static` buffer.
    pub fn from_static(buf: &'static mut [u8]) -> Self {
        // Safety: the exclusive `'static` borrow guarantees validity and
        // exclusivity forever.
        unsafe { Region::new(buf.as_mut_ptr(), buf.len()) }
    }

    /// The total number of bytes this region can hand out.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes currently below the break.
    pub fn used(&self) -> usize {
        self.brk
    }
}

unsafe impl BreakProvider for Region {
    fn current(&self) -> *mut u8 {
        self.base.wrapping_add(self.brk)
    }

    fn adjust(&mut self, delta: isize) -> Result<*mut u8, BreakError> {
        let prev = self.current();
        self.brk = self
            .brk
            .checked_add_signed(delta)
            .filter(|brk| *brk <= self.capacity)
            .ok_or(BreakError)?;
        Ok(prev)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_moves_within_capacity() {
        let mut buf = [0u8; 256];
        let base = buf.as_mut_ptr();
        let mut region = unsafe { Region::new(base, buf.len()) };

        assert_eq!(region.current(), base);
        assert_eq!(region.adjust(0), Ok(base));

        assert_eq!(region.adjust(64), Ok(base));
        assert_eq!(region.current(), base.wrapping_add(64));
        assert_eq!(region.used(), 64);

        assert_eq!(region.adjust(192), Ok(base.wrapping_add(64)));
        assert_eq!(region.adjust(1), Err(BreakError));
        assert_eq!(region.used(), 256);

        assert_eq!(region.adjust(-256), Ok(base.wrapping_add(256)));
        assert_eq!(region.current(), base);
        assert_eq!(region.adjust(-1), Err(BreakError));
        assert_eq!(region.current(), base);
    }
}
