//! The process's program break, via `sbrk(2)`.

use libc::{c_void, intptr_t, sbrk};

use super::{BreakError, BreakProvider};

/// A break provider that grows and shrinks the process's data segment.
///
/// There is only one program break per process, so at most one heap should
/// use `Sbrk`. Other users of the break (a libc `malloc` that itself calls
/// `sbrk`, for example) are detected by the heap, which then refuses to grow
/// or shrink rather than corrupt their memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sbrk {
    _private: (),
}

impl Sbrk {
    /// Create a new `Sbrk` provider.
    pub const fn new() -> Self {
        Sbrk { _private: () }
    }
}

unsafe impl BreakProvider for Sbrk {
    fn current(&self) -> *mut u8 {
        // Safety: `sbrk(0)` only queries the break.
        unsafe { sbrk(0).cast() }
    }

    fn adjust(&mut self, delta: isize) -> Result<*mut u8, BreakError> {
        // Safety: moving the break is always memory-safe by itself; the heap
        // upholds that nothing it hands out lies above the new break.
        let prev = unsafe { sbrk(delta as intptr_t) };
        if prev == usize::MAX as *mut c_void {
            return Err(BreakError);
        }
        Ok(prev.cast())
    }
}
