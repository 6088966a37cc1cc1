use thiserror::Error;

/// Errors reported by [`Heap`](crate::Heap) operations.
///
/// `OutOfMemory` and `InvalidArgument` are recoverable: the heap is left
/// exactly as it was before the call. `InvalidPointer` and `DoubleFree` are
/// fatal; [`Heap::release`](crate::Heap::release) and
/// [`Heap::resize`](crate::Heap::resize) panic with them rather than return
/// them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum HeapError {
    /// The arena could not grow, or the requested size cannot be represented.
    #[error("out of memory")]
    OutOfMemory,

    /// A zero-sized allocation, or an alignment that is not a power of two,
    /// was requested.
    #[error("invalid argument")]
    InvalidArgument,

    /// The address does not name a live block of this heap.
    #[error("invalid pointer {0:#x}")]
    InvalidPointer(usize),

    /// The block at this address has already been released.
    #[error("double free of {0:#x}")]
    DoubleFree(usize),

    /// An arena invariant does not hold. Reported by
    /// [`Heap::verify`](crate::Heap::verify) and by the block walks behind
    /// [`Heap::for_each_block`](crate::Heap::for_each_block) and
    /// [`Heap::stats`](crate::Heap::stats).
    #[error("heap corrupted at {addr:#x}: {reason}")]
    Corrupted {
        /// Address of the offending block.
        addr: usize,
        /// Which invariant was violated.
        reason: &'static str,
    },
}

impl HeapError {
    /// Whether this error reflects a broken caller contract that the heap
    /// refuses to continue past.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HeapError::InvalidPointer(_) | HeapError::DoubleFree(_) | HeapError::Corrupted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn fatal_classification() {
        assert!(!HeapError::OutOfMemory.is_fatal());
        assert!(!HeapError::InvalidArgument.is_fatal());
        assert!(HeapError::InvalidPointer(0x10).is_fatal());
        assert!(HeapError::DoubleFree(0x10).is_fatal());
    }

    #[test]
    fn messages_name_the_address() {
        assert_eq!(HeapError::DoubleFree(0x1f0).to_string(), "double free of 0x1f0");
        assert_eq!(HeapError::InvalidPointer(0x8).to_string(), "invalid pointer 0x8");
    }
}
