//! Block layout and boundary tags.
//!
//! Every block in the arena starts with a one-word header and ends with a
//! one-word footer holding the same [`Tag`]:
//!
//! ```text
//!   base                                               base + size
//!   │                                                            │
//!   ▼                                                            ▼
//!   ┌──────────┬────────────────────────────────────┬──────────┐
//!   │  header  │              payload               │  footer  │
//!   │ size | a │                                    │ size | a │
//!   └──────────┴────────────────────────────────────┴──────────┘
//!              ▲
//!              └── pointer handed to the caller
//! ```
//!
//! Mirroring the tag in the footer lets a block find its left neighbour's
//! size (and status) by reading the word just below its own header, which is
//! what makes coalescing in both directions possible without a side table.

use core::{fmt, mem};

/// The size of a header or footer word.
pub const WORD_SIZE: usize = mem::size_of::<usize>();

/// Block sizes and block base addresses are multiples of this.
pub const ALIGN: usize = 8;

/// The smallest payload a block is ever given. Free blocks keep their two
/// free-list links in these words.
pub const MIN_PAYLOAD: usize = 2 * WORD_SIZE;

/// The smallest block: header, two link words, footer.
pub const MIN_SIZE: usize = 4 * WORD_SIZE;

/// Header plus footer.
pub const OVERHEAD: usize = 2 * WORD_SIZE;

/// Compute the total block size needed to hold `payload` bytes.
///
/// The payload is raised to [`MIN_PAYLOAD`], rounded up to [`ALIGN`], and the
/// header and footer are added. Returns `None` if that overflows or the result
/// is larger than the arena could ever be grown by in one step.
#[inline]
pub fn adjust_size(payload: usize) -> Option<usize> {
    let payload = payload.max(MIN_PAYLOAD);
    let rounded = payload.checked_add(ALIGN - 1)? & !(ALIGN - 1);
    let size = rounded.checked_add(OVERHEAD)?;
    if size > isize::MAX as usize {
        return None;
    }
    debug_assert!(size >= MIN_SIZE);
    debug_assert_eq!(size % ALIGN, 0);
    Some(size)
}

/// A boundary tag: a block's total size and its allocation bit packed into one
/// word.
///
/// Sizes are always multiples of [`ALIGN`], so bit 0 is free to carry the
/// allocation status.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Tag(usize);

impl Tag {
    const ALLOCATED: usize = 1;

    /// Create a tag for a block of `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` is not a multiple of [`ALIGN`].
    #[inline]
    pub fn new(size: usize, allocated: bool) -> Self {
        assert_eq!(size % ALIGN, 0, "block size {size} is not a multiple of {ALIGN}");
        Tag(size | if allocated { Self::ALLOCATED } else { 0 })
    }

    /// A tag for a free block of `size` bytes.
    #[inline]
    pub fn free(size: usize) -> Self {
        Self::new(size, false)
    }

    /// A tag for an allocated block of `size` bytes.
    #[inline]
    pub fn allocated(size: usize) -> Self {
        Self::new(size, true)
    }

    /// Reinterpret a raw header or footer word.
    ///
    /// No validation happens here: a word read from an arbitrary address may
    /// decode to a nonsensical size. See [`Tag::is_well_formed`].
    #[inline]
    pub const fn from_word(word: usize) -> Self {
        Tag(word)
    }

    /// The raw word as stored in memory.
    #[inline]
    pub const fn word(self) -> usize {
        self.0
    }

    /// The block's total size, header and footer included.
    #[inline]
    pub const fn size(self) -> usize {
        self.0 & !Self::ALLOCATED
    }

    /// Whether the block is handed out to a caller.
    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & Self::ALLOCATED != 0
    }

    /// Whether this could be the tag of a real block: at least [`MIN_SIZE`],
    /// aligned, and with no stray low bits besides the allocation bit.
    #[inline]
    pub const fn is_well_formed(self) -> bool {
        let size = self.size();
        size >= MIN_SIZE && size % ALIGN == 0
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("size", &self.size())
            .field("allocated", &self.is_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_size_rounds_and_adds_overhead() {
        assert_eq!(adjust_size(1), Some(MIN_SIZE));
        assert_eq!(adjust_size(MIN_PAYLOAD), Some(MIN_SIZE));

        let ptr_size = mem::size_of::<usize>();
        for i in 0..10 {
            let base = MIN_PAYLOAD + ALIGN * i;
            for payload in base + 1..=base + ALIGN {
                let expected = base + ALIGN + 2 * ptr_size;
                assert_eq!(adjust_size(payload), Some(expected), "payload = {payload}");
            }
        }
    }

    #[test]
    fn adjust_size_rejects_overflow() {
        assert_eq!(adjust_size(usize::MAX), None);
        assert_eq!(adjust_size(usize::MAX - 3), None);
        assert_eq!(adjust_size(isize::MAX as usize), None);
    }

    #[test]
    fn tag_packs_size_and_status() {
        let tag = Tag::allocated(48);
        assert_eq!(tag.size(), 48);
        assert!(tag.is_allocated());
        assert_eq!(tag.word(), 49);

        let tag = Tag::from_word(49);
        assert_eq!(tag, Tag::allocated(48));

        let tag = Tag::free(4096);
        assert_eq!(tag.size(), 4096);
        assert!(!tag.is_allocated());
        assert_eq!(tag.word(), 4096);
    }

    #[test]
    #[should_panic(expected = "not a multiple")]
    fn tag_rejects_unaligned_size() {
        let _ = Tag::free(MIN_SIZE + 4);
    }

    #[test]
    fn well_formed_tags() {
        assert!(Tag::free(MIN_SIZE).is_well_formed());
        assert!(Tag::allocated(MIN_SIZE + ALIGN).is_well_formed());
        assert!(!Tag::from_word(0).is_well_formed());
        assert!(!Tag::from_word(MIN_SIZE + 2).is_well_formed());
        assert!(!Tag::from_word(ALIGN | 1).is_well_formed());
    }
}
