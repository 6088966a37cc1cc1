//! Raw block handles.
//!
//! A [`Block`] is nothing more than the address of a header inside the arena.
//! All accessors are `unsafe`: they read or write boundary tags at offsets
//! computed from that address and trust that the address really is a block
//! base inside a live arena.

use core::ptr::NonNull;

use crate::layout::{Tag, OVERHEAD, WORD_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// # Safety
    ///
    /// `base` must be the (word-aligned) first byte of a block inside the
    /// arena, or of memory that is about to become one.
    #[inline]
    pub(crate) unsafe fn from_base(base: NonNull<u8>) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % WORD_SIZE, 0);
        Block(base)
    }

    /// Recover the block owning a payload pointer previously returned by
    /// [`Block::payload`].
    ///
    /// # Safety
    ///
    /// `payload - WORD_SIZE` must be inside the same allocation as `payload`.
    #[inline]
    pub(crate) unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Block(payload.sub(WORD_SIZE))
    }

    #[inline]
    pub(crate) fn base(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    pub(crate) fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// The pointer handed to callers: just past the header.
    #[inline]
    pub(crate) unsafe fn payload(self) -> NonNull<u8> {
        self.0.add(WORD_SIZE)
    }

    #[inline]
    pub(crate) unsafe fn tag(self) -> Tag {
        Tag::from_word(self.0.cast::<usize>().read())
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        self.tag().size()
    }

    #[inline]
    pub(crate) unsafe fn usable_size(self) -> usize {
        self.size() - OVERHEAD
    }

    /// The footer word, as found at `base + size - WORD_SIZE` according to
    /// the header.
    #[inline]
    pub(crate) unsafe fn footer(self) -> Tag {
        let footer = self.0.add(self.size() - WORD_SIZE);
        Tag::from_word(footer.cast::<usize>().read())
    }

    /// One past the last byte of this block.
    #[inline]
    pub(crate) unsafe fn end(self) -> *mut u8 {
        self.0.as_ptr().add(self.size())
    }

    /// Write `tag` to both the header and the footer.
    ///
    /// # Safety
    ///
    /// `[base, base + tag.size())` must lie inside the arena.
    #[inline]
    pub(crate) unsafe fn set_tag(self, tag: Tag) {
        self.0.cast::<usize>().write(tag.word());
        self.0
            .add(tag.size() - WORD_SIZE)
            .cast::<usize>()
            .write(tag.word());
    }

    /// The block immediately after this one.
    ///
    /// # Safety
    ///
    /// This block must not be the top-most block of the arena.
    #[inline]
    pub(crate) unsafe fn right(self) -> Block {
        Block(self.0.add(self.size()))
    }

    /// The footer of the block immediately before this one.
    ///
    /// # Safety
    ///
    /// This block must not be the first block of the arena.
    #[inline]
    pub(crate) unsafe fn left_tag(self) -> Tag {
        Tag::from_word(self.0.sub(WORD_SIZE).cast::<usize>().read())
    }

    /// The block immediately before this one, located through its footer.
    ///
    /// # Safety
    ///
    /// This block must not be the first block of the arena.
    #[inline]
    pub(crate) unsafe fn left(self) -> Block {
        Block(self.0.sub(self.left_tag().size()))
    }
}
