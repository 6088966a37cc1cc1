//! The explicit free list.
//!
//! Free blocks are threaded onto a circular, doubly-linked list whose links
//! live inside the free blocks themselves, in the two words after the header:
//!
//! ```text
//!   ┌──────────┬──────────┬──────────┬─────────────┬──────────┐
//!   │  header  │   next   │   prev   │     ...     │  footer  │
//!   └──────────┴──────────┴──────────┴─────────────┴──────────┘
//!   base       +1 word    +2 words
//! ```
//!
//! There are no node objects: a node *is* the first three words of a free
//! block, reinterpreted through [`FreeNode`]. Only blocks of at least
//! [`MIN_SIZE`] bytes are ever linked, which is what makes that reinterpretation
//! sound.

use core::ptr::{self, NonNull};

use crate::block::Block;
use crate::layout::{MIN_SIZE, WORD_SIZE};

/// The overlay placed on the first words of a free block.
#[repr(C)]
struct FreeNode {
    tag: usize,
    next: Block,
    prev: Block,
}

const _: () = assert!(core::mem::offset_of!(FreeNode, next) == WORD_SIZE);
const _: () = assert!(core::mem::offset_of!(FreeNode, prev) == 2 * WORD_SIZE);
const _: () = assert!(core::mem::size_of::<FreeNode>() + WORD_SIZE <= MIN_SIZE);

/// View `block` as a free-list node.
///
/// # Safety
///
/// `block` must be a free block of at least `MIN_SIZE` bytes, so that the
/// header and both link words lie inside it without touching its footer.
#[inline]
unsafe fn node(block: Block) -> *mut FreeNode {
    debug_assert!(block.size() >= MIN_SIZE);
    debug_assert!(!block.tag().is_allocated());
    block.base().as_ptr().cast::<FreeNode>()
}

#[inline]
unsafe fn next(block: Block) -> Block {
    ptr::addr_of!((*node(block)).next).read()
}

#[inline]
unsafe fn prev(block: Block) -> Block {
    ptr::addr_of!((*node(block)).prev).read()
}

#[inline]
unsafe fn set_next(block: Block, next: Block) {
    ptr::addr_of_mut!((*node(block)).next).write(next);
}

#[inline]
unsafe fn set_prev(block: Block, prev: Block) {
    ptr::addr_of_mut!((*node(block)).prev).write(prev);
}

/// A circular list of every free block in the arena.
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    head: Option<Block>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        FreeList { head: None }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Link `block` in at the head of the list.
    ///
    /// # Safety
    ///
    /// `block` must be a free block of at least `MIN_SIZE` bytes that is not
    /// already on the list.
    pub(crate) unsafe fn insert(&mut self, block: Block) {
        match self.head {
            None => {
                set_next(block, block);
                set_prev(block, block);
            }
            Some(head) => {
                let last = prev(head);
                set_next(block, head);
                set_prev(block, last);
                set_next(last, block);
                set_prev(head, block);
            }
        }
        self.head = Some(block);
    }

    /// Unlink `block` from the list.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list.
    pub(crate) unsafe fn remove(&mut self, block: Block) {
        let next = next(block);
        if next == block {
            debug_assert_eq!(self.head, Some(block));
            self.head = None;
            return;
        }

        let prev = prev(block);
        set_next(prev, next);
        set_prev(next, prev);
        if self.head == Some(block) {
            self.head = Some(next);
        }
    }

    /// Find the smallest free block of at least `min_size` bytes.
    ///
    /// The whole list is scanned. Among equally sized candidates the first
    /// one reached from the head wins.
    ///
    /// # Safety
    ///
    /// The list must be well formed.
    pub(crate) unsafe fn find_best_fit(&self, min_size: usize) -> Option<Block> {
        let mut best: Option<(Block, usize)> = None;
        for block in self.iter() {
            let size = block.size();
            if size < min_size {
                continue;
            }
            if best.map_or(true, |(_, best_size)| size < best_size) {
                best = Some((block, size));
                if size == min_size {
                    break;
                }
            }
        }
        best.map(|(block, _)| block)
    }

    /// Iterate over the list starting at the head.
    ///
    /// # Safety
    ///
    /// The list must be well formed and must not be modified while the
    /// iterator is alive.
    pub(crate) unsafe fn iter(&self) -> Iter<'_> {
        Iter {
            head: self.head,
            next: self.head,
            _list: self,
        }
    }

    /// Whether `block` is on the list.
    ///
    /// # Safety
    ///
    /// The list must be well formed.
    pub(crate) unsafe fn contains(&self, block: Block) -> bool {
        self.iter().any(|b| b == block)
    }

    /// The `(next, prev)` links stored in a listed block, as addresses.
    ///
    /// # Safety
    ///
    /// `block` must currently be on a free list.
    pub(crate) unsafe fn links(block: Block) -> (NonNull<u8>, NonNull<u8>) {
        (next(block).base(), prev(block).base())
    }
}

pub(crate) struct Iter<'a> {
    head: Option<Block>,
    next: Option<Block>,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let block = self.next?;
        // Safety: `FreeList::iter`'s contract guarantees every node reached
        // from the head is a linked free block.
        let following = unsafe { next(block) };
        self.next = if Some(following) == self.head {
            None
        } else {
            Some(following)
        };
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{Tag, ALIGN};
    use std::vec::Vec;

    /// Carve `sizes` out of a buffer as consecutive free blocks.
    fn carve(buf: &mut [u64], sizes: &[usize]) -> Vec<Block> {
        let mut base = buf.as_mut_ptr().cast::<u8>();
        let mut blocks = Vec::new();
        for &size in sizes {
            assert_eq!(size % ALIGN, 0);
            unsafe {
                let block = Block::from_base(NonNull::new(base).unwrap());
                block.set_tag(Tag::free(size));
                blocks.push(block);
                base = base.add(size);
            }
        }
        assert!(base as usize <= buf.as_ptr() as usize + buf.len() * 8);
        blocks
    }

    fn order(list: &FreeList) -> Vec<Block> {
        unsafe { list.iter().collect() }
    }

    #[test]
    fn insert_and_remove() {
        let mut buf = [0u64; 64];
        let blocks = carve(&mut buf, &[MIN_SIZE, 2 * MIN_SIZE, 3 * MIN_SIZE]);
        let (a, b, c) = (blocks[0], blocks[1], blocks[2]);

        let mut list = FreeList::new();
        assert!(list.is_empty());

        unsafe {
            list.insert(a);
            assert_eq!(FreeList::links(a), (a.base(), a.base()));
            assert_eq!(order(&list), [a]);

            list.insert(b);
            list.insert(c);
            assert_eq!(order(&list), [c, b, a]);
            assert_eq!(FreeList::links(c), (b.base(), a.base()));
            assert_eq!(FreeList::links(a), (c.base(), b.base()));

            // Removing the head advances it.
            list.remove(c);
            assert_eq!(order(&list), [b, a]);

            list.insert(c);
            list.remove(b);
            assert_eq!(order(&list), [c, a]);
            assert!(!list.contains(b));

            list.remove(a);
            list.remove(c);
            assert!(list.is_empty());
            assert!(order(&list).is_empty());
        }
    }

    #[test]
    fn best_fit_picks_smallest_sufficient() {
        let mut buf = [0u64; 128];
        let sizes = [8 * MIN_SIZE, 2 * MIN_SIZE, 4 * MIN_SIZE, MIN_SIZE];
        let blocks = carve(&mut buf, &sizes);

        let mut list = FreeList::new();
        unsafe {
            assert_eq!(list.find_best_fit(MIN_SIZE), None);

            for &block in &blocks {
                list.insert(block);
            }

            assert_eq!(list.find_best_fit(MIN_SIZE), Some(blocks[3]));
            assert_eq!(list.find_best_fit(MIN_SIZE + ALIGN), Some(blocks[1]));
            assert_eq!(list.find_best_fit(3 * MIN_SIZE), Some(blocks[2]));
            assert_eq!(list.find_best_fit(5 * MIN_SIZE), Some(blocks[0]));
            assert_eq!(list.find_best_fit(9 * MIN_SIZE), None);
        }
    }

    #[test]
    fn best_fit_ties_go_to_scan_order() {
        let mut buf = [0u64; 64];
        let blocks = carve(&mut buf, &[2 * MIN_SIZE, 2 * MIN_SIZE, 2 * MIN_SIZE]);

        let mut list = FreeList::new();
        unsafe {
            list.insert(blocks[0]);
            list.insert(blocks[2]);
            list.insert(blocks[1]);
            // Head is blocks[1], even though blocks[0] has the lowest address.
            assert_eq!(list.find_best_fit(MIN_SIZE + ALIGN), Some(blocks[1]));
        }
    }
}
