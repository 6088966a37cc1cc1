//! Read-only views of a heap's arena and free list.

use core::fmt;

use super::*;
use crate::free_list::FreeList;

/// A snapshot of one block's metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Address of the block's header.
    pub addr: usize,
    /// Total size, header and footer included.
    pub size: usize,
    /// Whether the block is handed out.
    pub allocated: bool,
    /// The raw header word.
    pub header: usize,
    /// The raw footer word.
    pub footer: usize,
    /// For free blocks, the `(next, previous)` free-list links.
    pub links: Option<(usize, usize)>,
}

impl BlockInfo {
    /// The payload address a caller would have been given for this block.
    pub fn payload(&self) -> usize {
        self.addr + WORD_SIZE
    }

    /// Usable payload bytes.
    pub fn usable_size(&self) -> usize {
        self.size - layout::OVERHEAD
    }

    /// One past the last byte of the block.
    pub fn end(&self) -> usize {
        self.addr + self.size
    }

    /// # Safety
    ///
    /// `block` must be a block inside the arena whose header is well formed.
    unsafe fn read(block: Block) -> Self {
        let tag = block.tag();
        let links = if tag.is_allocated() {
            None
        } else {
            let (next, prev) = FreeList::links(block);
            Some((next.as_ptr() as usize, prev.as_ptr() as usize))
        };
        BlockInfo {
            addr: block.addr(),
            size: tag.size(),
            allocated: tag.is_allocated(),
            header: tag.word(),
            footer: block.footer().word(),
            links,
        }
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "------------------------------")?;
        writeln!(f, "Address: {:#x}", self.addr)?;
        let status = if self.allocated { "Allocated" } else { "Free" };
        writeln!(f, "Status: {status}")?;
        writeln!(f, "Block size: {}", self.size)?;
        writeln!(f, "Header: {}", self.header)?;
        match self.links {
            Some((next, prev)) => {
                writeln!(f, "Next: {next:#x}")?;
                writeln!(f, "Previous: {prev:#x}")?;
            }
            None => writeln!(f, "Payload: ...")?,
        }
        writeln!(f, "Footer: {}", self.footer)
    }
}

/// Summary statistics over a heap's arena.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes between the arena's start and end.
    pub arena_size: usize,
    /// Number of blocks in the arena.
    pub blocks: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Total size of the free blocks.
    pub free_bytes: usize,
    /// Total size of the allocated blocks, headers and footers included.
    pub allocated_bytes: usize,
    /// Number of blocks on the free list.
    pub free_list_len: usize,
}

impl<P, L> Heap<P, L>
where
    P: BreakProvider,
    L: Lock,
{
    /// Call `f` for every block of the arena, in address order.
    ///
    /// Stops with [`HeapError::Corrupted`] at the first malformed header,
    /// after `f` has seen every block before it.
    ///
    /// The heap is locked for the duration, so `f` must not use it.
    pub fn for_each_block(&self, mut f: impl FnMut(&BlockInfo)) -> Result<(), HeapError> {
        let state = self.state.lock();
        // Safety: `walk` validates each header before following it.
        unsafe {
            state.walk(|block| {
                f(&BlockInfo::read(block));
                Ok(())
            })
        }
    }

    /// Call `f` for every block on the free list, in list order starting at
    /// the head.
    ///
    /// The heap is locked for the duration, so `f` must not use it.
    pub fn for_each_free_block(&self, mut f: impl FnMut(&BlockInfo)) {
        let state = self.state.lock();
        // Safety: with the lock held, the free list is well formed.
        unsafe {
            for block in state.free_list.iter() {
                f(&BlockInfo::read(block));
            }
        }
    }

    /// Summarize the arena.
    ///
    /// Fails with [`HeapError::Corrupted`] when the arena cannot be walked.
    pub fn stats(&self) -> Result<HeapStats, HeapError> {
        let mut stats = HeapStats::default();
        if let Some(arena) = self.arena() {
            stats.arena_size = arena.len();
        }
        self.for_each_block(|info| {
            stats.blocks += 1;
            if info.allocated {
                stats.allocated_bytes += info.size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += info.size;
            }
        })?;
        self.for_each_free_block(|_| stats.free_list_len += 1);
        Ok(stats)
    }

    /// Check the heap's invariants:
    ///
    /// * the arena is exactly partitioned into well-formed blocks,
    /// * every block's header equals its footer,
    /// * no two adjacent blocks are both free,
    /// * the free list holds exactly the free blocks, each once, with
    ///   consistent links.
    pub fn verify(&self) -> Result<(), HeapError> {
        let state = self.state.lock();
        // Safety: `walk` and the list traversal only read, and validate each
        // tag before following it.
        unsafe { state.verify() }
    }

    /// Write a human-readable dump of the arena bounds, every block, and the
    /// free list.
    ///
    /// A malformed header ends the block listing with a `CORRUPTED` line, and
    /// the free list, whose links can no longer be trusted, is left out.
    pub fn write_dump(&self, w: &mut impl fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        let Some(bounds) = state.bounds else {
            return writeln!(w, "HEAP is NULL");
        };

        let start = bounds.start.as_ptr() as usize;
        let end = bounds.end.as_ptr() as usize;
        writeln!(w, "\n============ HEAP ============")?;
        writeln!(w, "START: {start:#x}")?;
        writeln!(w, "END: {end:#x}")?;
        writeln!(w, "HEAP SIZE: {}", end - start)?;

        let mut result = Ok(());
        // Safety: `walk` validates each header before following it; the free
        // list is only followed when the walk found nothing wrong.
        unsafe {
            let walked = state.walk(|block| {
                result = result.and_then(|()| write!(w, "{}", BlockInfo::read(block)));
                Ok(())
            });
            result?;
            if let Err(e) = walked {
                return writeln!(w, "CORRUPTED: {e}");
            }
            writeln!(w, "==============================")?;

            if state.free_list.iter().next().is_some() {
                writeln!(w, "\n============ FREE LIST ============")?;
                for block in state.free_list.iter() {
                    write!(w, "{}", BlockInfo::read(block))?;
                }
            }
        }
        Ok(())
    }
}

impl<P> State<P> {
    /// Visit every block in address order, stopping at the first malformed
    /// tag or callback error.
    unsafe fn walk(
        &self,
        mut f: impl FnMut(Block) -> Result<(), HeapError>,
    ) -> Result<(), HeapError> {
        let Some(bounds) = self.bounds else {
            return Ok(());
        };
        let end = bounds.end.as_ptr() as usize;

        let mut cursor = bounds.start;
        while (cursor.as_ptr() as usize) < end {
            let block = Block::from_base(cursor);
            let tag = block.tag();
            if !tag.is_well_formed() {
                return Err(corrupted(block, "malformed header"));
            }
            if tag.size() > end - block.addr() {
                return Err(corrupted(block, "block extends past the arena's end"));
            }
            f(block)?;
            cursor = cursor.add(tag.size());
        }
        Ok(())
    }

    unsafe fn verify(&self) -> Result<(), HeapError> {
        let mut free_blocks = 0;
        let mut prev_free = false;
        self.walk(|block| {
            let tag = block.tag();
            if block.footer() != tag {
                return Err(corrupted(block, "header and footer differ"));
            }
            let free = !tag.is_allocated();
            if free {
                if prev_free {
                    return Err(corrupted(block, "adjacent free blocks"));
                }
                if !self.free_list.contains(block) {
                    return Err(corrupted(block, "free block missing from the free list"));
                }
                free_blocks += 1;
            }
            prev_free = free;
            Ok(())
        })?;

        // Walk the list by hand, bounding the number of steps so that a
        // corrupted cycle cannot loop forever.
        let mut listed = 0;
        for block in self.free_list.iter() {
            listed += 1;
            if listed > free_blocks {
                return Err(corrupted(block, "free list longer than the set of free blocks"));
            }
            if block.tag().is_allocated() {
                return Err(corrupted(block, "allocated block on the free list"));
            }
            let (next, prev) = FreeList::links(block);
            let next = Block::from_base(next);
            let prev = Block::from_base(prev);
            if FreeList::links(next).1 != block.base() || FreeList::links(prev).0 != block.base()
            {
                return Err(corrupted(block, "inconsistent free-list links"));
            }
        }
        if listed != free_blocks {
            return Err(HeapError::Corrupted {
                addr: 0,
                reason: "free list shorter than the set of free blocks",
            });
        }
        Ok(())
    }
}

fn corrupted(block: Block, reason: &'static str) -> HeapError {
    HeapError::Corrupted {
        addr: block.addr(),
        reason,
    }
}
