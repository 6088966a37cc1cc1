//! Shared fuzzing and testing infrastructure for `brk_heap`.

use brk_heap::{
    layout::{ALIGN, MIN_PAYLOAD, WORD_SIZE},
    BreakProvider, Heap, HeapError, Lock, Region, SingleThreadedLock,
};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};

/// The requested size of a test allocation.
//
// Note: this is a newtype rather than a bare `usize` so that it can have its
// own default mutator, which keeps sizes small and likes to land on block
// boundaries.
#[derive(Clone, Copy, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

/// Sizes right around the rounding and minimum-payload edges.
const EDGE_SIZES: &[usize] = &[
    0,
    1,
    WORD_SIZE - 1,
    WORD_SIZE,
    WORD_SIZE + 1,
    MIN_PAYLOAD - 1,
    MIN_PAYLOAD,
    MIN_PAYLOAD + 1,
    2 * MIN_PAYLOAD,
    8 * ALIGN - 1,
    8 * ALIGN,
];

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = ctx.rng().gen_index(max_size + 1).unwrap();
            Ok(())
        })?;

        if !c.shrink() {
            c.mutation(|ctx| {
                size.0 = *ctx.rng().choose(EDGE_SIZES).unwrap();
                Ok(())
            })?;
        }

        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        let size = m::range(0..=self.max_size).generate(context)?;
        Ok(Size(size))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    Alloc { id: u32, size: Size },
    AllocClear { id: u32, count: u8, element_size: Size },
    Release { id: u32 },
    Resize { id: u32, size: Size },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::AllocClear {
                    id: ctx.rng().gen_u32(),
                    count: ctx.rng().gen_u32() as u8,
                    element_size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::Resize {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::AllocClear { id, .. } => Some((i, *id)),
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                match &mut ops.ops[op_index] {
                    Op::Alloc { id, .. }
                    | Op::AllocClear { id, .. }
                    | Op::Release { id }
                    | Op::Resize { id, .. } => {
                        *id = new_id;
                    }
                }
            }
            Ok(())
        })?;

        // Release an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, Op::Release { id });
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Resize { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Drop the last operation. Returns `false` if there was none.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations on a fresh heap whose arena can grow to at
    /// most `capacity` bytes.
    pub fn run(&self, capacity: usize) -> Result<(), String> {
        let mut buf = vec![0u64; capacity.div_ceil(8)];
        // Safety: `buf` outlives `heap`, which is declared after it, and is
        // not touched while the heap is alive.
        let region = unsafe { Region::new(buf.as_mut_ptr().cast(), buf.len() * 8) };
        let heap = Heap::new(region, SingleThreadedLock::new());
        self.run_with_heap(&heap)
    }

    /// Run these test operations on the given heap.
    ///
    /// The heap must be fresh, and its provider must be the only party moving
    /// the break, since the run ends by checking that releasing everything
    /// empties the arena.
    pub fn run_with_heap<P, L>(&self, heap: &Heap<P, L>) -> Result<(), String>
    where
        P: BreakProvider,
        L: Lock,
    {
        log::debug!("========== Running test operations ==========");

        let mut live = LiveMap::default();

        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => match heap.allocate(size.0) {
                    Ok(ptr) => {
                        let alloc = new_alloc(heap, &mut live, id, ptr, size.0, false)?;
                        fill(&alloc, LIVE_POISON_PATTERN);
                        live.insert(id, alloc);
                    }
                    Err(e) => check_alloc_error(e, size.0)?,
                },

                Op::AllocClear {
                    id,
                    count,
                    element_size,
                } => {
                    let size = usize::from(count) * element_size.0;
                    match heap.allocate_clear(usize::from(count), element_size.0) {
                        Ok(ptr) => {
                            let alloc = new_alloc(heap, &mut live, id, ptr, size, true)?;
                            check_bytes(&alloc, alloc.usable, 0)?;
                            live.insert(id, alloc);
                        }
                        Err(e) => check_alloc_error(e, size)?,
                    }
                }

                Op::Release { id } => {
                    if let Some(alloc) = live.remove(&id) {
                        release(heap, id, alloc)?;
                    }
                }

                Op::Resize { id, size } => match live.remove(&id) {
                    // Resizing nothing is an allocation.
                    None => match unsafe { heap.resize(None, size.0) } {
                        Ok(Some(ptr)) => {
                            let alloc = new_alloc(heap, &mut live, id, ptr, size.0, false)?;
                            fill(&alloc, LIVE_POISON_PATTERN);
                            live.insert(id, alloc);
                        }
                        Ok(None) => return Err("resize of nothing returned no block".into()),
                        Err(e) => check_alloc_error(e, size.0)?,
                    },

                    Some(old) => match unsafe { heap.resize(Some(old.ptr), size.0) } {
                        Ok(None) => {
                            ensure!(size.0 == 0, "resize released a block for a nonzero size");
                        }
                        Ok(Some(ptr)) => {
                            ensure!(size.0 != 0, "resize to zero returned a block");
                            let alloc = new_alloc(heap, &mut live, id, ptr, size.0, false)?;
                            check_bytes(&alloc, old.usable.min(size.0), old.pattern())?;
                            fill(&alloc, LIVE_POISON_PATTERN);
                            live.insert(id, alloc);
                        }
                        Err(e) => {
                            ensure!(
                                e == HeapError::OutOfMemory,
                                "unexpected error from resize: {e}",
                            );
                            check_bytes(&old, old.usable, old.pattern())?;
                            live.insert(id, old);
                        }
                    },
                },
            }

            heap.verify()
                .map_err(|e| format!("heap invariants broken after {op:?}: {e}"))?;
        }

        // Finally, release any remaining live allocations.
        for (id, alloc) in live {
            release(heap, id, alloc)?;
        }
        heap.verify()
            .map_err(|e| format!("heap invariants broken after releasing everything: {e}"))?;

        let stats = heap
            .stats()
            .map_err(|e| format!("cannot summarize the arena: {e}"))?;
        ensure!(
            stats.arena_size == 0,
            "arena not empty after releasing everything: {stats:?}",
        );

        Ok(())
    }
}

// Non-zeroed memory is filled with a poison pattern, so that contents surviving
// a resize are actually checked rather than happening to be zero.
const LIVE_POISON_PATTERN: u8 = 0xAA;
const FREE_POISON_PATTERN: u8 = 0xFF;

/// A currently-live allocation.
struct LiveAlloc {
    /// The payload pointer.
    ptr: NonNull<u8>,
    /// Requested size at allocation time.
    size: usize,
    /// The usable size the heap reported.
    usable: usize,
    /// Is this allocation zeroed or not? If not, then it is filled with
    /// `LIVE_POISON_PATTERN`.
    zeroed: bool,
}

impl LiveAlloc {
    fn pattern(&self) -> u8 {
        if self.zeroed {
            0
        } else {
            LIVE_POISON_PATTERN
        }
    }
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc {
            ptr,
            size,
            usable,
            zeroed,
        } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", size)
            .field("usable", usable)
            .field("zeroed", zeroed)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
type LiveMap = BTreeMap<u32, LiveAlloc>;

fn fill(alloc: &LiveAlloc, byte: u8) {
    unsafe { alloc.ptr.as_ptr().write_bytes(byte, alloc.usable) };
}

/// Check that the first `len` bytes of `alloc` are all `expected`.
fn check_bytes(alloc: &LiveAlloc, len: usize, expected: u8) -> Result<(), String> {
    let slice = unsafe { std::slice::from_raw_parts(alloc.ptr.as_ptr(), len) };
    ensure!(
        slice.iter().all(|b| *b == expected),
        "expected {len} bytes of {expected:#x} in {alloc:?}",
    );
    Ok(())
}

/// Allocation failures are only acceptable as zero-size rejections or as
/// running out of arena.
fn check_alloc_error(e: HeapError, size: usize) -> Result<(), String> {
    if size == 0 {
        ensure!(
            e == HeapError::InvalidArgument,
            "zero-size allocation should be an invalid argument, got {e}",
        );
    } else {
        ensure!(
            e == HeapError::OutOfMemory,
            "unexpected allocation error for size {size}: {e}",
        );
    }
    Ok(())
}

/// Check a fresh allocation's properties, releasing whatever `id` used to
/// name first.
fn new_alloc<P, L>(
    heap: &Heap<P, L>,
    live: &mut LiveMap,
    id: u32,
    ptr: NonNull<u8>,
    size: usize,
    zeroed: bool,
) -> Result<LiveAlloc, String>
where
    P: BreakProvider,
    L: Lock,
{
    ensure!(size != 0, "zero-size allocation succeeded");

    if let Some(old_alloc) = live.remove(&id) {
        release(heap, id, old_alloc)?;
    }

    let usable = unsafe { heap.usable_size(ptr) };
    let alloc = LiveAlloc {
        ptr,
        size,
        usable,
        zeroed,
    };
    log::debug!("new allocation: id{id} -> {alloc:?}");

    ensure!(usable >= size, "usable size is less than requested size");
    let start = ptr.as_ptr() as usize;
    let end = start + usable;
    ensure!(start % WORD_SIZE == 0, "payload is not word aligned");

    let arena = heap.arena().unwrap_or_default();
    ensure!(
        arena.start < start && end <= arena.end,
        "allocation {start:#x}..{end:#x} is outside the arena {arena:#x?}",
    );

    for other in live.values() {
        let other_start = other.ptr.as_ptr() as usize;
        let other_end = other_start + other.usable;
        ensure!(
            end <= other_start || other_end <= start,
            "two distinct live allocations should never overlap",
        );
    }

    Ok(alloc)
}

fn release<P, L>(heap: &Heap<P, L>, id: u32, alloc: LiveAlloc) -> Result<(), String>
where
    P: BreakProvider,
    L: Lock,
{
    log::debug!("releasing id{id} -> {alloc:?}");
    fill(&alloc, FREE_POISON_PATTERN);
    unsafe { heap.try_release(alloc.ptr) }
        .map_err(|e| format!("releasing live allocation id{id} failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mutatis::check::{Check, CheckError, CheckFailure};

    #[test]
    fn run_ops() {
        let _ = env_logger::try_init();

        let seed_corpus = [
            // Empty.
            Ops::default(),
            // Simple alloc/release pair.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(8),
                },
                Op::Release { id: 0 },
            ]),
            // Zero-size requests.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(0),
                },
                Op::AllocClear {
                    id: 1,
                    count: 0,
                    element_size: Size(4),
                },
            ]),
            // Free a hole, then reuse it.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(100),
                },
                Op::Alloc {
                    id: 1,
                    size: Size(200),
                },
                Op::Release { id: 0 },
                Op::AllocClear {
                    id: 2,
                    count: 10,
                    element_size: Size(4),
                },
            ]),
            // Grow, shrink, then resize to zero.
            Ops::new([
                Op::Alloc {
                    id: 0,
                    size: Size(32),
                },
                Op::Resize {
                    id: 0,
                    size: Size(128),
                },
                Op::Resize {
                    id: 0,
                    size: Size(8),
                },
                Op::Resize {
                    id: 0,
                    size: Size(0),
                },
            ]),
        ];

        match Check::new().iters(10_000).shrink_iters(1).run_with(
            m::default::<Ops>(),
            seed_corpus,
            |ops| ops.run(1 << 16),
        ) {
            Ok(()) => {}
            Err(CheckError::Failed(CheckFailure { value, message, .. })) => {
                panic!("test failure: {message}: {value:#?}")
            }
            Err(e) => panic!("check error: {e}"),
        }
    }

    #[test]
    fn exhausting_the_arena() {
        let _ = env_logger::try_init();

        // Far more than fits in 4KiB: later allocations fail, and releasing
        // holes lets some of the final ones succeed again.
        let mut ops = Vec::new();
        for id in 0..64 {
            ops.push(Op::Alloc {
                id,
                size: Size(200),
            });
        }
        for id in (0..64).step_by(2) {
            ops.push(Op::Release { id });
        }
        for id in 64..96 {
            ops.push(Op::Alloc {
                id,
                size: Size(150),
            });
        }
        for id in 1..8 {
            ops.push(Op::Resize {
                id,
                size: Size(3000),
            });
        }

        Ops::new(ops).run(4096).unwrap();
    }
}
