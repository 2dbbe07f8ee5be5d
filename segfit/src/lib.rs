/*!

## About

`segfit`: a segregated-fit, boundary-tagged heap allocator over a growable
arena.

The allocator manages one contiguous, byte-addressable arena that grows
monotonically through an `sbrk`-style request to a host memory model and is
never given back. Payloads are handed out as 8-aligned `u32` offsets into the
arena, which keeps the engine free of raw pointer arithmetic, keeps blocks
addressable across host reallocation (a `Vec` backend may move its bytes when
it grows), and caps the arena at 4 GiB by construction. The boundary-tag word
width is fixed at 32 bits no matter how wide the host's pointers are.

Every block carries a header word and a duplicate footer word encoding its
size and a free bit, so both neighbors of any block are reachable in constant
time and freed blocks coalesce immediately in either direction. Free blocks
are indexed by thirteen segregated, doubly linked, LIFO free lists, one per
power-of-two size class, each bracketed by a prolog and an epilog sentinel
triple so that list splicing has no head or tail branches.

```text
+------------------------------------------------------------------------+
| Host memory model (`HostMem`)                                          |
|   Vec<u8> / mmap reservation / static array                            |
+------------------------------------------------------------------------+
                  |
                  | extend(n) -> old end of arena
                  V
+------------------------------------------------------------------------+
| Arena                                                                  |
|                                                                        |
| +-------------+--------+--------+-----+--------+-------------+         |
| | 13 prologs  | block  | block  | ... | block  | 13 epilogs  |         |
| | (12 B each) |        |        |     |        | (12 B each) |         |
| +-------------+--------+--------+-----+--------+-------------+         |
|                                                                        |
| class 0:  prolog.succ -> free 16..31 B   -> ... -> epilog              |
| class 1:  prolog.succ -> free 32..63 B   -> ... -> epilog              |
|   ...                                                                  |
| class 12: prolog.succ -> free >= 64 KiB  -> ... -> epilog              |
+------------------------------------------------------------------------+
```

Allocation is first fit within the smallest adequate class, escalating to
larger classes on a miss, with splitting whenever the remainder can stand on
its own as a block. When nothing fits, the arena grows by exactly the
shortfall: a trailing free block is widened in place, or a fresh block is
carved where the epilog bank used to start. Reallocation absorbs the next
neighbor when that helps, extends the arena in place when the resized block
is the last one, and only falls back to allocate-copy-free when it must.

## Using `Segfit` as the global allocator

With the `static_array_backend` feature enabled, the crate provides a
[`GlobalAlloc`](core::alloc::GlobalAlloc) front end over one process-wide
heap in a fixed static arena:

```rust,ignore
#[global_allocator]
static ALLOC: segfit::Segfit = segfit::Segfit::INIT;
```

## `cargo` features

- **extra_assertions**: Enable expensive integrity assertions and defensive
  mechanisms, such as poisoning the interiors of free blocks. Large runtime
  overhead; useful when debugging a use-after-free or `segfit` itself.

- **static_array_backend**: Provide `StaticMem`-backed storage with a global
  maximum size fixed at compile time, plus the [`Segfit`] global allocator
  on top of it. The size defaults to 32 MiB and may be controlled at build
  time by supplying the `SEGFIT_STATIC_ARENA_BYTES` environment variable to
  cargo.

## Implementation notes and constraints

- The engine is single threaded; [`Heap`] operations take `&mut self` and
  nothing suspends. The [`Segfit`] front end adds a spin lock, nothing more.

- Block sizes are multiples of 8 and at least 16 bytes; a block's size
  includes its header and footer, so an allocation costs 8 bytes of
  overhead.

- The arena never shrinks. Freed blocks are kept in the segregated lists
  indefinitely for future allocations.

- Arena exhaustion aborts: when the host cannot extend, the allocator panics
  with a diagnostic rather than unwinding into a caller that holds offsets
  into a half-grown arena.

 */

#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

use cfg_if::cfg_if;

#[macro_use]
mod extra_assert;

mod classes;
mod host;
mod imp_vec;
mod tag;
mod units;

cfg_if! {
    if #[cfg(unix)] {
        mod imp_unix;
        pub use crate::imp_unix::MmapMem;
    }
}

cfg_if! {
    if #[cfg(feature = "static_array_backend")] {
        mod const_init;
        mod imp_static_array;
        mod global;
        pub use crate::global::Segfit;
    }
}

pub use crate::classes::SEG_CLASS_COUNT;
pub use crate::host::{HostMem, OutOfMemory};
pub use crate::imp_vec::VecMem;
pub use crate::tag::MIN_BLOCK_SIZE;
pub use crate::units::{Bytes, DWords, RoundUpTo, Words, DWORD_SIZE, WORD_SIZE};

use crate::classes::SENTINEL_BANK;
use crate::tag::OVERHEAD;
use core::cmp;
use core::fmt;

// Free-block interiors are filled with this pattern while they sit in a
// list. Seeing unexpected 0x53 bytes in payload data means either a
// use-after-free in the caller or a bug in `segfit` itself.
#[cfg(feature = "extra_assertions")]
const FREE_PATTERN: u8 = 0x53;

const MAX_PAYLOAD: Bytes = Bytes(u32::MAX - 64);

extra_only! {
    fn assert_is_dword_aligned(at: u32) {
        assert_eq!(at % DWORD_SIZE.0, 0, "offset {} is not dword aligned", at);
    }
}

/// Payload size plus tag overhead, rounded up to the dword granularity of
/// block sizes.
fn adjusted_size(size: Bytes) -> Bytes {
    assert!(
        size <= MAX_PAYLOAD,
        "segfit: allocation of {} bytes exceeds the 32-bit arena limit",
        size.0
    );
    let dwords: DWords = size.round_up_to();
    Bytes::from(dwords) + OVERHEAD
}

/// A heap over one arena drawn from the host memory model `M`.
///
/// All block addresses are `u32` payload offsets into the arena. An offset
/// returned by [`allocate`](Heap::allocate) or
/// [`reallocate`](Heap::reallocate) stays valid until the first subsequent
/// `deallocate` or `reallocate` of that same offset; the payload bytes are
/// reached through [`payload`](Heap::payload) and
/// [`payload_mut`](Heap::payload_mut).
///
/// Passing an offset that was never returned, or was already freed, is not
/// memory-unsafe in the Rust sense but corrupts the heap's bookkeeping, just
/// as it would in any boundary-tagged allocator.
///
/// ```
/// use segfit::{Bytes, Heap, VecMem};
///
/// let mut heap = Heap::new(VecMem::new())?;
/// let p = heap.allocate(Bytes(100)).unwrap();
/// heap.payload_mut(p).fill(0xAB);
/// let p = heap.reallocate(Some(p), Bytes(200)).unwrap();
/// assert!(heap.check());
/// heap.deallocate(p);
/// # Ok::<(), segfit::OutOfMemory>(())
/// ```
pub struct Heap<M: HostMem> {
    mem: M,
    base: u32,
    size: Bytes,
    free_size: Bytes,
}

impl<M: HostMem> Heap<M> {
    /// Set up a heap on `mem`: claims 312 bytes for the two sentinel banks
    /// and cross-links each class's prolog to its epilog.
    ///
    /// Fails when the host cannot provide the initial bytes.
    pub fn new(mem: M) -> Result<Heap<M>, OutOfMemory> {
        let mut mem = mem;
        let both_banks = Bytes(2 * SENTINEL_BANK.0);
        let base = mem.extend(both_banks)?;
        assert!(
            base % DWORD_SIZE.0 == 0,
            "segfit: host returned a misaligned arena base"
        );
        let mut heap = Heap {
            mem,
            base,
            size: both_banks,
            free_size: Bytes(0),
        };
        let epilog_base = heap.epilog_base();
        for class in 0..SEG_CLASS_COUNT {
            let prolog = classes::prolog_node(base, class);
            let epilog = classes::epilog_node(epilog_base, class);
            heap.set_word(prolog, 0);
            heap.set_word(prolog + 4, epilog);
            heap.set_word(prolog + 8, 0);
            heap.set_word(epilog - 4, 0);
            heap.set_word(epilog, prolog);
            heap.set_word(epilog + 4, 0);
        }
        Ok(heap)
    }

    /// Allocate a block with room for `size` payload bytes, returning its
    /// payload offset. Returns `None` only for a zero-size request.
    ///
    /// # Panics
    ///
    /// Panics when the host memory model cannot grow the arena far enough to
    /// satisfy the request.
    pub fn allocate(&mut self, size: Bytes) -> Option<u32> {
        if size.0 == 0 {
            return None;
        }
        let bp = self.allocate_block(adjusted_size(size));
        assert_is_dword_aligned(bp);
        Some(bp)
    }

    /// Return the block at `bp` to the free pool, merging it with whichever
    /// adjacent blocks are free.
    ///
    /// `bp` must be a payload offset previously returned by
    /// [`allocate`](Heap::allocate) or [`reallocate`](Heap::reallocate) and
    /// not freed since.
    pub fn deallocate(&mut self, bp: u32) {
        let size = self.block_size(bp);
        extra_assert!(!tag::is_free(self.word(tag::hdr(bp))));
        extra_assert!(size >= MIN_BLOCK_SIZE);

        let prev_tag = self.word(tag::prev_ftr(bp));
        let next_tag = self.word(tag::hdr(tag::next_block(bp, size)));

        let mut start = bp;
        let mut total = size;
        if tag::is_free(prev_tag) {
            let prev_size = tag::size(prev_tag);
            start = tag::prev_block(bp, prev_size);
            self.remove(start);
            total = total + prev_size;
        }
        if tag::is_free(next_tag) {
            let next_bp = tag::next_block(bp, size);
            self.remove(next_bp);
            total = total + tag::size(next_tag);
        }
        // Both tags come from the precomputed merged size, so neither write
        // invalidates an offset the other depends on.
        self.write_tags(start, total, tag::FREE);
        self.insert(start);
    }

    /// Resize the block at `bp` to hold `size` payload bytes.
    ///
    /// `reallocate(None, size)` allocates; `reallocate(Some(bp), 0)` frees
    /// and returns `None`. Otherwise the result is the payload offset of the
    /// resized block, which is `bp` itself whenever the request can be
    /// served in place: by shrinking, by absorbing a free next neighbor, or,
    /// when the block sits at the end of the arena, by growing the arena.
    /// Only the next neighbor is considered; absorbing backward would mean
    /// moving the payload. In the remaining cases the block is moved, with
    /// the surviving payload prefix copied over.
    ///
    /// # Panics
    ///
    /// Panics when in-place growth needs the arena to grow and the host
    /// memory model is exhausted.
    pub fn reallocate(&mut self, bp: Option<u32>, size: Bytes) -> Option<u32> {
        let bp = match bp {
            Some(bp) => bp,
            None => return self.allocate(size),
        };
        if size.0 == 0 {
            self.deallocate(bp);
            return None;
        }

        let asize = adjusted_size(size);
        let cur = self.block_size(bp);
        let next_bp = tag::next_block(bp, cur);
        let next_tag = self.word(tag::hdr(next_bp));
        let next_free = tag::is_free(next_tag);
        let next_size = tag::size(next_tag);

        let total = if next_free && cur + next_size >= asize {
            self.remove(next_bp);
            cur + next_size
        } else if !next_free && cur >= asize {
            cur
        } else {
            // The in-place candidate region runs to the end of this block,
            // plus the next block when that one is free. When the region
            // ends at the epilog bank the shortfall comes from the host.
            let region_end = tag::hdr(bp) + cur.0 + if next_free { next_size.0 } else { 0 };
            if region_end == self.epilog_base() {
                let mut total = cur;
                if next_free {
                    self.remove(next_bp);
                    total = total + next_size;
                }
                extra_assert!(total < asize);
                self.grow_arena(asize - total);
                asize
            } else {
                let new_bp = self.allocate_block(asize);
                let copy = (cmp::min(cur, asize) - OVERHEAD).0 as usize;
                let from = bp as usize;
                self.mem
                    .as_mut_slice()
                    .copy_within(from..from + copy, new_bp as usize);
                self.deallocate(bp);
                return Some(new_bp);
            }
        };

        if total - asize >= MIN_BLOCK_SIZE {
            self.write_tags(bp, asize, tag::ALLOCATED);
            let rest = tag::next_block(bp, asize);
            self.write_tags(rest, total - asize, tag::FREE);
            self.insert(rest);
        } else {
            self.write_tags(bp, total, tag::ALLOCATED);
        }
        Some(bp)
    }

    /// Walk the arena and the thirteen free lists, verifying the heap
    /// invariants: header/footer agreement, size validity, immediate
    /// coalescing (no two adjacent free blocks), and that the free lists
    /// hold exactly the free blocks, each in the list of its size class with
    /// consistent links.
    pub fn check(&self) -> bool {
        let epilog_base = self.epilog_base();
        let mut free_blocks = 0u32;
        let mut prev_free = false;
        let mut bp = self.first_block();
        loop {
            let tag = self.word(tag::hdr(bp));
            if tag == 0 {
                if tag::hdr(bp) != epilog_base {
                    return false;
                }
                break;
            }
            let size = tag::size(tag);
            if size < MIN_BLOCK_SIZE || size.0 % DWORD_SIZE.0 != 0 {
                return false;
            }
            if self.word(tag::ftr(bp, size)) != tag {
                return false;
            }
            if tag::is_free(tag) {
                if prev_free {
                    return false;
                }
                free_blocks += 1;
                prev_free = true;
            } else {
                prev_free = false;
            }
            bp = tag::next_block(bp, size);
        }

        let mut listed = 0u32;
        for class in 0..SEG_CLASS_COUNT {
            let mut node = self.prolog(class);
            let mut bp = self.word(node + 4);
            while self.word(tag::hdr(bp)) != 0 {
                let tag = self.word(tag::hdr(bp));
                if !tag::is_free(tag) {
                    return false;
                }
                if classes::class_of(tag::size(tag)) != class {
                    return false;
                }
                if self.word(bp) != node {
                    return false;
                }
                listed += 1;
                if listed > free_blocks {
                    // More members than free blocks exist: a link cycle.
                    return false;
                }
                node = bp;
                bp = self.word(bp + 4);
            }
            if self.word(bp) != node {
                return false;
            }
        }
        free_blocks == listed
    }

    /// Usable payload bytes of the block at `bp`.
    pub fn payload_size(&self, bp: u32) -> Bytes {
        self.block_size(bp) - OVERHEAD
    }

    /// The payload bytes of the allocated block at `bp`.
    pub fn payload(&self, bp: u32) -> &[u8] {
        let len = self.payload_size(bp).0 as usize;
        let at = bp as usize;
        &self.mem.as_slice()[at..at + len]
    }

    /// The payload bytes of the allocated block at `bp`, mutably.
    pub fn payload_mut(&mut self, bp: u32) -> &mut [u8] {
        let len = self.payload_size(bp).0 as usize;
        let at = bp as usize;
        &mut self.mem.as_mut_slice()[at..at + len]
    }

    /// Bytes currently sitting in free blocks, tags included.
    pub fn free_bytes(&self) -> Bytes {
        self.free_size
    }

    /// Bytes currently in allocated blocks, tags included.
    pub fn allocated_bytes(&self) -> Bytes {
        Bytes(self.size.0 - 2 * SENTINEL_BANK.0 - self.free_size.0)
    }

    /// The arena's current `[lo, hi)` offset bounds.
    pub fn arena_bounds(&self) -> (u32, u32) {
        (self.base, self.base + self.size.0)
    }

    /// Iterate over every normal block, low to high offset.
    pub fn blocks(&self) -> Blocks<'_, M> {
        Blocks {
            heap: self,
            bp: self.first_block(),
        }
    }

    /// First-fit search, starting in the smallest adequate class and
    /// escalating through the larger ones.
    fn find_fit(&self, asize: Bytes) -> Option<u32> {
        for class in classes::class_of(asize)..SEG_CLASS_COUNT {
            let mut bp = self.word(self.prolog(class) + 4);
            loop {
                let tag = self.word(tag::hdr(bp));
                if tag == 0 {
                    break;
                }
                extra_assert!(tag::is_free(tag));
                if tag::size(tag) >= asize {
                    return Some(bp);
                }
                bp = self.word(bp + 4);
            }
        }
        None
    }

    fn allocate_block(&mut self, asize: Bytes) -> u32 {
        if let Some(bp) = self.find_fit(asize) {
            self.remove(bp);
            let bsize = self.block_size(bp);
            if bsize - asize >= MIN_BLOCK_SIZE {
                self.write_tags(bp, asize, tag::ALLOCATED);
                let rest = tag::next_block(bp, asize);
                self.write_tags(rest, bsize - asize, tag::FREE);
                self.insert(rest);
            } else {
                self.write_tags(bp, bsize, tag::ALLOCATED);
            }
            return bp;
        }

        // No fit anywhere. A free block at the very end of the arena only
        // needs the shortfall from the host; otherwise a whole new block is
        // carved where the epilog bank used to start.
        let epilog_base = self.epilog_base();
        let last_tag = self.word(epilog_base - 4);
        let bp = if tag::is_free(last_tag) {
            let last_size = tag::size(last_tag);
            extra_assert!(last_size < asize);
            let bp = epilog_base + 4 - last_size.0;
            self.remove(bp);
            self.grow_arena(asize - last_size);
            bp
        } else {
            let bp = epilog_base + 4;
            self.grow_arena(asize);
            bp
        };
        self.write_tags(bp, asize, tag::ALLOCATED);
        bp
    }

    /// Extend the arena and relocate the epilog bank to its new end.
    ///
    /// Aborts on host exhaustion: unwinding out of here would leave callers
    /// holding offsets into an arena whose epilog bank has not moved.
    fn grow_arena(&mut self, delta: Bytes) {
        let delta = {
            let dwords: DWords = delta.round_up_to();
            Bytes::from(dwords)
        };
        let old_epilog = self.epilog_base();
        if self.mem.extend(delta).is_err() {
            panic!(
                "segfit: heap arena exhausted growing by {} bytes (arena is {} bytes)",
                delta.0, self.size.0
            );
        }
        self.size = self.size + delta;
        let new_epilog = self.epilog_base();
        let old = old_epilog as usize;
        let new = new_epilog as usize;
        self.mem
            .as_mut_slice()
            .copy_within(old..old + SENTINEL_BANK.0 as usize, new);
        // Each class's tail, the prolog included when the class is empty,
        // still points at the old epilog node; the relocated pred words say
        // which succ word to patch.
        for class in 0..SEG_CLASS_COUNT {
            let node = classes::epilog_node(new_epilog, class);
            let pred = self.word(node);
            self.set_word(pred + 4, node);
        }
    }

    /// Splice `bp` in as the head of its class's list. LIFO: a just-freed
    /// block is the likeliest fit for the next request.
    fn insert(&mut self, bp: u32) {
        let size = self.block_size(bp);
        extra_assert!(tag::is_free(self.word(tag::hdr(bp))));
        let pred = self.prolog(classes::class_of(size));
        let succ = self.word(pred + 4);
        self.set_word(bp, pred);
        self.set_word(bp + 4, succ);
        self.set_word(pred + 4, bp);
        self.set_word(succ, bp);
        self.free_size = self.free_size + size;
        self.write_free_pattern(bp);
    }

    /// Splice `bp` out of its list. The sentinels absorb the head and tail
    /// cases, so there are no branches and no class lookup.
    fn remove(&mut self, bp: u32) {
        self.assert_free_pattern(bp);
        let pred = self.word(bp);
        let succ = self.word(bp + 4);
        self.set_word(pred + 4, succ);
        self.set_word(succ, pred);
        self.free_size = self.free_size - self.block_size(bp);
    }

    fn write_tags(&mut self, bp: u32, size: Bytes, status: u32) {
        let word = tag::pack(size, status);
        self.set_word(tag::hdr(bp), word);
        self.set_word(tag::ftr(bp, size), word);
    }

    #[inline]
    fn block_size(&self, bp: u32) -> Bytes {
        tag::size(self.word(tag::hdr(bp)))
    }

    #[inline]
    fn prolog(&self, class: u32) -> u32 {
        classes::prolog_node(self.base, class)
    }

    #[inline]
    fn epilog_base(&self) -> u32 {
        self.base + self.size.0 - SENTINEL_BANK.0
    }

    /// Payload offset of the lowest-addressed normal block.
    #[inline]
    fn first_block(&self) -> u32 {
        self.base + SENTINEL_BANK.0 + 4
    }

    #[inline]
    fn word(&self, at: u32) -> u32 {
        let at = at as usize;
        let bytes = self.mem.as_slice();
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[at..at + 4]);
        u32::from_ne_bytes(word)
    }

    #[inline]
    fn set_word(&mut self, at: u32, word: u32) {
        let at = at as usize;
        self.mem.as_mut_slice()[at..at + 4].copy_from_slice(&word.to_ne_bytes());
    }

    #[cfg(feature = "extra_assertions")]
    fn write_free_pattern(&mut self, bp: u32) {
        let size = self.block_size(bp);
        let lo = (bp + 8) as usize;
        let hi = (bp + size.0 - 8) as usize;
        for byte in &mut self.mem.as_mut_slice()[lo..hi] {
            *byte = FREE_PATTERN;
        }
    }

    #[cfg(not(feature = "extra_assertions"))]
    #[inline(always)]
    fn write_free_pattern(&mut self, _bp: u32) {}

    #[cfg(feature = "extra_assertions")]
    fn assert_free_pattern(&self, bp: u32) {
        let size = self.block_size(bp);
        let lo = (bp + 8) as usize;
        let hi = (bp + size.0 - 8) as usize;
        assert!(
            self.mem.as_slice()[lo..hi]
                .iter()
                .all(|&byte| byte == FREE_PATTERN),
            "segfit: free block at offset {} was written through",
            bp
        );
    }

    #[cfg(not(feature = "extra_assertions"))]
    #[inline(always)]
    fn assert_free_pattern(&self, _bp: u32) {}
}

impl<M: HostMem> fmt::Debug for Heap<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct BlockMap<'a, M: HostMem>(&'a Heap<M>);

        impl<M: HostMem> fmt::Debug for BlockMap<'_, M> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list().entries(self.0.blocks()).finish()
            }
        }

        f.debug_struct("Heap")
            .field("base", &self.base)
            .field("size", &self.size.0)
            .field("free", &self.free_size.0)
            .field("blocks", &BlockMap(self))
            .finish()
    }
}

/// One normal block, as reported by [`Heap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Payload offset of the block.
    pub offset: u32,
    /// Whole-block size, tags included.
    pub size: Bytes,
    /// Whether the block is free.
    pub is_free: bool,
}

/// Iterator over the arena's normal blocks, from [`Heap::blocks`].
pub struct Blocks<'a, M: HostMem> {
    heap: &'a Heap<M>,
    bp: u32,
}

impl<M: HostMem> Iterator for Blocks<'_, M> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let tag = self.heap.word(tag::hdr(self.bp));
        if tag == 0 {
            return None;
        }
        let block = Block {
            offset: self.bp,
            size: tag::size(tag),
            is_free: tag::is_free(tag),
        };
        self.bp = tag::next_block(self.bp, block.size);
        Some(block)
    }
}
