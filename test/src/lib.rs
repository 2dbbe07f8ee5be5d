//! Randomized and regression tests driving the allocator through its public
//! surface, with payload byte patterns to catch blocks that overlap or move
//! when they should not.

use quickcheck::{quickcheck, Arbitrary, Gen, QuickCheck};
use segfit::{Bytes, Heap, VecMem};

#[derive(Debug, Clone, Copy)]
pub enum Operation {
    // Allocate this many payload bytes.
    Alloc(usize),

    // Free the n^th allocation we've made, or no-op if it has already been
    // freed.
    Free(usize),

    // Resize the n^th allocation to this many payload bytes, or no-op if it
    // has already been freed.
    Realloc(usize, usize),
}

pub use Operation::*;

#[derive(Debug, Clone)]
pub struct Operations(pub Vec<Operation>);

#[cfg(feature = "extra_assertions")]
const NUM_OPERATIONS: usize = 2_000;

#[cfg(not(feature = "extra_assertions"))]
const NUM_OPERATIONS: usize = 20_000;

fn arbitrary_size(g: &mut Gen) -> usize {
    // Zero-size allocation 1/1000 times.
    if u16::arbitrary(g) % 1000 == 0 {
        return 0;
    }

    // A large allocation with probability 1/20; these force arena growth
    // and exercise the epilog relocation.
    if u8::arbitrary(g) % 20 == 0 {
        return 1024 + usize::arbitrary(g) % (16 * 1024);
    }

    // Small allocations otherwise, biased toward the bottom size classes
    // where splitting and coalescing churn the hardest.
    if bool::arbitrary(g) {
        1 + usize::arbitrary(g) % 64
    } else {
        1 + usize::arbitrary(g) % 512
    }
}

impl Arbitrary for Operations {
    fn arbitrary(g: &mut Gen) -> Self {
        let mut num_allocs = 0usize;
        let mut active = Vec::new();
        let mut ops = Vec::with_capacity(NUM_OPERATIONS);

        for _ in 0..NUM_OPERATIONS {
            // Free with P = 1/4 and realloc with P = 1/8, so allocation
            // stays frequent enough to keep refilling the free lists.
            let roll = u8::arbitrary(g) % 8;
            if !active.is_empty() && roll < 2 {
                let i = usize::arbitrary(g) % active.len();
                ops.push(Free(active.swap_remove(i)));
            } else if !active.is_empty() && roll == 2 {
                let i = usize::arbitrary(g) % active.len();
                ops.push(Realloc(active[i], arbitrary_size(g)));
            } else {
                active.push(num_allocs);
                num_allocs += 1;
                ops.push(Alloc(arbitrary_size(g)));
            }
        }

        ops.reserve_exact(active.len());
        while !active.is_empty() {
            let i = usize::arbitrary(g) % active.len();
            ops.push(Free(active.swap_remove(i)));
        }

        Operations(ops)
    }

    fn shrink(&self) -> Box<dyn Iterator<Item = Self>> {
        // Prefix shrinking only; the runner tolerates indices whose Alloc
        // got cut off.
        let ops = self.0.clone();
        Box::new((0..self.0.len()).map(move |i| Operations(ops.iter().cloned().take(i).collect())))
    }
}

fn verify_pattern(heap: &Heap<VecMem>, bp: u32, len: usize, pattern: u8) {
    assert!(
        heap.payload(bp)[..len].iter().all(|&byte| byte == pattern),
        "payload at offset {} lost its fill pattern",
        bp
    );
}

impl Operations {
    pub fn run(&self) {
        let mut heap = Heap::new(VecMem::new()).expect("arena init");

        // One slot per Alloc, in program order: offset, requested payload
        // size, and the pattern the payload was filled with.
        let mut slots: Vec<Option<(u32, usize, u8)>> = Vec::new();
        let mut next_pattern = 0u8;

        for (step, op) in self.0.iter().cloned().enumerate() {
            match op {
                Alloc(n) => {
                    match heap.allocate(Bytes(n as u32)) {
                        Some(bp) => {
                            assert_eq!(bp % 8, 0, "allocation at offset {} is misaligned", bp);
                            assert!(heap.payload_size(bp).0 as usize >= n);
                            heap.payload_mut(bp)[..n].fill(next_pattern);
                            slots.push(Some((bp, n, next_pattern)));
                        }
                        None => {
                            assert_eq!(n, 0);
                            slots.push(None);
                        }
                    }
                    next_pattern = next_pattern.wrapping_add(1);
                }
                Free(idx) => {
                    if let Some(entry) = slots.get_mut(idx) {
                        if let Some((bp, n, pattern)) = entry.take() {
                            verify_pattern(&heap, bp, n, pattern);
                            heap.deallocate(bp);
                        }
                    }
                }
                Realloc(idx, new_n) => {
                    if let Some(entry) = slots.get_mut(idx) {
                        if let Some((bp, n, pattern)) = entry.take() {
                            verify_pattern(&heap, bp, n, pattern);
                            match heap.reallocate(Some(bp), Bytes(new_n as u32)) {
                                Some(new_bp) => {
                                    verify_pattern(&heap, new_bp, n.min(new_n), pattern);
                                    heap.payload_mut(new_bp)[..new_n].fill(next_pattern);
                                    *entry = Some((new_bp, new_n, next_pattern));
                                }
                                None => assert_eq!(new_n, 0),
                            }
                            next_pattern = next_pattern.wrapping_add(1);
                        }
                    }
                }
            }

            if step % 1024 == 0 {
                assert!(heap.check(), "heap invariants violated at step {}", step);
            }
        }

        // Free whatever the sequence left behind; the arena must then have
        // coalesced back into at most one block.
        for entry in slots.iter_mut() {
            if let Some((bp, n, pattern)) = entry.take() {
                verify_pattern(&heap, bp, n, pattern);
                heap.deallocate(bp);
            }
        }
        assert!(heap.check());
        assert_eq!(heap.allocated_bytes(), Bytes(0));
        assert!(heap.blocks().count() <= 1);
    }
}

////////////////////////////////////////////////////////////////////////////////

macro_rules! run_quickchecks {
    ($name:ident) => {
        #[test]
        fn $name() {
            fn driver(ops: Operations) {
                ops.run();
            }

            QuickCheck::new()
                .tests(2)
                .quickcheck(driver as fn(Operations) -> ());
        }
    };
}

// Let the test harness run the randomized drivers concurrently with each
// other; every driver owns its own heap.
run_quickchecks!(quickchecks_0);
run_quickchecks!(quickchecks_1);
run_quickchecks!(quickchecks_2);
run_quickchecks!(quickchecks_3);

quickcheck! {
    fn allocations_are_dword_aligned_and_big_enough(n: usize) -> bool {
        let n = n % 65536;
        let mut heap = Heap::new(VecMem::new()).unwrap();
        match heap.allocate(Bytes(n as u32)) {
            Some(bp) => bp % 8 == 0 && heap.payload_size(bp).0 as usize >= n,
            None => n == 0,
        }
    }

    fn realloc_to_the_same_size_is_identity(n: usize) -> bool {
        let n = 1 + n % 4096;
        let mut heap = Heap::new(VecMem::new()).unwrap();
        let bp = heap.allocate(Bytes(n as u32)).unwrap();
        heap.reallocate(Some(bp), Bytes(n as u32)) == Some(bp)
    }

    fn alloc_then_free_then_alloc_reuses(n: usize) -> bool {
        let n = 1 + n % 4096;
        let mut heap = Heap::new(VecMem::new()).unwrap();
        let a = heap.allocate(Bytes(n as u32)).unwrap();
        heap.deallocate(a);
        heap.allocate(Bytes(n as u32)) == Some(a)
    }
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn regression_test_0() {
    Operations(vec![Alloc(1)]).run();
}

#[test]
fn regression_test_1() {
    Operations(vec![Alloc(1414), Free(0), Alloc(1414), Free(1)]).run();
}

#[test]
fn regression_test_2() {
    Operations(vec![Alloc(168), Free(0), Alloc(0), Alloc(168), Free(2)]).run();
}

#[test]
fn regression_test_3() {
    Operations(vec![Alloc(13672), Free(0), Alloc(1)]).run();
}

#[test]
fn regression_test_4() {
    // Grow into the next neighbor, shrink back, then free.
    Operations(vec![
        Alloc(56),
        Alloc(56),
        Free(1),
        Realloc(0, 112),
        Realloc(0, 24),
        Free(0),
    ])
    .run();
}

#[test]
fn allocate_size_zero() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(0))
            .take(1000)
            .chain((0..1000).map(Free))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_small() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(16))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(256)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run();
}

#[test]
fn allocate_many_large() {
    use std::iter;

    Operations(
        iter::repeat(Alloc(2048))
            .take(100)
            .chain((0..100).map(Free))
            .chain(iter::repeat(Alloc(64 * 1024)).take(100))
            .chain((0..100).map(|i| Free(i + 100)))
            .collect(),
    )
    .run();
}

////////////////////////////////////////////////////////////////////////////////

#[test]
fn stress() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut heap = Heap::new(VecMem::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5E6F17);
    let mut live: Vec<(u32, usize, u8)> = Vec::new();
    let mut pattern = 0u8;

    for step in 0..50_000 {
        let free = !live.is_empty()
            && ((live.len() < 1_000 && rng.gen_range(0..3) == 0) || rng.gen());
        if free {
            let idx = rng.gen_range(0..live.len());
            let (bp, n, pat) = live.swap_remove(idx);
            verify_pattern(&heap, bp, n, pat);
            heap.deallocate(bp);
            continue;
        }

        if !live.is_empty() && rng.gen_range(0..100) == 0 {
            let idx = rng.gen_range(0..live.len());
            let (bp, n, pat) = live.swap_remove(idx);
            let new_n = if rng.gen() {
                n + rng.gen_range(0..n.max(1))
            } else {
                1 + n / 2
            };
            let new_bp = heap.reallocate(Some(bp), Bytes(new_n as u32)).unwrap();
            verify_pattern(&heap, new_bp, n.min(new_n), pat);
            heap.payload_mut(new_bp)[..new_n].fill(pattern);
            live.push((new_bp, new_n, pattern));
            pattern = pattern.wrapping_add(1);
        }

        let n = if rng.gen() {
            rng.gen_range(1..128)
        } else {
            rng.gen_range(1..16 * 1024)
        };
        let bp = heap.allocate(Bytes(n as u32)).unwrap();
        heap.payload_mut(bp)[..n].fill(pattern);
        live.push((bp, n, pattern));
        pattern = pattern.wrapping_add(1);

        if step % 4096 == 0 {
            assert!(heap.check());
        }
    }

    for (bp, n, pat) in live.drain(..) {
        verify_pattern(&heap, bp, n, pat);
        heap.deallocate(bp);
    }
    assert!(heap.check());
    assert_eq!(heap.blocks().count(), 1);
}
