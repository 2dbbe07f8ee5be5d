//! Fixed-size static arena storage and the `Exclusive` lock for the global
//! allocator front end.

use crate::const_init::ConstInit;
use crate::host::{HostMem, OutOfMemory};
use crate::units::Bytes;
use core::cell::UnsafeCell;
use core::slice;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

const SCRATCH_LEN_BYTES: usize = include!(concat!(
    env!("OUT_DIR"),
    "/segfit_static_arena_size_bytes.txt"
));

#[repr(align(8))]
struct ScratchArena(UnsafeCell<[u8; SCRATCH_LEN_BYTES]>);

// Access goes through the single live `StaticMem`, which is itself kept
// behind an `Exclusive` by the global front end.
unsafe impl Sync for ScratchArena {}

static SCRATCH_ARENA: ScratchArena = ScratchArena(UnsafeCell::new([0; SCRATCH_LEN_BYTES]));

static TAKEN: AtomicBool = AtomicBool::new(false);

/// Arena storage in a process-wide static array, sized at build time through
/// the `SEGFIT_STATIC_ARENA_BYTES` environment variable.
#[derive(Debug)]
pub(crate) struct StaticMem {
    len: usize,
}

impl StaticMem {
    /// Claim the scratch arena. There is only one; a second call returns
    /// `None` so two heaps can never alias the same bytes.
    pub(crate) fn take() -> Option<StaticMem> {
        if TAKEN.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(StaticMem { len: 0 })
        }
    }

    /// Host address of the arena's first byte, for offset/pointer conversion
    /// at the `GlobalAlloc` boundary.
    pub(crate) fn base_ptr() -> *mut u8 {
        SCRATCH_ARENA.0.get() as *mut u8
    }
}

impl HostMem for StaticMem {
    fn extend(&mut self, delta: Bytes) -> Result<u32, OutOfMemory> {
        let old = self.len;
        let new = old.checked_add(delta.0 as usize).ok_or(OutOfMemory)?;
        if new > SCRATCH_LEN_BYTES {
            return Err(OutOfMemory);
        }
        self.len = new;
        Ok(old as u32)
    }

    #[inline]
    fn size(&self) -> Bytes {
        Bytes(self.len as u32)
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(StaticMem::base_ptr(), self.len) }
    }

    #[inline]
    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(StaticMem::base_ptr(), self.len) }
    }
}

/// Mutual exclusion for the one heap instance behind the global front end.
// Align to the cache line size to keep the lock from false sharing.
#[repr(align(64))]
pub(crate) struct Exclusive<T> {
    inner: Mutex<T>,
}

impl<T: ConstInit> ConstInit for Exclusive<T> {
    const INIT: Self = Exclusive {
        inner: Mutex::new(T::INIT),
    };
}

impl<T> Exclusive<T> {
    /// Get exclusive, mutable access to the inner value.
    ///
    /// Re-entering this method for the same `Exclusive` instance deadlocks,
    /// so `f` must not allocate through the same global allocator.
    #[inline]
    pub(crate) fn with_exclusive_access<F, U>(&self, f: F) -> U
    where
        for<'x> F: FnOnce(&'x mut T) -> U,
    {
        let mut guard = self.inner.lock();
        f(&mut guard)
    }
}
