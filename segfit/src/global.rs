//! A `GlobalAlloc` front end over one process-wide heap instance.

use crate::const_init::ConstInit;
use crate::imp_static_array::{Exclusive, StaticMem};
use crate::units::{Bytes, DWORD_SIZE};
use crate::Heap;
use core::alloc::{GlobalAlloc, Layout};
use core::cmp;
use core::ptr;

/// A global allocator backed by the static scratch arena.
///
/// The heap instance is created lazily on the first allocation and lives for
/// the rest of the process. Payload offsets become pointers by adding the
/// arena's base address; alignments above 8 are served by over-allocating
/// and stashing the real block offset in the word just before the returned
/// pointer.
///
/// ```rust,no_run
/// #[global_allocator]
/// static ALLOC: segfit::Segfit = segfit::Segfit::INIT;
/// # fn main() {}
/// ```
pub struct Segfit {
    heap: Exclusive<Option<Heap<StaticMem>>>,
}

impl ConstInit for Segfit {
    const INIT: Segfit = Segfit {
        heap: Exclusive::INIT,
    };
}

impl Segfit {
    /// An initial `const` construction, usable for initializing the `static`
    /// that gets set as the global allocator.
    pub const INIT: Self = <Self as ConstInit>::INIT;
}

fn heap_mut(slot: &mut Option<Heap<StaticMem>>) -> Option<&mut Heap<StaticMem>> {
    if slot.is_none() {
        let mem = StaticMem::take()?;
        match Heap::new(mem) {
            Ok(heap) => *slot = Some(heap),
            Err(_) => return None,
        }
    }
    slot.as_mut()
}

#[inline]
fn offset_to_ptr(bp: u32) -> *mut u8 {
    unsafe { StaticMem::base_ptr().add(bp as usize) }
}

#[inline]
fn ptr_to_offset(p: *mut u8) -> u32 {
    (p as usize - StaticMem::base_ptr() as usize) as u32
}

unsafe impl GlobalAlloc for Segfit {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();
        if size == 0 {
            // A made-up, well-aligned, non-null pointer; `dealloc` skips the
            // zero-size case symmetrically.
            return align as *mut u8;
        }
        if size.saturating_add(align) > (u32::MAX as usize) - 64 {
            return ptr::null_mut();
        }
        self.heap.with_exclusive_access(|slot| {
            let heap = match heap_mut(slot) {
                Some(heap) => heap,
                None => return ptr::null_mut(),
            };
            if align <= DWORD_SIZE.0 as usize {
                match heap.allocate(Bytes(size as u32)) {
                    Some(bp) => offset_to_ptr(bp),
                    None => ptr::null_mut(),
                }
            } else {
                match heap.allocate(Bytes((size + align) as u32)) {
                    Some(bp) => {
                        let aligned = (bp as usize + 4 + align - 1) & !(align - 1);
                        let stash = aligned - 4 - bp as usize;
                        heap.payload_mut(bp)[stash..stash + 4]
                            .copy_from_slice(&bp.to_ne_bytes());
                        offset_to_ptr(aligned as u32)
                    }
                    None => ptr::null_mut(),
                }
            }
        })
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        if p.is_null() || layout.size() == 0 {
            return;
        }
        let bp = if layout.align() <= DWORD_SIZE.0 as usize {
            ptr_to_offset(p)
        } else {
            (p.sub(4) as *const u32).read()
        };
        self.heap.with_exclusive_access(|slot| {
            if let Some(heap) = slot.as_mut() {
                heap.deallocate(bp);
            }
        });
    }

    unsafe fn realloc(&self, p: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > DWORD_SIZE.0 as usize {
            // The stashed offset ties an over-aligned block to its original
            // adjustment; move it instead of resizing in place.
            let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
            let new_ptr = self.alloc(new_layout);
            if !new_ptr.is_null() {
                ptr::copy_nonoverlapping(p, new_ptr, cmp::min(layout.size(), new_size));
                self.dealloc(p, layout);
            }
            return new_ptr;
        }
        if layout.size() == 0 {
            return self.alloc(Layout::from_size_align_unchecked(new_size, layout.align()));
        }
        if new_size > (u32::MAX as usize) - 64 {
            return ptr::null_mut();
        }
        let bp = ptr_to_offset(p);
        self.heap.with_exclusive_access(|slot| {
            let heap = match slot.as_mut() {
                Some(heap) => heap,
                None => return ptr::null_mut(),
            };
            match heap.reallocate(Some(bp), Bytes(new_size as u32)) {
                Some(new_bp) => offset_to_ptr(new_bp),
                None => ptr::null_mut(),
            }
        })
    }
}
