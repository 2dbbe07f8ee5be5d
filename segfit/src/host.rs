//! The host memory model the allocator draws its arena from.

use crate::units::Bytes;

/// Returned when the host cannot extend the arena any further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// A contiguous, byte-addressable arena that grows monotonically.
///
/// The allocator owns all the bytes and addresses them by `u32` offset from
/// the start of the storage, so implementations are free to move the bytes
/// around in host memory when they grow (a `Vec` may reallocate, for
/// instance). An arena never shrinks and is limited to 4 GiB.
///
/// Implementations must hand out an 8-aligned offset from the first
/// [`extend`](HostMem::extend) call; every later growth request from the
/// allocator is a multiple of 8, which keeps the arena aligned by
/// construction.
pub trait HostMem {
    /// Extend the arena by `delta` bytes, returning the offset of the first
    /// newly added byte. The new bytes must be zeroed or otherwise owned by
    /// the caller from here on.
    fn extend(&mut self, delta: Bytes) -> Result<u32, OutOfMemory>;

    /// The current arena size in bytes.
    fn size(&self) -> Bytes;

    /// The arena contents. The slice length equals [`size`](HostMem::size).
    fn as_slice(&self) -> &[u8];

    /// The arena contents, mutably.
    fn as_mut_slice(&mut self) -> &mut [u8];
}
