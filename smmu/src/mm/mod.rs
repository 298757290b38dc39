// SPDX-License-Identifier: MPL-2.0

//! Memory primitives: address types, page frames, and the allocator the
//! page tables are built from.

mod frame;
mod sim;

pub use self::{frame::PtFrame, sim::SimFrameAllocator};

/// A physical address (or an IPA in virtualized mode).
pub type Paddr = u64;

/// An I/O virtual address as issued by a device.
pub type Iova = u64;

/// A 4 KiB physical frame number.
pub type Pfn = u64;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// The size of a page mapped directly by a page-directory entry.
pub const LARGE_PAGE_SHIFT: u32 = 22;
pub const LARGE_PAGE_SIZE: usize = 1 << LARGE_PAGE_SHIFT;

/// The provider of page-table memory.
///
/// Frames must be page aligned. They are only written by the CPU, so after
/// every update the written bytes are pushed out with
/// [`FrameAllocator::flush_for_device`] before the SMMU is told to look at
/// them.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one 4 KiB frame, or returns `None` when out of memory.
    fn alloc_frame(&self) -> Option<Paddr>;

    /// Returns a frame obtained from [`FrameAllocator::alloc_frame`].
    fn dealloc_frame(&self, paddr: Paddr);

    /// Writes back CPU caches for `len` bytes at `paddr` so that the device
    /// observes them.
    fn flush_for_device(&self, paddr: Paddr, len: usize);
}

/// One physically contiguous piece of a scatter-gather list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub paddr: Paddr,
    pub len: usize,
}

pub(crate) const fn is_page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}

pub(crate) const fn is_large_page_aligned(addr: u64) -> bool {
    addr & (LARGE_PAGE_SIZE as u64 - 1) == 0
}
