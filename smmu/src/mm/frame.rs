// SPDX-License-Identifier: MPL-2.0

use alloc::vec;

use super::{FrameAllocator, PAGE_SIZE, Paddr, is_page_aligned};
use crate::{error::Error, prelude::*};

/// The number of 32-bit entries in one page-table frame.
pub const ENTRIES_PER_FRAME: usize = PAGE_SIZE / size_of::<u32>();

/// An owned page frame holding 1024 directory or table entries.
///
/// The frame goes back to its allocator when dropped.
pub struct PtFrame {
    paddr: Paddr,
    entries: Box<[u32]>,
    allocator: Arc<dyn FrameAllocator>,
}

impl PtFrame {
    /// Allocates a frame whose entries are all initialized by `init`.
    ///
    /// The whole frame is flushed for the device before it is returned.
    pub fn alloc(allocator: &Arc<dyn FrameAllocator>, init: impl Fn(usize) -> u32) -> Result<Self> {
        let paddr = allocator.alloc_frame().ok_or(Error::NoMemory)?;
        if !is_page_aligned(paddr) {
            allocator.dealloc_frame(paddr);
            return Err(Error::InvalidArgs);
        }

        let mut entries = vec![0u32; ENTRIES_PER_FRAME].into_boxed_slice();
        for (idx, entry) in entries.iter_mut().enumerate() {
            *entry = init(idx);
        }
        let frame = Self {
            paddr,
            entries,
            allocator: allocator.clone(),
        };
        frame.flush_for_device(0, ENTRIES_PER_FRAME);
        Ok(frame)
    }

    pub fn paddr(&self) -> Paddr {
        self.paddr
    }

    /// The physical address of entry `idx`.
    pub fn entry_paddr(&self, idx: usize) -> Paddr {
        self.paddr + (idx * size_of::<u32>()) as Paddr
    }

    pub fn read(&self, idx: usize) -> u32 {
        self.entries[idx]
    }

    /// Writes entry `idx`. The caller flushes it for the device.
    pub fn write(&mut self, idx: usize, value: u32) {
        self.entries[idx] = value;
    }

    /// Flushes `count` entries starting at `idx` for the device.
    pub fn flush_for_device(&self, idx: usize, count: usize) {
        debug_assert!(idx + count <= ENTRIES_PER_FRAME);
        self.allocator
            .flush_for_device(self.entry_paddr(idx), count * size_of::<u32>());
    }
}

impl Drop for PtFrame {
    fn drop(&mut self) {
        self.allocator.dealloc_frame(self.paddr);
    }
}

impl core::fmt::Debug for PtFrame {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PtFrame")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .finish_non_exhaustive()
    }
}
