// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicUsize, Ordering};

use bitvec::prelude::BitVec;
use log::warn;
use spin::Mutex;

use super::{FrameAllocator, PAGE_SHIFT, Paddr, is_page_aligned};

/// A frame allocator handing out synthetic physical addresses.
///
/// Frames are numbered from `base` in page steps and tracked in a bitmap.
/// The allocator fails once `capacity` frames are in use, which makes it
/// suitable for exercising out-of-memory paths. It also counts the
/// cache flushes requested through it.
pub struct SimFrameAllocator {
    base: Paddr,
    bitset: Mutex<BitVec<u8>>,
    flushes: AtomicUsize,
}

impl SimFrameAllocator {
    pub fn new(base: Paddr, capacity: usize) -> Self {
        assert!(is_page_aligned(base));
        let mut bitset = BitVec::with_capacity(capacity);
        bitset.resize(capacity, false);
        Self {
            base,
            bitset: Mutex::new(bitset),
            flushes: AtomicUsize::new(0),
        }
    }

    /// The number of frames currently allocated.
    pub fn allocated(&self) -> usize {
        self.bitset.lock().count_ones()
    }

    pub fn is_allocated(&self, paddr: Paddr) -> bool {
        let bitset = self.bitset.lock();
        self.index_of(paddr)
            .is_some_and(|idx| idx < bitset.len() && bitset[idx])
    }

    /// The number of `flush_for_device` requests seen so far.
    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    fn index_of(&self, paddr: Paddr) -> Option<usize> {
        let offset = paddr.checked_sub(self.base)?;
        is_page_aligned(offset).then_some((offset >> PAGE_SHIFT) as usize)
    }
}

impl FrameAllocator for SimFrameAllocator {
    fn alloc_frame(&self) -> Option<Paddr> {
        let mut bitset = self.bitset.lock();
        let idx = bitset.first_zero()?;
        bitset.set(idx, true);
        Some(self.base + ((idx as Paddr) << PAGE_SHIFT))
    }

    fn dealloc_frame(&self, paddr: Paddr) {
        let mut bitset = self.bitset.lock();
        match self.index_of(paddr) {
            Some(idx) if idx < bitset.len() && bitset[idx] => bitset.set(idx, false),
            _ => warn!("[SMMU] freeing unknown frame {:#x}", paddr),
        }
    }

    fn flush_for_device(&self, _paddr: Paddr, _len: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
