// SPDX-License-Identifier: MPL-2.0

//! Invalidation of the page-table cache (PTC) and the TLB.
//!
//! After an entry is written, the PTC line holding the entry and the TLB
//! lines translating the affected IOVAs must be dropped. Three granularities
//! exist: one entry, a run of entries, and a whole address space. Every
//! sequence ends with a read of `PTB_ASID` so that the posted flush writes
//! have reached the SMMU before the caller goes on.

use log::warn;
use spin::Mutex;

use crate::{
    config::SmmuConfig,
    io::{SmmuIo, regs},
    mm::PAGE_SHIFT,
    prelude::*,
    space::Asid,
    util::RateLimit,
};

/// The level of a changed entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryLevel {
    /// A directory entry, covering 4 MiB of IOVA.
    Pde,
    /// A table entry, covering 4 KiB of IOVA.
    Pte,
}

/// A sink for the invalidations a page-table mutation requires.
pub trait Invalidate: Sync {
    /// Drops the cached copy of one entry and the translation of `iova`.
    fn flush_single(&self, asid: Asid, iova: Iova, entry: Paddr, level: EntryLevel);

    /// Drops `count` consecutive PTEs, the first of which is at
    /// `first_entry` and translates `iova`.
    fn flush_range(&self, asid: Asid, iova: Iova, first_entry: Paddr, count: usize);

    /// Drops everything cached for `asid`.
    fn flush_all(&self, asid: Asid);
}

/// Invalidation for tables the hardware never walks, such as the shadow
/// tables of the hypervisor backend.
pub struct NoFlush;

impl Invalidate for NoFlush {
    fn flush_single(&self, _asid: Asid, _iova: Iova, _entry: Paddr, _level: EntryLevel) {}

    fn flush_range(&self, _asid: Asid, _iova: Iova, _first_entry: Paddr, _count: usize) {}

    fn flush_all(&self, _asid: Asid) {}
}

/// The flush engine of a native SMMU.
pub struct Flusher {
    io: Arc<dyn SmmuIo>,
    ptc_cache_line: usize,
    tlb_cache_line: usize,
    sync_poll_budget: usize,
    /// Serializes the two-register address-typed PTC flush.
    ptc_lock: Mutex<()>,
    sync_timeouts: RateLimit,
}

impl Flusher {
    pub fn new(io: Arc<dyn SmmuIo>, config: &SmmuConfig) -> Self {
        Self {
            io,
            ptc_cache_line: config.ptc_cache_line,
            tlb_cache_line: config.tlb_cache_line,
            sync_poll_budget: config.tlb_sync_poll_budget,
            ptc_lock: Mutex::new(()),
            sync_timeouts: RateLimit::new(100, 3),
        }
    }

    /// Drops the whole PTC and every TLB entry of every ASID.
    pub fn flush_global(&self) {
        self.io.write(regs::PTC_FLUSH, regs::PTC_FLUSH_TYPE_ALL);
        self.io.write(regs::TLB_FLUSH, regs::TLB_FLUSH_VA_MATCH_ALL);
        self.sync();
        self.read_back();
    }

    /// Reads a register so that every earlier write has retired.
    pub fn read_back(&self) -> u32 {
        self.io.read(regs::PTB_ASID)
    }

    fn flush_ptc_entry(&self, entry: Paddr) {
        let _guard = self.ptc_lock.lock();
        self.io.write(regs::PTC_FLUSH_1, (entry >> 32) as u32);
        self.io.write(
            regs::PTC_FLUSH,
            (entry as u32 & regs::PTC_FLUSH_ADR_MASK) | regs::PTC_FLUSH_TYPE_ADR,
        );
    }

    fn flush_tlb(&self, asid: Asid, va_match: u32) {
        let asid_match = regs::TLB_FLUSH_ASID_MATCH | (asid << regs::TLB_FLUSH_ASID_SHIFT);
        self.io.write(regs::TLB_FLUSH, asid_match | va_match);
    }

    /// Waits for the TLB to finish outstanding flushes.
    ///
    /// Gives up after the poll budget; the flush is then left unconfirmed.
    fn sync(&self) {
        for _ in 0..self.sync_poll_budget {
            if self.io.read(regs::TLB_SYNC) & regs::TLB_SYNC_BUSY == 0 {
                return;
            }
            core::hint::spin_loop();
        }
        if self.sync_timeouts.check() {
            warn!(
                "[SMMU] TLB sync still busy after {} polls ({} similar warnings suppressed)",
                self.sync_poll_budget,
                self.sync_timeouts.take_suppressed()
            );
        }
    }
}

/// The `TLB_FLUSH` VA-match field for `iova` at `level`.
pub fn tlb_va_match(iova: Iova, level: EntryLevel) -> u32 {
    let va = iova as u32;
    match level {
        EntryLevel::Pde => {
            ((va & regs::TLB_FLUSH_VA_SECTION_MASK) >> regs::TLB_FLUSH_VA_SHIFT)
                | regs::TLB_FLUSH_VA_MATCH_SECTION
        }
        EntryLevel::Pte => {
            ((va & regs::TLB_FLUSH_VA_GROUP_MASK) >> regs::TLB_FLUSH_VA_SHIFT)
                | regs::TLB_FLUSH_VA_MATCH_GROUP
        }
    }
}

impl Invalidate for Flusher {
    fn flush_single(&self, asid: Asid, iova: Iova, entry: Paddr, level: EntryLevel) {
        self.flush_ptc_entry(entry);
        self.flush_tlb(asid, tlb_va_match(iova, level));
        self.read_back();
    }

    fn flush_range(&self, asid: Asid, iova: Iova, first_entry: Paddr, count: usize) {
        let entry_size = size_of::<u32>();
        // IOVA covered by the PTEs of one PTC line and one TLB line.
        let ptc_iova_line = ((self.ptc_cache_line / entry_size) as u64) << PAGE_SHIFT;
        let tlb_iova_line = ((self.tlb_cache_line / entry_size) as u64) << PAGE_SHIFT;
        let groups_per_line = ptc_iova_line / tlb_iova_line;

        let end = iova + ((count as u64) << PAGE_SHIFT);
        let mut va = iova & !(ptc_iova_line - 1);
        let mut entry = first_entry & !(self.ptc_cache_line as u64 - 1);
        while va < end {
            self.flush_ptc_entry(entry);
            entry += self.ptc_cache_line as u64;
            for _ in 0..groups_per_line {
                self.flush_tlb(asid, tlb_va_match(va, EntryLevel::Pte));
                va += tlb_iova_line;
            }
        }
        self.sync();
        self.read_back();
    }

    fn flush_all(&self, asid: Asid) {
        self.io.write(regs::PTC_FLUSH, regs::PTC_FLUSH_TYPE_ALL);
        self.flush_tlb(asid, regs::TLB_FLUSH_VA_MATCH_ALL);
        self.sync();
        self.read_back();
    }
}
