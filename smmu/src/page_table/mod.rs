// SPDX-License-Identifier: MPL-2.0

//! The page tables of one address space.
//!
//! A [`PageDirectory`] owns the directory frame, the lazily allocated table
//! frames and a live-PTE count per directory entry. A table is freed as
//! soon as its count drops to zero. Every mutation is written back for the
//! device and then handed to an [`Invalidate`] implementation, which is the
//! hardware flush engine for a native SMMU and a no-op for a shadow copy.

pub mod entry;
#[cfg(test)]
mod test;

use core::ops::Range;

use log::warn;

pub use self::entry::{NR_PDES, NR_PTES, PFN_MASK, PageFlags, Pde, PdeKind, Pte, pdn, ptn};
use crate::{
    config::AS_WINDOW_SIZE,
    error::Error,
    flush::{EntryLevel, Invalidate},
    mm::{
        FrameAllocator, LARGE_PAGE_SHIFT, LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE, PtFrame,
        is_large_page_aligned, is_page_aligned,
    },
    prelude::*,
    space::Asid,
};

/// The `span` of a [`MappingInfo`] for an unmapped IOVA.
pub const SPAN_NOT_FOUND: u64 = !0;

/// The result of a reverse lookup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappingInfo {
    /// The physical address the IOVA translates to.
    pub paddr: Paddr,
    /// The size of the mapping containing the IOVA, or [`SPAN_NOT_FOUND`].
    pub span: u64,
    /// The live PTEs under the directory entry of the IOVA.
    pub live_ptes: u32,
}

impl MappingInfo {
    pub const NOT_FOUND: Self = Self {
        paddr: !0,
        span: SPAN_NOT_FOUND,
        live_ptes: 0,
    };

    pub fn is_mapped(&self) -> bool {
        self.span != SPAN_NOT_FOUND
    }
}

/// The location of one page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PteSlot {
    pub pdn: usize,
    pub ptn: usize,
    /// The physical address of the entry itself.
    pub entry_paddr: Paddr,
}

/// A run of IOVAs mapped to contiguous physical memory with equal flags.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub iova: Range<Iova>,
    pub paddr: Paddr,
    pub flags: PageFlags,
    /// Whether the run is made of 4 MiB directory mappings.
    pub large: bool,
}

/// The IOVA, relative to its window, of entry `ptn` under `pdn`.
const fn entry_iova(pdn: usize, ptn: usize) -> Iova {
    ((pdn << LARGE_PAGE_SHIFT) | (ptn << PAGE_SHIFT)) as Iova
}

fn check_frame(pfn: Pfn, flags: PageFlags) -> Result<()> {
    if pfn > PFN_MASK as Pfn || !flags.is_accessible() {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

/// Checks that `pages` pages at `iova` are aligned and stay in one window.
fn check_span(iova: Iova, pages: usize) -> Result<()> {
    let offset = iova & (AS_WINDOW_SIZE - 1);
    let len = (pages as u64) << PAGE_SHIFT;
    if !is_page_aligned(iova) || pages == 0 || offset + len > AS_WINDOW_SIZE {
        return Err(Error::InvalidArgs);
    }
    Ok(())
}

/// The page directory of one address space and the tables it points at.
pub struct PageDirectory {
    asid: Asid,
    base: Iova,
    frames: Arc<dyn FrameAllocator>,
    pdir: PtFrame,
    ptbls: Box<[Option<PtFrame>]>,
    pte_count: Box<[u32]>,
}

impl PageDirectory {
    /// Allocates a directory with every entry vacant, serving the window
    /// that starts at `base`.
    pub fn new(asid: Asid, base: Iova, frames: &Arc<dyn FrameAllocator>) -> Result<Self> {
        if base % AS_WINDOW_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let pdir = PtFrame::alloc(frames, |pdn| Pde::vacant(pdn).raw())?;
        Ok(Self {
            asid,
            base,
            frames: frames.clone(),
            pdir,
            ptbls: (0..NR_PDES).map(|_| None).collect(),
            pte_count: alloc::vec![0; NR_PDES].into_boxed_slice(),
        })
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// The first IOVA of the window the directory serves.
    pub fn base(&self) -> Iova {
        self.base
    }

    /// The physical address of the directory frame.
    pub fn paddr(&self) -> Paddr {
        self.pdir.paddr()
    }

    pub fn pde(&self, pdn: usize) -> Pde {
        Pde::from_raw(self.pdir.read(pdn))
    }

    pub fn live_ptes(&self, pdn: usize) -> u32 {
        self.pte_count[pdn]
    }

    pub fn has_table(&self, pdn: usize) -> bool {
        self.ptbls[pdn].is_some()
    }

    /// The number of page tables currently allocated.
    pub fn table_count(&self) -> usize {
        self.ptbls.iter().filter(|t| t.is_some()).count()
    }

    /// Whether every directory entry is vacant.
    pub fn is_empty(&self) -> bool {
        (0..NR_PDES).all(|pdn| self.pde(pdn).kind() == PdeKind::Vacant)
    }

    /// Finds the PTE of `iova`, allocating its page table if `allocate` is
    /// set and the directory entry is vacant.
    ///
    /// Fails with `NotMapped` for a vacant entry when not allocating, and
    /// with `AlreadyMapped` if `iova` lies in a 4 MiB mapping.
    pub fn locate_pte(
        &mut self,
        iova: Iova,
        allocate: bool,
        inv: &dyn Invalidate,
    ) -> Result<PteSlot> {
        let (pdn, ptn) = (pdn(iova), ptn(iova));
        match self.pde(pdn).kind() {
            PdeKind::Table(_) => {}
            PdeKind::Large(..) => {
                warn!(
                    "[SMMU] AS {}: iova {:#x} lies in a large page",
                    self.asid, iova
                );
                return Err(Error::AlreadyMapped);
            }
            PdeKind::Vacant if !allocate => return Err(Error::NotMapped),
            PdeKind::Vacant => {
                let table = self.alloc_table(pdn)?;
                self.link_table(pdn, table, 0, inv);
            }
        }
        let table = self.ptbls[pdn].as_ref().ok_or(Error::NotMapped)?;
        Ok(PteSlot {
            pdn,
            ptn,
            entry_paddr: table.entry_paddr(ptn),
        })
    }

    pub fn pte(&self, slot: PteSlot) -> Pte {
        match &self.ptbls[slot.pdn] {
            Some(table) => Pte::from_raw(table.read(slot.ptn)),
            None => Pte::vacant(entry_iova(slot.pdn, slot.ptn)),
        }
    }

    /// Encodes a mapping into the PTE at `slot`.
    ///
    /// The caller accounts the live count and flushes the entry.
    pub fn write_pte(&mut self, slot: PteSlot, pfn: Pfn, flags: PageFlags) -> Result<()> {
        check_frame(pfn, flags)?;
        let table = self.ptbls[slot.pdn].as_mut().ok_or(Error::NotMapped)?;
        table.write(slot.ptn, Pte::new(pfn, flags).raw());
        Ok(())
    }

    /// Maps one 4 KiB page.
    pub fn map_page(
        &mut self,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
        inv: &dyn Invalidate,
    ) -> Result<()> {
        check_span(iova, 1)?;
        check_frame(pfn, flags)?;
        let slot = self.locate_pte(iova, true, inv)?;
        if self.pte(slot).is_present() {
            warn!("[SMMU] AS {}: iova {:#x} is already mapped", self.asid, iova);
            return Err(Error::AlreadyMapped);
        }
        self.write_pte(slot, pfn, flags)?;
        self.pte_count[slot.pdn] += 1;
        if let Some(table) = &self.ptbls[slot.pdn] {
            table.flush_for_device(slot.ptn, 1);
        }
        inv.flush_single(self.asid, iova, slot.entry_paddr, EntryLevel::Pte);
        Ok(())
    }

    /// Checks that [`PageDirectory::map_page`] would succeed, without
    /// changing anything.
    pub fn check_map_page(&self, iova: Iova, pfn: Pfn, flags: PageFlags) -> Result<()> {
        check_span(iova, 1)?;
        check_frame(pfn, flags)?;
        let (pdn, ptn) = (pdn(iova), ptn(iova));
        let mapped = match self.pde(pdn).kind() {
            PdeKind::Vacant => false,
            PdeKind::Large(..) => true,
            PdeKind::Table(_) => self.pte(PteSlot {
                pdn,
                ptn,
                entry_paddr: 0,
            })
            .is_present(),
        };
        if mapped {
            warn!("[SMMU] AS {}: iova {:#x} is already mapped", self.asid, iova);
            return Err(Error::AlreadyMapped);
        }
        Ok(())
    }

    /// Maps a 4 MiB page directly in the directory entry of `iova`.
    pub fn write_large_pde(
        &mut self,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
        inv: &dyn Invalidate,
    ) -> Result<()> {
        self.check_map_large(iova, pfn, flags)?;
        let pdn = pdn(iova);
        self.set_pde(pdn, Pde::large(pfn, flags), iova, inv);
        Ok(())
    }

    /// Checks that [`PageDirectory::write_large_pde`] would succeed.
    pub fn check_map_large(&self, iova: Iova, pfn: Pfn, flags: PageFlags) -> Result<()> {
        if !is_large_page_aligned(iova) || !is_large_page_aligned(pfn << PAGE_SHIFT) {
            return Err(Error::InvalidArgs);
        }
        check_frame(pfn, flags)?;
        if self.pde(pdn(iova)).kind() != PdeKind::Vacant {
            warn!(
                "[SMMU] AS {}: directory entry of {:#x} is in use",
                self.asid, iova
            );
            return Err(Error::AlreadyMapped);
        }
        Ok(())
    }

    /// Looks up the translation of `iova`.
    pub fn read_mapping(&self, iova: Iova) -> MappingInfo {
        let pdn = pdn(iova);
        match self.pde(pdn).kind() {
            PdeKind::Vacant => MappingInfo::NOT_FOUND,
            PdeKind::Large(pfn, _) => MappingInfo {
                paddr: (pfn << PAGE_SHIFT) + (iova & (LARGE_PAGE_SIZE as u64 - 1)),
                span: LARGE_PAGE_SIZE as u64,
                live_ptes: 1,
            },
            PdeKind::Table(_) => {
                let pte = self.pte(PteSlot {
                    pdn,
                    ptn: ptn(iova),
                    entry_paddr: 0,
                });
                if !pte.is_present() {
                    return MappingInfo::NOT_FOUND;
                }
                MappingInfo {
                    paddr: pte.paddr() + (iova & (PAGE_SIZE as u64 - 1)),
                    span: PAGE_SIZE as u64,
                    live_ptes: self.pte_count[pdn],
                }
            }
        }
    }

    /// Maps consecutive 4 KiB pages at `iova` to the frames in `pfns`.
    ///
    /// Entries that were already mapped are overwritten. Either every page
    /// is mapped or, on failure, nothing changed. More than `threshold`
    /// pages are retired with one whole-AS flush.
    pub fn map_run(
        &mut self,
        iova: Iova,
        pfns: &[Pfn],
        flags: PageFlags,
        threshold: usize,
        inv: &dyn Invalidate,
    ) -> Result<()> {
        self.check_map_run(iova, pfns, flags)?;

        let end = iova + ((pfns.len() as u64) << PAGE_SHIFT);
        let mut fresh = Vec::new();
        let mut cur = iova;
        while cur < end {
            let pdn = pdn(cur);
            if self.pde(pdn).kind() == PdeKind::Vacant {
                fresh.push((pdn, self.alloc_table(pdn)?));
            }
            cur = (cur | (LARGE_PAGE_SIZE as u64 - 1)) + 1;
        }
        for (pdn, table) in fresh {
            self.link_table(pdn, table, 0, inv);
        }

        let flush_all = pfns.len() > threshold;
        let mut done = 0;
        while done < pfns.len() {
            let cur = iova + ((done as u64) << PAGE_SHIFT);
            let (pdn, ptn) = (pdn(cur), ptn(cur));
            let n = (pfns.len() - done).min(NR_PTES - ptn);
            let table = self.ptbls[pdn].as_mut().ok_or(Error::NotMapped)?;
            let mut added = 0;
            for (idx, &pfn) in (ptn..ptn + n).zip(&pfns[done..done + n]) {
                if !Pte::from_raw(table.read(idx)).is_present() {
                    added += 1;
                }
                table.write(idx, Pte::new(pfn, flags).raw());
            }
            table.flush_for_device(ptn, n);
            let first_entry = table.entry_paddr(ptn);
            self.pte_count[pdn] += added;
            if !flush_all {
                inv.flush_range(self.asid, cur, first_entry, n);
            }
            done += n;
        }
        if flush_all {
            inv.flush_all(self.asid);
        }
        Ok(())
    }

    /// Checks whether [`Self::map_run`] would accept its arguments, short of
    /// running out of memory.
    pub fn check_map_run(&self, iova: Iova, pfns: &[Pfn], flags: PageFlags) -> Result<()> {
        check_span(iova, pfns.len())?;
        for &pfn in pfns {
            check_frame(pfn, flags)?;
        }
        self.check_no_large(iova, pfns.len())
    }

    /// Fails with `AlreadyMapped` if a 4 MiB mapping overlaps the range.
    pub fn check_no_large(&self, iova: Iova, pages: usize) -> Result<()> {
        check_span(iova, pages)?;
        let end = iova + ((pages as u64) << PAGE_SHIFT);
        let mut cur = iova;
        while cur < end {
            if let PdeKind::Large(..) = self.pde(pdn(cur)).kind() {
                warn!(
                    "[SMMU] AS {}: iova {:#x} lies in a large page",
                    self.asid, cur
                );
                return Err(Error::AlreadyMapped);
            }
            cur = (cur | (LARGE_PAGE_SIZE as u64 - 1)) + 1;
        }
        Ok(())
    }

    /// Unmaps `bytes` at `iova` and returns the number of bytes whose
    /// mapping was removed.
    ///
    /// A 4 MiB mapping that is only partly covered is first split into
    /// page-sized entries. Vacant pages in the range are reported; if no
    /// page in the range was mapped the call fails with `NotMapped`. More
    /// than `threshold` pages are retired with one whole-AS flush.
    pub fn unmap(
        &mut self,
        iova: Iova,
        bytes: usize,
        threshold: usize,
        inv: &dyn Invalidate,
    ) -> Result<usize> {
        if bytes % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgs);
        }
        let pages = bytes / PAGE_SIZE;
        check_span(iova, pages)?;
        let end = iova + bytes as u64;

        // Allocate the tables for splitting large pages before touching
        // anything, so that running out of memory leaves no trace.
        let mut splits = Vec::new();
        let mut cur = iova;
        while cur < end {
            let pdn = pdn(cur);
            let pde_end = (cur | (LARGE_PAGE_SIZE as u64 - 1)) + 1;
            let covers_pde = is_large_page_aligned(cur) && pde_end <= end;
            if !covers_pde {
                if let PdeKind::Large(pfn, flags) = self.pde(pdn).kind() {
                    splits.push((pdn, self.alloc_split_table(pfn, flags)?));
                }
            }
            cur = pde_end;
        }
        for (pdn, table) in splits {
            warn!(
                "[SMMU] AS {}: splitting large page at {:#x} for a partial unmap",
                self.asid,
                entry_iova(pdn, 0)
            );
            self.link_table(pdn, table, NR_PTES as u32, inv);
        }

        let flush_all = pages > threshold;
        let mut retired = Vec::new();
        let mut cleared = 0;
        let mut cur = iova;
        while cur < end {
            let (pdn, ptn) = (pdn(cur), ptn(cur));
            let n = (((end - cur) >> PAGE_SHIFT) as usize).min(NR_PTES - ptn);
            match self.pde(pdn).kind() {
                PdeKind::Vacant => {}
                PdeKind::Large(..) => {
                    self.set_pde(pdn, Pde::vacant(pdn), cur, inv);
                    cleared += n;
                }
                PdeKind::Table(_) => {
                    let hit = self.clear_ptes(pdn, ptn, n, cur, flush_all, inv);
                    if self.pte_count[pdn] == 0 && hit > 0 {
                        retired.extend(self.unlink_table(pdn, inv));
                    }
                    cleared += hit;
                }
            }
            cur += (n as u64) << PAGE_SHIFT;
        }
        if flush_all {
            inv.flush_all(self.asid);
        }
        // Freed tables go back to the allocator only after the flush.
        drop(retired);

        if cleared < pages {
            warn!(
                "[SMMU] AS {}: {} of {} page(s) at {:#x} were not mapped",
                self.asid,
                pages - cleared,
                pages,
                iova
            );
        }
        if cleared == 0 {
            return Err(Error::NotMapped);
        }
        Ok(cleared * PAGE_SIZE)
    }

    /// Vacates the 4 MiB mapping at `iova`.
    pub fn unmap_large(&mut self, iova: Iova, inv: &dyn Invalidate) -> Result<()> {
        if !is_large_page_aligned(iova) {
            return Err(Error::InvalidArgs);
        }
        let pdn = pdn(iova);
        if !matches!(self.pde(pdn).kind(), PdeKind::Large(..)) {
            warn!(
                "[SMMU] AS {}: no large page at {:#x} to unmap",
                self.asid, iova
            );
            return Err(Error::NotMapped);
        }
        self.set_pde(pdn, Pde::vacant(pdn), iova, inv);
        Ok(())
    }

    /// Splits the 4 MiB mapping of `iova` into a full page table.
    pub fn remap_large(&mut self, iova: Iova, inv: &dyn Invalidate) -> Result<()> {
        let pdn = pdn(iova);
        let PdeKind::Large(pfn, flags) = self.pde(pdn).kind() else {
            return Err(Error::NotMapped);
        };
        let table = self.alloc_split_table(pfn, flags)?;
        warn!(
            "[SMMU] AS {}: splitting large page at {:#x}",
            self.asid,
            entry_iova(pdn, 0)
        );
        self.link_table(pdn, table, NR_PTES as u32, inv);
        Ok(())
    }

    /// Lists the mappings overlapping `range`, merged into regions.
    ///
    /// A 4 MiB mapping is reported whole even when `range` covers part of
    /// it. The range must lie in one window.
    pub fn regions(&self, range: Range<Iova>) -> Vec<Region> {
        let mut out: Vec<Region> = Vec::new();
        let mut push = |iova: Iova, paddr: Paddr, len: u64, flags: PageFlags, large: bool| {
            if let Some(last) = out.last_mut() {
                let last_len = last.iova.end - last.iova.start;
                if last.iova.end == iova
                    && last.paddr + last_len == paddr
                    && last.flags == flags
                    && last.large == large
                {
                    last.iova.end += len;
                    return;
                }
            }
            out.push(Region {
                iova: iova..iova + len,
                paddr,
                flags,
                large,
            });
        };

        let mut cur = range.start;
        while cur < range.end {
            let pdn = pdn(cur);
            let pde_start = cur & !(LARGE_PAGE_SIZE as u64 - 1);
            let pde_end = pde_start + LARGE_PAGE_SIZE as u64;
            match self.pde(pdn).kind() {
                PdeKind::Vacant => {}
                PdeKind::Large(pfn, flags) => {
                    push(pde_start, pfn << PAGE_SHIFT, LARGE_PAGE_SIZE as u64, flags, true)
                }
                PdeKind::Table(_) => {
                    if let Some(table) = &self.ptbls[pdn] {
                        let last = range.end.min(pde_end) - 1;
                        for idx in ptn(cur)..=ptn(last) {
                            let pte = Pte::from_raw(table.read(idx));
                            if pte.is_present() {
                                let at = pde_start + ((idx as u64) << PAGE_SHIFT);
                                push(at, pte.paddr(), PAGE_SIZE as u64, pte.flags(), false);
                            }
                        }
                    }
                }
            }
            cur = pde_end;
        }
        out
    }

    /// Lists every mapping of the window, merged into regions.
    pub fn walk(&self) -> Vec<Region> {
        self.regions(self.base..self.base + AS_WINDOW_SIZE)
    }

    fn alloc_table(&self, pdn: usize) -> Result<PtFrame> {
        PtFrame::alloc(&self.frames, |ptn| Pte::vacant(entry_iova(pdn, ptn)).raw())
    }

    fn alloc_split_table(&self, pfn: Pfn, flags: PageFlags) -> Result<PtFrame> {
        PtFrame::alloc(&self.frames, |ptn| Pte::new(pfn + ptn as Pfn, flags).raw())
    }

    fn set_pde(&mut self, pdn: usize, pde: Pde, iova: Iova, inv: &dyn Invalidate) {
        self.pdir.write(pdn, pde.raw());
        self.pdir.flush_for_device(pdn, 1);
        inv.flush_single(
            self.asid,
            iova,
            self.pdir.entry_paddr(pdn),
            EntryLevel::Pde,
        );
    }

    fn link_table(&mut self, pdn: usize, table: PtFrame, live: u32, inv: &dyn Invalidate) {
        let pde = Pde::table(table.paddr());
        self.ptbls[pdn] = Some(table);
        self.pte_count[pdn] = live;
        self.set_pde(pdn, pde, entry_iova(pdn, 0), inv);
    }

    /// Vacates the directory entry and hands back its table frame.
    fn unlink_table(&mut self, pdn: usize, inv: &dyn Invalidate) -> Option<PtFrame> {
        self.set_pde(pdn, Pde::vacant(pdn), entry_iova(pdn, 0), inv);
        self.pte_count[pdn] = 0;
        self.ptbls[pdn].take()
    }

    /// Vacates `n` PTEs from `ptn` on and returns how many were mapped.
    fn clear_ptes(
        &mut self,
        pdn: usize,
        ptn: usize,
        n: usize,
        iova: Iova,
        flush_all: bool,
        inv: &dyn Invalidate,
    ) -> usize {
        let Some(table) = self.ptbls[pdn].as_mut() else {
            return 0;
        };
        let mut hit = 0;
        for idx in ptn..ptn + n {
            if Pte::from_raw(table.read(idx)).is_present() {
                table.write(idx, Pte::vacant(entry_iova(pdn, idx)).raw());
                hit += 1;
            }
        }
        if hit == 0 {
            return 0;
        }
        table.flush_for_device(ptn, n);
        let first_entry = table.entry_paddr(ptn);
        self.pte_count[pdn] = self.pte_count[pdn].saturating_sub(hit as u32);
        if !flush_all {
            inv.flush_range(self.asid, iova, first_entry, n);
        }
        hit
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("asid", &self.asid)
            .field("pdir", &self.pdir)
            .field("tables", &self.table_count())
            .finish()
    }
}
