// SPDX-License-Identifier: MPL-2.0

//! The bit layout of page-directory and page-table entries.
//!
//! Both levels use 32-bit entries:
//!
//! ```text
//!  31  30  29  28  27      22 21                  0
//! +---+---+---+---+----------+---------------------+
//! | R | W | NS| NX| reserved |  frame number (PFN) |
//! +---+---+---+---+----------+---------------------+
//! ```
//!
//! `NX` ("next") is only meaningful in a PDE and marks a pointer to a page
//! table; a PDE without it maps a 4 MiB page directly.
//!
//! Vacant entries are not zero. A vacant PDE holds `pdn << 10` and a vacant
//! PTE holds the frame number of its own IOVA (`iova >> 12`), both without
//! any attribute bit, so a table that was never initialized can be told
//! apart from one whose entries were deliberately cleared. Since every
//! mapped entry carries `R` or `W`, a mapping can never look vacant.

use bitflags::bitflags;

use crate::mm::{Iova, LARGE_PAGE_SHIFT, PAGE_SHIFT, Paddr, Pfn};

/// Entries per page directory.
pub const NR_PDES: usize = 1024;
/// Entries per page table.
pub const NR_PTES: usize = 1024;

/// The largest frame number an entry can hold.
pub const PFN_MASK: u32 = 0x003f_ffff;

const PDE_NEXT: u32 = 1 << 28;

bitflags! {
    /// The access attributes of a mapping.
    pub struct PageFlags: u32 {
        const READABLE = 1 << 31;
        const WRITABLE = 1 << 30;
        const NONSECURE = 1 << 29;
        const RW = Self::READABLE.bits | Self::WRITABLE.bits;
    }
}

impl PageFlags {
    /// Whether the flags grant any access, as required for a mapping.
    pub fn is_accessible(&self) -> bool {
        self.intersects(Self::RW)
    }
}

/// The attributes of a PDE pointing at a page table.
const TABLE_ATTRS: u32 =
    PageFlags::READABLE.bits() | PageFlags::WRITABLE.bits() | PageFlags::NONSECURE.bits();

/// The page-directory index of `iova` within its 32-bit window.
pub const fn pdn(iova: Iova) -> usize {
    ((iova >> LARGE_PAGE_SHIFT) & (NR_PDES as u64 - 1)) as usize
}

/// The page-table index of `iova`.
pub const fn ptn(iova: Iova) -> usize {
    ((iova >> PAGE_SHIFT) & (NR_PTES as u64 - 1)) as usize
}

/// A page-table entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pte(u32);

impl Pte {
    pub const fn vacant(iova: Iova) -> Self {
        Self((pdn(iova) << 10 | ptn(iova)) as u32)
    }

    pub fn new(pfn: Pfn, flags: PageFlags) -> Self {
        debug_assert!(pfn <= PFN_MASK as Pfn);
        Self(pfn as u32 & PFN_MASK | flags.bits())
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn is_present(&self) -> bool {
        self.flags().is_accessible()
    }

    pub fn pfn(&self) -> Pfn {
        (self.0 & PFN_MASK) as Pfn
    }

    pub fn paddr(&self) -> Paddr {
        self.pfn() << PAGE_SHIFT
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }
}

/// What a page-directory entry refers to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PdeKind {
    Vacant,
    /// A page table at this physical address.
    Table(Paddr),
    /// A 4 MiB page starting at this frame.
    Large(Pfn, PageFlags),
}

/// A page-directory entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Pde(u32);

impl Pde {
    pub const fn vacant(pdn: usize) -> Self {
        Self((pdn as u32) << 10)
    }

    pub fn table(table: Paddr) -> Self {
        Self((table >> PAGE_SHIFT) as u32 & PFN_MASK | TABLE_ATTRS | PDE_NEXT)
    }

    pub fn large(pfn: Pfn, flags: PageFlags) -> Self {
        debug_assert!(pfn <= PFN_MASK as Pfn);
        Self(pfn as u32 & PFN_MASK | flags.bits())
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn kind(&self) -> PdeKind {
        let flags = PageFlags::from_bits_truncate(self.0);
        let pfn = (self.0 & PFN_MASK) as Pfn;
        if !flags.is_accessible() {
            PdeKind::Vacant
        } else if self.0 & PDE_NEXT != 0 {
            PdeKind::Table(pfn << PAGE_SHIFT)
        } else {
            PdeKind::Large(pfn, flags)
        }
    }
}
