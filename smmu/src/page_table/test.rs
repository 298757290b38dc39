// SPDX-License-Identifier: MPL-2.0

use spin::Mutex;

use super::*;
use crate::mm::SimFrameAllocator;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Single(Iova, EntryLevel),
    Range(Iova, usize),
    All,
}

#[derive(Default)]
struct Recorder {
    ops: Mutex<Vec<Op>>,
}

impl Recorder {
    fn take(&self) -> Vec<Op> {
        core::mem::take(&mut *self.ops.lock())
    }
}

impl Invalidate for Recorder {
    fn flush_single(&self, _asid: Asid, iova: Iova, _entry: Paddr, level: EntryLevel) {
        self.ops.lock().push(Op::Single(iova, level));
    }

    fn flush_range(&self, _asid: Asid, iova: Iova, _first_entry: Paddr, count: usize) {
        self.ops.lock().push(Op::Range(iova, count));
    }

    fn flush_all(&self, _asid: Asid) {
        self.ops.lock().push(Op::All);
    }
}

const RW: PageFlags = PageFlags::RW;

fn setup(capacity: usize) -> (Arc<SimFrameAllocator>, PageDirectory, Recorder) {
    let sim = Arc::new(SimFrameAllocator::new(0x8000_0000, capacity));
    let frames: Arc<dyn FrameAllocator> = sim.clone();
    let pd = PageDirectory::new(0, 0, &frames).unwrap();
    (sim, pd, Recorder::default())
}

#[test]
fn vacant_sentinels() {
    let (sim, mut pd, inv) = setup(8);
    assert_eq!(pd.pde(0).raw(), 0);
    assert_eq!(pd.pde(5).raw(), 5 << 10);
    assert_eq!(pd.pde(5).kind(), PdeKind::Vacant);
    assert!(pd.is_empty());

    let iova = 0x1234_5000;
    let slot = pd.locate_pte(iova, true, &inv).unwrap();
    assert_eq!(pd.pte(slot).raw(), 0x12345);
    assert!(!pd.pte(slot).is_present());
    assert_eq!(pd.live_ptes(slot.pdn), 0);
    assert!(matches!(pd.pde(slot.pdn).kind(), PdeKind::Table(_)));
    assert_eq!(sim.allocated(), 2);
    assert_eq!(inv.take(), [Op::Single(0x1200_0000, EntryLevel::Pde)]);
}

#[test]
fn locate_without_allocation() {
    let (_sim, mut pd, inv) = setup(8);
    assert_eq!(pd.locate_pte(0x10000, false, &inv), Err(Error::NotMapped));
    assert_eq!(pd.table_count(), 0);
}

#[test]
fn map_read_unmap_page() {
    let (sim, mut pd, inv) = setup(8);
    pd.map_page(0x10000, 0x500, RW, &inv).unwrap();
    assert_eq!(
        pd.read_mapping(0x10abc),
        MappingInfo {
            paddr: 0x50_0abc,
            span: 4096,
            live_ptes: 1,
        }
    );
    assert_eq!(
        inv.take(),
        [
            Op::Single(0, EntryLevel::Pde),
            Op::Single(0x10000, EntryLevel::Pte),
        ]
    );

    assert_eq!(pd.unmap(0x10000, PAGE_SIZE, 512, &inv), Ok(PAGE_SIZE));
    assert_eq!(pd.read_mapping(0x10000), MappingInfo::NOT_FOUND);
    assert!(!pd.read_mapping(0x10000).is_mapped());
    assert!(!pd.has_table(0));
    assert_eq!(sim.allocated(), 1);

    // A second unmap of the same page is reported, not ignored.
    assert_eq!(pd.unmap(0x10000, PAGE_SIZE, 512, &inv), Err(Error::NotMapped));
}

#[test]
fn double_map_is_rejected() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_page(0x2000, 0x10, RW, &inv).unwrap();
    assert_eq!(pd.map_page(0x2000, 0x20, RW, &inv), Err(Error::AlreadyMapped));
    assert_eq!(pd.read_mapping(0x2000).paddr, 0x10000);
    assert_eq!(pd.live_ptes(0), 1);
}

#[test]
fn bad_mapping_arguments() {
    let (_sim, mut pd, inv) = setup(8);
    assert_eq!(
        pd.map_page(0x1000, 0x10, PageFlags::NONSECURE, &inv),
        Err(Error::InvalidArgs)
    );
    assert_eq!(
        pd.map_page(0x1000, PFN_MASK as Pfn + 1, RW, &inv),
        Err(Error::InvalidArgs)
    );
    assert_eq!(pd.map_page(0x1800, 0x10, RW, &inv), Err(Error::InvalidArgs));
    assert_eq!(pd.unmap(0x1000, 100, 512, &inv), Err(Error::InvalidArgs));
    assert!(pd.is_empty());
}

#[test]
fn flags_are_encoded() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_page(0x3000, 0x42, PageFlags::READABLE | PageFlags::NONSECURE, &inv)
        .unwrap();
    let slot = pd.locate_pte(0x3000, false, &inv).unwrap();
    let pte = pd.pte(slot);
    assert_eq!(pte.raw(), 0x42 | 1 << 31 | 1 << 29);
    assert_eq!(pte.flags(), PageFlags::READABLE | PageFlags::NONSECURE);
    assert_eq!(pte.pfn(), 0x42);
}

#[test]
fn full_table_lifecycle() {
    let (sim, mut pd, inv) = setup(8);
    let base = 3 << LARGE_PAGE_SHIFT;
    for i in 0..NR_PTES as u64 {
        pd.map_page(base + (i << PAGE_SHIFT), 0x1000 + i, RW, &inv)
            .unwrap();
    }
    assert_eq!(pd.live_ptes(3), 1024);
    assert_eq!(pd.read_mapping(base + 0x3f_f000).live_ptes, 1024);

    for i in 0..NR_PTES as u64 {
        pd.unmap(base + (i << PAGE_SHIFT), PAGE_SIZE, 512, &inv)
            .unwrap();
    }
    assert_eq!(pd.live_ptes(3), 0);
    assert!(!pd.has_table(3));
    assert_eq!(pd.pde(3), Pde::vacant(3));
    assert_eq!(sim.allocated(), 1);
}

#[test]
fn large_page_in_directory() {
    let (sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0x40_0000, 0x1000, RW, &inv).unwrap();
    assert_eq!(pd.pde(1).kind(), PdeKind::Large(0x1000, RW));
    assert!(!pd.has_table(1));
    assert_eq!(sim.allocated(), 1);
    assert_eq!(inv.take(), [Op::Single(0x40_0000, EntryLevel::Pde)]);

    let info = pd.read_mapping(0x41_2345);
    assert_eq!(info.paddr, 0x101_2345);
    assert_eq!(info.span, LARGE_PAGE_SIZE as u64);
    assert!(info.live_ptes >= 1);

    assert_eq!(
        pd.write_large_pde(0x40_0000, 0x2000, RW, &inv),
        Err(Error::AlreadyMapped)
    );
    assert_eq!(pd.map_page(0x40_1000, 0x5, RW, &inv), Err(Error::AlreadyMapped));
}

#[test]
fn large_page_alignment() {
    let (_sim, mut pd, inv) = setup(8);
    assert_eq!(
        pd.write_large_pde(0x40_1000, 0x1000, RW, &inv),
        Err(Error::InvalidArgs)
    );
    assert_eq!(
        pd.write_large_pde(0x40_0000, 0x1001, RW, &inv),
        Err(Error::InvalidArgs)
    );
    assert!(pd.is_empty());
}

#[test]
fn large_page_over_table() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_page(0x80_3000, 0x77, RW, &inv).unwrap();
    assert_eq!(
        pd.write_large_pde(0x80_0000, 0x2000, RW, &inv),
        Err(Error::AlreadyMapped)
    );
    assert_eq!(pd.read_mapping(0x80_3000).paddr, 0x77000);
    assert_eq!(pd.live_ptes(2), 1);
}

#[test]
fn partial_unmap_splits_large_page() {
    let (sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0x40_0000, 0x1000, RW, &inv).unwrap();
    inv.take();

    assert_eq!(pd.unmap(0x40_1000, PAGE_SIZE, 512, &inv), Ok(PAGE_SIZE));
    assert!(pd.has_table(1));
    assert_eq!(pd.live_ptes(1), 1023);
    assert_eq!(sim.allocated(), 2);
    assert_eq!(
        pd.read_mapping(0x40_0000),
        MappingInfo {
            paddr: 0x100_0000,
            span: 4096,
            live_ptes: 1023,
        }
    );
    assert_eq!(pd.read_mapping(0x40_1000), MappingInfo::NOT_FOUND);
    assert_eq!(pd.read_mapping(0x40_2000).paddr, 0x100_2000);
    assert_eq!(
        inv.take(),
        [
            Op::Single(0x40_0000, EntryLevel::Pde),
            Op::Range(0x40_1000, 1),
        ]
    );
}

#[test]
fn split_without_memory_changes_nothing() {
    let (_sim, mut pd, inv) = setup(1);
    pd.write_large_pde(0x40_0000, 0x1000, RW, &inv).unwrap();
    assert_eq!(pd.unmap(0x40_1000, PAGE_SIZE, 512, &inv), Err(Error::NoMemory));
    assert_eq!(pd.pde(1).kind(), PdeKind::Large(0x1000, RW));
    assert_eq!(pd.remap_large(0x40_0000, &inv), Err(Error::NoMemory));
}

#[test]
fn whole_large_page_unmap() {
    let (_sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0xc0_0000, 0x1c00, RW, &inv).unwrap();
    assert_eq!(
        pd.unmap(0xc0_0000, LARGE_PAGE_SIZE, 512, &inv),
        Ok(LARGE_PAGE_SIZE)
    );
    assert!(pd.is_empty());
    assert_eq!(pd.table_count(), 0);
}

#[test]
fn unmap_large_vacates_directory_entry() {
    let (_sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0x80_0000, 0x2000, RW, &inv).unwrap();
    inv.take();
    assert_eq!(pd.unmap_large(0x80_1000, &inv), Err(Error::InvalidArgs));
    pd.unmap_large(0x80_0000, &inv).unwrap();
    assert_eq!(pd.pde(2), Pde::vacant(2));
    assert_eq!(inv.take(), [Op::Single(0x80_0000, EntryLevel::Pde)]);
    assert_eq!(pd.unmap_large(0x80_0000, &inv), Err(Error::NotMapped));

    pd.map_page(0x80_0000, 0x10, RW, &inv).unwrap();
    assert_eq!(pd.unmap_large(0x80_0000, &inv), Err(Error::NotMapped));
}

#[test]
fn remap_large_keeps_translation() {
    let (_sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0x40_0000, 0x1000, PageFlags::READABLE, &inv)
        .unwrap();
    pd.remap_large(0x40_0000, &inv).unwrap();
    assert_eq!(pd.live_ptes(1), 1024);
    for offset in [0, 0x1000, 0x3f_f000] {
        let info = pd.read_mapping(0x40_0000 + offset);
        assert_eq!(info.paddr, 0x100_0000 + offset);
        assert_eq!(info.span, 4096);
    }
    assert_eq!(pd.remap_large(0x40_0000, &inv), Err(Error::NotMapped));
}

#[test]
fn run_across_directory_boundary() {
    let (sim, mut pd, inv) = setup(8);
    pd.map_run(0x3f_f000, &[0x10, 0x11], RW, 512, &inv).unwrap();
    assert_eq!(pd.live_ptes(0), 1);
    assert_eq!(pd.live_ptes(1), 1);
    assert_eq!(pd.read_mapping(0x40_0000).paddr, 0x11000);
    assert_eq!(sim.allocated(), 3);

    assert_eq!(pd.unmap(0x3f_f000, 2 * PAGE_SIZE, 512, &inv), Ok(2 * PAGE_SIZE));
    assert_eq!(pd.table_count(), 0);
    assert_eq!(sim.allocated(), 1);
}

#[test]
fn run_without_memory_changes_nothing() {
    let (sim, mut pd, inv) = setup(2);
    assert_eq!(
        pd.map_run(0x3f_f000, &[0x10, 0x11], RW, 512, &inv),
        Err(Error::NoMemory)
    );
    assert!(pd.is_empty());
    assert_eq!(sim.allocated(), 1);
    assert!(inv.take().is_empty());
}

#[test]
fn run_over_large_page_is_rejected() {
    let (_sim, mut pd, inv) = setup(8);
    pd.write_large_pde(0x40_0000, 0x1000, RW, &inv).unwrap();
    assert_eq!(
        pd.map_run(0x3f_e000, &[1, 2, 3], RW, 512, &inv),
        Err(Error::AlreadyMapped)
    );
    assert!(!pd.has_table(0));
}

#[test]
fn run_overwrites_without_double_counting() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_page(0x1000, 0x10, RW, &inv).unwrap();
    pd.map_run(0x0, &[0x20, 0x21, 0x22], RW, 512, &inv).unwrap();
    assert_eq!(pd.live_ptes(0), 3);
    assert_eq!(pd.read_mapping(0x1000).paddr, 0x21000);
}

#[test]
fn flush_granularity_follows_threshold() {
    let (_sim, mut pd, inv) = setup(8);
    let pfns: Vec<Pfn> = (0x100..0x110).collect();
    pd.map_run(0x10000, &pfns, RW, 8, &inv).unwrap();
    let ops = inv.take();
    assert_eq!(ops.last(), Some(&Op::All));
    assert!(!ops.iter().any(|op| matches!(op, Op::Range(..))));

    pd.unmap(0x10000, 4 * PAGE_SIZE, 8, &inv).unwrap();
    assert_eq!(inv.take(), [Op::Range(0x10000, 4)]);

    pd.unmap(0x14000, 12 * PAGE_SIZE, 8, &inv).unwrap();
    let ops = inv.take();
    assert_eq!(ops.last(), Some(&Op::All));
    assert!(!ops.iter().any(|op| matches!(op, Op::Range(..))));
    assert!(pd.is_empty());
}

#[test]
fn partly_vacant_unmap_reports_mapped_bytes() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_page(0x5000, 0x50, RW, &inv).unwrap();
    assert_eq!(pd.unmap(0x4000, 3 * PAGE_SIZE, 512, &inv), Ok(PAGE_SIZE));
}

#[test]
fn walk_merges_contiguous_pages() {
    let (_sim, mut pd, inv) = setup(8);
    pd.map_run(0x0, &[0x100, 0x101, 0x102], RW, 512, &inv).unwrap();
    pd.map_page(0x3000, 0x200, RW, &inv).unwrap();
    pd.write_large_pde(0x80_0000, 0x2000, PageFlags::READABLE, &inv)
        .unwrap();
    assert_eq!(
        pd.walk(),
        [
            Region {
                iova: 0x0..0x3000,
                paddr: 0x10_0000,
                flags: RW,
                large: false,
            },
            Region {
                iova: 0x3000..0x4000,
                paddr: 0x20_0000,
                flags: RW,
                large: false,
            },
            Region {
                iova: 0x80_0000..0xc0_0000,
                paddr: 0x200_0000,
                flags: PageFlags::READABLE,
                large: true,
            },
        ]
    );
    assert_eq!(pd.regions(0x1000..0x2000).len(), 1);
    assert_eq!(pd.regions(0x1000..0x2000)[0].iova, 0x1000..0x2000);
}

#[test]
fn walk_reports_iovas_of_upper_window() {
    let sim = Arc::new(SimFrameAllocator::new(0x8000_0000, 8));
    let frames: Arc<dyn FrameAllocator> = sim.clone();
    assert_eq!(
        PageDirectory::new(1, 0x8000_0000, &frames).err(),
        Some(Error::InvalidArgs)
    );

    let inv = Recorder::default();
    let mut pd = PageDirectory::new(1, 1 << 32, &frames).unwrap();
    assert_eq!(pd.base(), 1 << 32);
    pd.map_page(0x1_0000_2000, 0x40, RW, &inv).unwrap();
    let regions = pd.walk();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].iova, 0x1_0000_2000..0x1_0000_3000);
    assert_eq!(pd.read_mapping(0x1_0000_2000).paddr, 0x4_0000);
}
