// SPDX-License-Identifier: MPL-2.0

//! Hardware address spaces and the pool they are allocated from.

use core::ops::Range;

use bitvec::prelude::BitVec;
use log::{debug, warn};
use smallvec::SmallVec;
use spin::Mutex;

use crate::{
    backend::SmmuBackend,
    domain::client::DeviceId,
    error::Error,
    mm::FrameAllocator,
    page_table::{MappingInfo, PageDirectory},
    prelude::*,
};

/// A hardware address-space identifier.
pub type Asid = u32;

/// One hardware address space.
///
/// An address space is live while it owns a page directory, that is between
/// [`AsPool::alloc`] and [`AsPool::free`].
pub struct AddressSpace {
    asid: Asid,
    tables: Mutex<Option<PageDirectory>>,
    clients: Mutex<SmallVec<[DeviceId; 4]>>,
}

impl AddressSpace {
    fn new(asid: Asid) -> Self {
        Self {
            asid,
            tables: Mutex::new(None),
            clients: Mutex::new(SmallVec::new()),
        }
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    pub fn is_live(&self) -> bool {
        self.tables.lock().is_some()
    }

    /// The physical address of the page directory, if live.
    pub fn pdir_paddr(&self) -> Option<Paddr> {
        self.tables.lock().as_ref().map(PageDirectory::paddr)
    }

    /// Runs `f` on the page tables with the address-space lock held.
    ///
    /// Fails with `NotAttached` if the address space is not live.
    pub fn with_tables<R>(&self, f: impl FnOnce(&mut PageDirectory) -> Result<R>) -> Result<R> {
        let mut tables = self.tables.lock();
        let pd = tables.as_mut().ok_or(Error::NotAttached)?;
        f(pd)
    }

    pub fn read_mapping(&self, iova: Iova) -> MappingInfo {
        self.tables
            .lock()
            .as_ref()
            .map_or(MappingInfo::NOT_FOUND, |pd| pd.read_mapping(iova))
    }

    /// The devices whose swgids route to this address space.
    pub fn clients(&self) -> SmallVec<[DeviceId; 4]> {
        self.clients.lock().clone()
    }

    pub(crate) fn add_client(&self, dev: DeviceId) {
        let mut clients = self.clients.lock();
        if !clients.contains(&dev) {
            clients.push(dev);
        }
    }

    pub(crate) fn remove_client(&self, dev: DeviceId) {
        self.clients.lock().retain(|c| *c != dev);
    }
}

/// The fixed pool of hardware address spaces.
///
/// The bitmap lock is held from the search for a free slot until the slot
/// is claimed, so concurrent allocators never win the same slot.
pub struct AsPool {
    first_asid: Asid,
    spaces: Vec<Arc<AddressSpace>>,
    allocated: Mutex<BitVec<u8>>,
    frames: Arc<dyn FrameAllocator>,
}

impl AsPool {
    /// Creates a pool of the address spaces numbered `asids`.
    pub fn new(asids: Range<Asid>, frames: Arc<dyn FrameAllocator>) -> Self {
        let spaces: Vec<_> = asids.clone().map(|asid| Arc::new(AddressSpace::new(asid))).collect();
        let mut allocated = BitVec::with_capacity(spaces.len());
        allocated.resize(spaces.len(), false);
        Self {
            first_asid: asids.start,
            spaces,
            allocated: Mutex::new(allocated),
            frames,
        }
    }

    pub fn capacity(&self) -> usize {
        self.spaces.len()
    }

    /// The number of live address spaces.
    pub fn in_use(&self) -> usize {
        self.allocated.lock().count_ones()
    }

    pub fn get(&self, asid: Asid) -> Option<&Arc<AddressSpace>> {
        let idx = asid.checked_sub(self.first_asid)?;
        self.spaces.get(idx as usize)
    }

    /// The live address spaces.
    pub fn live(&self) -> Vec<Arc<AddressSpace>> {
        let allocated = self.allocated.lock();
        allocated
            .iter_ones()
            .map(|idx| self.spaces[idx].clone())
            .collect()
    }

    /// Takes a free address space, gives it an empty page directory for the
    /// window at `base`, and has the backend activate it.
    pub fn alloc(&self, base: Iova, backend: &dyn SmmuBackend) -> Result<Arc<AddressSpace>> {
        let mut allocated = self.allocated.lock();
        let Some(idx) = allocated.first_zero() else {
            warn!("[SMMU] all {} address spaces are in use", self.capacity());
            return Err(Error::ResourceExhausted);
        };
        let space = &self.spaces[idx];

        let pd = PageDirectory::new(space.asid, base, &self.frames)?;
        backend.activate_space(space.asid, pd.paddr())?;
        *space.tables.lock() = Some(pd);
        allocated.set(idx, true);

        debug!("[SMMU] allocated AS {}", space.asid);
        Ok(space.clone())
    }

    /// Deactivates the address space and frees its page tables.
    ///
    /// Freeing an address space that is not live does nothing.
    pub fn free(&self, asid: Asid, backend: &dyn SmmuBackend) {
        let mut allocated = self.allocated.lock();
        let Some(idx) = asid
            .checked_sub(self.first_asid)
            .map(|idx| idx as usize)
            .filter(|&idx| idx < self.spaces.len() && allocated[idx])
        else {
            return;
        };
        let space = &self.spaces[idx];
        let mut tables = space.tables.lock();
        if let Some(pd) = tables.as_ref() {
            backend.release_space(pd);
        }
        // The frames are returned only after the hardware let go of them.
        *tables = None;
        space.clients.lock().clear();
        allocated.set(idx, false);

        debug!("[SMMU] freed AS {}", asid);
    }
}
