// SPDX-License-Identifier: MPL-2.0

//! Domains and the binding of devices to them.
//!
//! A domain is the DMA view shared by a group of devices. Its IOVA window
//! spans up to four 4 GiB windows, and window `i` is translated by an
//! address space of its own. The address spaces are allocated when the
//! first device attaches and kept until the domain is destroyed.
//!
//! Locks are taken in this order: the domain map (only briefly, never
//! while waiting for another lock), the client registry, the domains (two
//! of them in `DomainId` order), then the address-space pool.

pub mod client;

use alloc::collections::BTreeMap;
use core::{
    fmt,
    ops::Range,
    sync::atomic::{AtomicU32, Ordering},
};

use bitvec::prelude::*;
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use spin::{Mutex, RwLock};

use self::client::{Client, ClientRegistry, DeviceId};
use crate::{
    backend::SmmuBackend,
    config::AS_WINDOW_SIZE,
    error::Error,
    mm::is_page_aligned,
    prelude::*,
    space::{AddressSpace, AsPool, Asid},
};

/// The most windows, and thus address spaces, one domain can span.
pub const MAX_AS_PER_DOMAIN: usize = 4;

/// The address space behind each window of a domain.
pub type WindowAsids = [Option<Asid>; MAX_AS_PER_DOMAIN];

/// The windows a domain spans.
pub type AsBitmap = BitArr!(for MAX_AS_PER_DOMAIN, in u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain{}", self.0)
    }
}

/// Computes the windows an IOVA range touches.
pub fn as_bitmap_for(window: &Range<Iova>) -> Result<AsBitmap> {
    if window.start >= window.end || !is_page_aligned(window.start) || !is_page_aligned(window.end)
    {
        return Err(Error::InvalidArgs);
    }
    let first = (window.start / AS_WINDOW_SIZE) as usize;
    let last = ((window.end - 1) / AS_WINDOW_SIZE) as usize;
    if last >= MAX_AS_PER_DOMAIN {
        warn!(
            "[SMMU] window {:#x?} needs {} address spaces",
            window,
            last + 1 - first
        );
        return Err(Error::InvalidArgs);
    }
    let mut bitmap = AsBitmap::ZERO;
    for idx in first..=last {
        bitmap.set(idx, true);
    }
    Ok(bitmap)
}

struct DomainInner {
    spaces: [Option<Arc<AddressSpace>>; MAX_AS_PER_DOMAIN],
    clients: SmallVec<[DeviceId; 4]>,
}

impl DomainInner {
    fn asids(&self) -> WindowAsids {
        core::array::from_fn(|idx| self.spaces[idx].as_ref().map(|space| space.asid()))
    }
}

/// A DMA domain.
pub struct Domain {
    id: DomainId,
    window: Range<Iova>,
    as_bitmap: AsBitmap,
    inner: RwLock<DomainInner>,
}

impl Domain {
    fn new(id: DomainId, window: Range<Iova>) -> Result<Self> {
        let as_bitmap = as_bitmap_for(&window)?;
        Ok(Self {
            id,
            window,
            as_bitmap,
            inner: RwLock::new(DomainInner {
                spaces: Default::default(),
                clients: SmallVec::new(),
            }),
        })
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    pub fn window(&self) -> Range<Iova> {
        self.window.clone()
    }

    pub fn as_bitmap(&self) -> AsBitmap {
        self.as_bitmap
    }

    pub fn asids(&self) -> WindowAsids {
        self.inner.read().asids()
    }

    /// The address spaces the domain holds.
    pub fn spaces(&self) -> SmallVec<[Arc<AddressSpace>; MAX_AS_PER_DOMAIN]> {
        self.inner.read().spaces.iter().flatten().cloned().collect()
    }

    /// The attached devices.
    pub fn clients(&self) -> SmallVec<[DeviceId; 4]> {
        self.inner.read().clients.clone()
    }

    /// Runs `f` on the address space translating `iova`.
    ///
    /// The domain keeps the address space for as long as `f` runs. Fails
    /// with `InvalidArgs` outside the window and with `NotAttached` before
    /// the first attach.
    pub fn with_space<R>(
        &self,
        iova: Iova,
        f: impl FnOnce(&AddressSpace) -> Result<R>,
    ) -> Result<R> {
        if !self.window.contains(&iova) {
            warn!(
                "[SMMU] {}: iova {:#x} outside {:#x?}",
                self.id, iova, self.window
            );
            return Err(Error::InvalidArgs);
        }
        let inner = self.inner.read();
        let space = inner.spaces[(iova / AS_WINDOW_SIZE) as usize]
            .as_ref()
            .ok_or(Error::NotAttached)?;
        f(space)
    }

    /// Gives every window an address space and returns the ASIDs allocated
    /// by this call.
    ///
    /// Either every window is served or nothing was allocated.
    fn populate(
        &self,
        inner: &mut DomainInner,
        pool: &AsPool,
        backend: &dyn SmmuBackend,
    ) -> Result<SmallVec<[Asid; MAX_AS_PER_DOMAIN]>> {
        let mut fresh = SmallVec::new();
        for idx in self.as_bitmap.iter_ones() {
            if inner.spaces[idx].is_some() {
                continue;
            }
            match pool.alloc(idx as u64 * AS_WINDOW_SIZE, backend) {
                Ok(space) => {
                    fresh.push(space.asid());
                    inner.spaces[idx] = Some(space);
                }
                Err(err) => {
                    warn!(
                        "[SMMU] {}: no address space for window {}: {}",
                        self.id, idx, err
                    );
                    Self::depopulate(inner, &fresh, pool, backend);
                    return Err(Error::NoFreeAddressSpace);
                }
            }
        }
        Ok(fresh)
    }

    /// Returns the address spaces `asids` to the pool.
    fn depopulate(
        inner: &mut DomainInner,
        asids: &[Asid],
        pool: &AsPool,
        backend: &dyn SmmuBackend,
    ) {
        for slot in inner.spaces.iter_mut() {
            if let Some(space) = slot.take_if(|space| asids.contains(&space.asid())) {
                pool.free(space.asid(), backend);
            }
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("window", &self.window)
            .field("asids", &inner.asids())
            .field("clients", &inner.clients)
            .finish()
    }
}

/// The domains of an SMMU and the devices bound to them.
pub struct Binder {
    domains: Mutex<BTreeMap<DomainId, Arc<Domain>>>,
    clients: Mutex<ClientRegistry>,
    next_id: AtomicU32,
    swgid_mask: u64,
}

impl Binder {
    /// Creates a binder routing only the swgids in `swgid_mask`.
    pub fn new(swgid_mask: u64) -> Self {
        Self {
            domains: Mutex::new(BTreeMap::new()),
            clients: Mutex::new(ClientRegistry::new()),
            next_id: AtomicU32::new(0),
            swgid_mask,
        }
    }

    /// Creates an empty domain over `window`.
    pub fn domain_init(&self, window: Range<Iova>) -> Result<Arc<Domain>> {
        let id = DomainId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let domain = Arc::new(Domain::new(id, window)?);
        self.domains.lock().insert(id, domain.clone());
        debug!("[SMMU] created {:?}", domain);
        Ok(domain)
    }

    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>> {
        self.domains.lock().get(&id).cloned().ok_or(Error::NoDevice)
    }

    pub fn domains(&self) -> Vec<Arc<Domain>> {
        self.domains.lock().values().cloned().collect()
    }

    /// Destroys a domain, detaching whatever is still attached and freeing
    /// its address spaces.
    pub fn domain_destroy(
        &self,
        id: DomainId,
        pool: &AsPool,
        backend: &dyn SmmuBackend,
    ) -> Result<()> {
        let domain = self.domains.lock().remove(&id).ok_or(Error::NoDevice)?;
        let mut clients = self.clients.lock();
        let mut inner = domain.inner.write();

        if !inner.clients.is_empty() {
            error!(
                "[SMMU] {} destroyed with {} device(s) attached",
                id,
                inner.clients.len()
            );
        }
        for dev in core::mem::take(&mut inner.clients) {
            if let Some(client) = clients.get_mut(dev) {
                if let Err(err) = backend.disable_hwgrp(client.swgids) {
                    error!("[SMMU] {}: unrouting {} failed: {}", id, dev, err);
                }
                client.domain = None;
            }
        }
        for space in inner.spaces.iter_mut().filter_map(Option::take) {
            pool.free(space.asid(), backend);
        }
        info!("[SMMU] destroyed {}", id);
        Ok(())
    }

    /// Registers a device issuing DMA with `swgids`.
    pub fn add_device(&self, dev: DeviceId, swgids: u64) -> Result<()> {
        self.clients.lock().register(dev, swgids, self.swgid_mask)?;
        debug!("[SMMU] added {} with swgids {:#x}", dev, swgids);
        Ok(())
    }

    /// Detaches the device if needed and forgets it.
    pub fn remove_device(&self, dev: DeviceId, backend: &dyn SmmuBackend) -> Result<()> {
        let attached = self.client(dev).ok_or(Error::NoDevice)?.domain;
        let result = attached.map_or(Ok(()), |id| self.detach(dev, id, backend));
        self.clients.lock().unregister(dev);
        debug!("[SMMU] removed {}", dev);
        result
    }

    pub fn client(&self, dev: DeviceId) -> Option<Client> {
        self.clients.lock().get(dev).cloned()
    }

    /// The device issuing DMA with `swgid`.
    pub fn client_by_swgid(&self, swgid: u32) -> Option<Client> {
        self.clients.lock().by_swgid(swgid).cloned()
    }

    /// Attaches a device to a domain, allocating the domain's address
    /// spaces on first use, and routes its swgids there.
    pub fn attach(
        &self,
        dev: DeviceId,
        id: DomainId,
        pool: &AsPool,
        backend: &dyn SmmuBackend,
    ) -> Result<()> {
        let domain = self.domain(id)?;
        let mut clients = self.clients.lock();
        let client = clients.get_mut(dev).ok_or(Error::NoDevice)?;
        match client.domain {
            Some(current) if current == id => {
                debug!("[SMMU] {} is already attached to {}", dev, id);
                return Ok(());
            }
            Some(current) => {
                warn!("[SMMU] {} is attached to {}, not {}", dev, current, id);
                return Err(Error::AlreadyAttached);
            }
            None => {}
        }

        let mut inner = domain.inner.write();
        let fresh = domain.populate(&mut inner, pool, backend)?;
        let asids = inner.asids();
        if let Err(err) = backend.enable_hwgrp(client.swgids, &asids) {
            Domain::depopulate(&mut inner, &fresh, pool, backend);
            return Err(err);
        }
        for space in inner.spaces.iter().flatten() {
            space.add_client(dev);
        }
        inner.clients.push(dev);
        client.domain = Some(id);
        info!("[SMMU] attached {} to {} (asids {:?})", dev, id, asids);
        Ok(())
    }

    /// Stops routing a device to a domain.
    ///
    /// The domain keeps its address spaces.
    pub fn detach(&self, dev: DeviceId, id: DomainId, backend: &dyn SmmuBackend) -> Result<()> {
        let domain = self.domain(id)?;
        let mut clients = self.clients.lock();
        let client = clients.get_mut(dev).ok_or(Error::NoDevice)?;
        if client.domain != Some(id) {
            warn!("[SMMU] {} is not attached to {}", dev, id);
            return Err(Error::NotAttached);
        }

        let mut inner = domain.inner.write();
        let result = backend.disable_hwgrp(client.swgids);
        if let Err(err) = result {
            error!("[SMMU] {}: unrouting {} failed: {}", id, dev, err);
        }
        for space in inner.spaces.iter().flatten() {
            space.remove_client(dev);
        }
        inner.clients.retain(|c| *c != dev);
        client.domain = None;
        info!("[SMMU] detached {} from {}", dev, id);
        result
    }

    /// Moves an attached device to another domain.
    ///
    /// Every address space of the old domain is flushed before the routing
    /// is switched.
    pub fn rebind(
        &self,
        dev: DeviceId,
        to: DomainId,
        pool: &AsPool,
        backend: &dyn SmmuBackend,
    ) -> Result<()> {
        let mut clients = self.clients.lock();
        let client = clients.get_mut(dev).ok_or(Error::NoDevice)?;
        let from = client.domain.ok_or(Error::NotAttached)?;
        if from == to {
            return Ok(());
        }
        let (old, new) = (self.domain(from)?, self.domain(to)?);
        let (mut old_inner, mut new_inner) = if from < to {
            let old_inner = old.inner.write();
            (old_inner, new.inner.write())
        } else {
            let new_inner = new.inner.write();
            (old.inner.write(), new_inner)
        };

        let fresh = new.populate(&mut new_inner, pool, backend)?;
        for asid in old_inner.asids().into_iter().flatten() {
            backend.flush_space(asid);
        }
        let asids = new_inner.asids();
        if let Err(err) = backend.rebind_hwgrp(client.swgids, &asids) {
            Domain::depopulate(&mut new_inner, &fresh, pool, backend);
            if backend.rebind_hwgrp(client.swgids, &old_inner.asids()).is_err() {
                error!("[SMMU] {} lost its routing to {}", dev, from);
            }
            return Err(err);
        }

        for space in old_inner.spaces.iter().flatten() {
            space.remove_client(dev);
        }
        old_inner.clients.retain(|c| *c != dev);
        for space in new_inner.spaces.iter().flatten() {
            space.add_client(dev);
        }
        new_inner.clients.push(dev);
        client.domain = Some(to);
        info!("[SMMU] moved {} from {} to {}", dev, from, to);
        Ok(())
    }

    /// Writes the routing of every attached device again.
    pub fn restore_routing(&self, backend: &dyn SmmuBackend) -> Result<()> {
        let domains = self.domains.lock().clone();
        let clients = self.clients.lock();
        for client in clients.iter() {
            let Some(domain) = client.domain.and_then(|id| domains.get(&id)) else {
                continue;
            };
            backend.enable_hwgrp(client.swgids, &domain.asids())?;
        }
        Ok(())
    }
}
