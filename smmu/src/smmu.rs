// SPDX-License-Identifier: MPL-2.0

use core::{
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{error, info, warn};
use spin::Mutex;

use crate::{
    backend::{NativeBackend, SmmuBackend},
    config::{AS_WINDOW_SIZE, SmmuConfig},
    domain::{Binder, Domain, DomainId, client::DeviceId},
    error::Error,
    hv::{HypervisorBackend, channel::IvcTransport},
    io::SmmuIo,
    mm::{FrameAllocator, LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE, SgEntry, is_page_aligned},
    page_table::{MappingInfo, PageFlags, Region},
    prelude::*,
    space::{AsPool, Asid},
    stats::{Cache, CacheStats, StatsAccumulator, StatsCommand},
};

/// What the tables say about a faulting access.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultReport {
    pub swgid: u32,
    pub fault_iova: Iova,
    /// The device issuing DMA with the swgid.
    pub dev: Option<DeviceId>,
    pub domain: Option<DomainId>,
    pub asid: Option<Asid>,
    pub mapping: MappingInfo,
    /// The mappings under the directory entry of the fault.
    pub regions: Vec<Region>,
}

/// One SMMU instance.
///
/// This is the interface the IOMMU framework drives: domains are created
/// and destroyed, devices are attached to them, and DMA mappings are added
/// and removed. All hardware access goes through the backend chosen at
/// probe time.
pub struct Smmu {
    config: SmmuConfig,
    backend: Box<dyn SmmuBackend>,
    pool: AsPool,
    binder: Binder,
    stats: Mutex<StatsAccumulator>,
    suspended: AtomicBool,
}

impl Smmu {
    /// Takes over the SMMU registers reached through `io`.
    pub fn probe(
        config: SmmuConfig,
        io: Arc<dyn SmmuIo>,
        frames: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = NativeBackend::new(io, &config);
        let asids = 0..config.num_as as Asid;
        Self::with_backend(config, Box::new(backend), asids, frames)
    }

    /// Connects to the hypervisor server behind `transport` and narrows
    /// `config` to what the server grants.
    pub fn probe_virtualized(
        mut config: SmmuConfig,
        transport: Arc<dyn IvcTransport>,
        frames: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        let backend = HypervisorBackend::connect(transport, &config)?;
        let info = backend.info().clone();

        let window = config.window();
        let start = window
            .start
            .max(info.iova_window.start)
            .next_multiple_of(PAGE_SIZE as u64);
        let end = window.end.min(info.iova_window.end) & !(PAGE_SIZE as u64 - 1);
        if start >= end {
            error!(
                "[SMMU] window {:#x?} lies outside the granted {:#x?}",
                window, info.iova_window
            );
            return Err(Error::InvalidArgs);
        }
        config.iova_base = start;
        config.page_count = (end - start) >> PAGE_SHIFT;
        config.num_as = config.num_as.min(info.as_pool.len());
        config.swgid_mask &= info.swgid_mask;
        config.validate()?;

        let first = info.as_pool.start;
        let asids = first..first + config.num_as as Asid;
        Self::with_backend(config, Box::new(backend), asids, frames)
    }

    fn with_backend(
        config: SmmuConfig,
        backend: Box<dyn SmmuBackend>,
        asids: Range<Asid>,
        frames: Arc<dyn FrameAllocator>,
    ) -> Result<Self> {
        backend.setup()?;
        info!(
            "[SMMU] {} backend: asids {:?}, window {:#x?}, swgids {:#x}",
            backend.name(),
            asids,
            config.window(),
            config.swgid_mask
        );
        Ok(Self {
            pool: AsPool::new(asids, frames),
            binder: Binder::new(config.swgid_mask),
            config,
            backend,
            stats: Mutex::new(StatsAccumulator::new()),
            suspended: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SmmuConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn pool(&self) -> &AsPool {
        &self.pool
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Creates a domain over the configured DMA window.
    pub fn domain_init(&self) -> Result<DomainId> {
        self.domain_init_window(self.config.window())
    }

    /// Creates a domain over `window`, which must lie in the configured
    /// DMA window.
    pub fn domain_init_window(&self, window: Range<Iova>) -> Result<DomainId> {
        let limit = self.config.window();
        if window.start < limit.start || window.end > limit.end {
            warn!(
                "[SMMU] domain window {:#x?} exceeds {:#x?}",
                window, limit
            );
            return Err(Error::InvalidArgs);
        }
        Ok(self.binder.domain_init(window)?.id())
    }

    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>> {
        self.binder.domain(id)
    }

    pub fn domain_destroy(&self, id: DomainId) -> Result<()> {
        self.binder.domain_destroy(id, &self.pool, &*self.backend)
    }

    pub fn add_device(&self, dev: DeviceId, swgids: u64) -> Result<()> {
        self.binder.add_device(dev, swgids)
    }

    pub fn remove_device(&self, dev: DeviceId) -> Result<()> {
        self.binder.remove_device(dev, &*self.backend)
    }

    pub fn attach_dev(&self, id: DomainId, dev: DeviceId) -> Result<()> {
        self.binder.attach(dev, id, &self.pool, &*self.backend)
    }

    pub fn detach_dev(&self, id: DomainId, dev: DeviceId) -> Result<()> {
        self.binder.detach(dev, id, &*self.backend)
    }

    /// Moves an attached device to the domain `to`.
    pub fn rebind_dev(&self, dev: DeviceId, to: DomainId) -> Result<()> {
        self.binder.rebind(dev, to, &self.pool, &*self.backend)
    }

    /// Maps `size` bytes at `iova` to `paddr`, with `size` either 4 KiB or
    /// 4 MiB.
    pub fn map(
        &self,
        id: DomainId,
        iova: Iova,
        paddr: Paddr,
        size: usize,
        flags: PageFlags,
    ) -> Result<()> {
        let domain = self.domain(id)?;
        check_in_window(&domain, iova, size)?;
        if !is_page_aligned(paddr) {
            return Err(Error::InvalidArgs);
        }
        let pfn = paddr >> PAGE_SHIFT;
        domain.with_space(iova, |space| match size {
            PAGE_SIZE => self.backend.map_page(space, iova, pfn, flags),
            LARGE_PAGE_SIZE => self.backend.map_large(space, iova, pfn, flags),
            _ => {
                warn!("[SMMU] unsupported mapping size {:#x}", size);
                Err(Error::InvalidArgs)
            }
        })
    }

    /// Maps a scatter-gather list at consecutive IOVAs from `iova`.
    ///
    /// Already mapped pages in the range are overwritten. The list must
    /// fit in one address-space window.
    pub fn map_sg(
        &self,
        id: DomainId,
        iova: Iova,
        sg: &[SgEntry],
        flags: PageFlags,
    ) -> Result<()> {
        let domain = self.domain(id)?;
        let mut pfns = Vec::new();
        for entry in sg {
            if !is_page_aligned(entry.paddr) || entry.len == 0 || entry.len % PAGE_SIZE != 0 {
                return Err(Error::InvalidArgs);
            }
            let first = entry.paddr >> PAGE_SHIFT;
            pfns.extend(first..first + (entry.len / PAGE_SIZE) as Pfn);
        }
        check_in_window(&domain, iova, pfns.len() * PAGE_SIZE)?;
        domain.with_space(iova, |space| self.backend.map_run(space, iova, &pfns, flags))
    }

    /// Unmaps `size` bytes at `iova` and returns the bytes whose mapping
    /// was removed.
    pub fn unmap(&self, id: DomainId, iova: Iova, size: usize) -> Result<usize> {
        let domain = self.domain(id)?;
        check_in_window(&domain, iova, size)?;
        domain.with_space(iova, |space| self.backend.unmap(space, iova, size))
    }

    /// Translates `iova`, asking the backend when the local tables have
    /// no mapping.
    pub fn iova_to_phys(&self, id: DomainId, iova: Iova) -> Option<Paddr> {
        let domain = self.domain(id).ok()?;
        domain
            .with_space(iova, |space| {
                let info = space.read_mapping(iova);
                if info.is_mapped() {
                    return Ok(Some(info.paddr));
                }
                Ok(self.backend.lookup_remote(space.asid(), iova))
            })
            .ok()
            .flatten()
    }

    pub fn read_mapping(&self, id: DomainId, iova: Iova) -> Result<MappingInfo> {
        self.domain(id)?
            .with_space(iova, |space| Ok(space.read_mapping(iova)))
    }

    /// Lists every mapping of a domain.
    pub fn walk(&self, id: DomainId) -> Result<Vec<Region>> {
        let domain = self.domain(id)?;
        let mut regions = Vec::new();
        for idx in domain.as_bitmap().iter_ones() {
            let base = idx as u64 * AS_WINDOW_SIZE;
            let found = domain.with_space(base.max(domain.window().start), |space| {
                space.with_tables(|pd| Ok(pd.walk()))
            });
            if let Ok(found) = found {
                regions.extend(found);
            }
        }
        Ok(regions)
    }

    /// Describes the mappings around a faulting access of `swgid` and logs
    /// them.
    pub fn dump_pagetable(&self, swgid: u32, fault_iova: Iova) -> FaultReport {
        let client = self.binder.client_by_swgid(swgid);
        let mut report = FaultReport {
            swgid,
            fault_iova,
            dev: client.as_ref().map(|c| c.dev),
            domain: client.as_ref().and_then(|c| c.domain),
            asid: None,
            mapping: MappingInfo::NOT_FOUND,
            regions: Vec::new(),
        };
        let pde_start = fault_iova & !(LARGE_PAGE_SIZE as u64 - 1);
        let pde_range = pde_start..pde_start + LARGE_PAGE_SIZE as u64;
        if let Some(domain) = report.domain.and_then(|id| self.domain(id).ok()) {
            let found = domain.with_space(fault_iova, |space| {
                let regions = space.with_tables(|pd| Ok(pd.regions(pde_range.clone())))?;
                Ok((space.asid(), space.read_mapping(fault_iova), regions))
            });
            if let Ok((asid, mapping, regions)) = found {
                report.asid = Some(asid);
                report.mapping = mapping;
                report.regions = regions;
            }
        }

        error!(
            "[SMMU] fault: swgid {} iova {:#x} dev {:?} domain {:?} asid {:?} mapping {:x?}",
            swgid, fault_iova, report.dev, report.domain, report.asid, report.mapping
        );
        for region in &report.regions {
            error!(
                "[SMMU]   {:#x}..{:#x} -> {:#x} {:?}{}",
                region.iova.start,
                region.iova.end,
                region.paddr,
                region.flags,
                if region.large { " large" } else { "" }
            );
        }
        report
    }

    /// Quiesces the hardware. The page tables are kept.
    pub fn suspend(&self) {
        self.backend.suspend();
        self.suspended.store(true, Ordering::Release);
        info!("[SMMU] suspended");
    }

    /// Brings the hardware back and re-programs it from the page tables.
    pub fn resume(&self) -> Result<()> {
        self.backend.setup()?;
        self.restore_registers()?;
        self.suspended.store(false, Ordering::Release);
        info!("[SMMU] resumed");
        Ok(())
    }

    /// Programs every live address space and every attached device again.
    pub fn restore_registers(&self) -> Result<()> {
        for space in self.pool.live() {
            if let Some(pdir) = space.pdir_paddr() {
                self.backend.activate_space(space.asid(), pdir)?;
            }
        }
        self.binder.restore_routing(&*self.backend)
    }

    /// Tears the instance down, destroying whatever domains remain.
    pub fn remove(self) {
        for domain in self.binder.domains() {
            warn!("[SMMU] removing with {} still alive", domain.id());
            if let Err(err) = self.domain_destroy(domain.id()) {
                error!("[SMMU] destroying {}: {}", domain.id(), err);
            }
        }
        self.backend.shutdown();
        info!("[SMMU] removed");
    }

    pub fn stats_command(&self, cmd: StatsCommand) -> Result<()> {
        self.backend.stats_command(cmd)?;
        if cmd == StatsCommand::Reset {
            self.stats.lock().reset();
        }
        Ok(())
    }

    /// Samples the counters of `cache` and returns the running totals.
    pub fn stats(&self, cache: Cache) -> CacheStats {
        let mut stats = self.stats.lock();
        if let Some((hit, miss)) = self.backend.sample_stats(cache) {
            stats.update(cache, hit, miss);
        }
        stats.get(cache)
    }
}

/// Checks that `len` bytes at `iova` lie in the window of `domain`.
fn check_in_window(domain: &Domain, iova: Iova, len: usize) -> Result<()> {
    let window = domain.window();
    let end = iova.checked_add(len as u64).ok_or(Error::InvalidArgs)?;
    if len == 0 || iova < window.start || end > window.end {
        warn!(
            "[SMMU] {}: {:#x}+{:#x} outside {:#x?}",
            domain.id(),
            iova,
            len,
            window
        );
        return Err(Error::InvalidArgs);
    }
    Ok(())
}
