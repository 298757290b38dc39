// SPDX-License-Identifier: MPL-2.0

use log::{debug, info};
use spin::Mutex;

use super::SmmuBackend;
use crate::{
    config::SmmuConfig,
    domain::WindowAsids,
    flush::{Flusher, Invalidate},
    io::{SmmuIo, regs},
    page_table::{PageDirectory, PageFlags},
    prelude::*,
    space::{AddressSpace, Asid},
    stats::{Cache, CacheConfig, StatsCommand},
    util::swgid_bits,
};

/// The attributes of the directory pointer in `PTB_DATA`.
const PDIR_ATTRS: u32 =
    PageFlags::READABLE.bits() | PageFlags::WRITABLE.bits() | PageFlags::NONSECURE.bits();

/// A backend that programs the SMMU registers itself.
pub struct NativeBackend {
    io: Arc<dyn SmmuIo>,
    flusher: Flusher,
    /// Serializes the `PTB_ASID`/`PTB_DATA` pair.
    ptb_lock: Mutex<()>,
    map_threshold: usize,
    unmap_threshold: usize,
}

impl NativeBackend {
    pub fn new(io: Arc<dyn SmmuIo>, config: &SmmuConfig) -> Self {
        Self {
            flusher: Flusher::new(io.clone(), config),
            io,
            ptb_lock: Mutex::new(()),
            map_threshold: config.flush_all_threshold_map,
            unmap_threshold: config.flush_all_threshold_unmap,
        }
    }

    pub fn flusher(&self) -> &Flusher {
        &self.flusher
    }

    fn write_ptb(&self, asid: Asid, data: u32) {
        let _guard = self.ptb_lock.lock();
        self.io.write(regs::PTB_ASID, asid);
        self.io.write(regs::PTB_DATA, data);
        self.flusher.read_back();
    }

    fn write_swgrps(&self, swgids: u64, value: u32) {
        for swgid in swgid_bits(swgids) {
            self.io.write(regs::swgrp_asid(swgid), value);
        }
        self.flusher.read_back();
    }

    fn update_cache_config(&self, set: CacheConfig, clear: CacheConfig) {
        for reg in [regs::TLB_CONFIG, regs::PTC_CONFIG] {
            let value = self.io.read(reg);
            self.io.write(reg, (value | set.bits()) & !clear.bits());
        }
        self.flusher.read_back();
    }
}

/// The routing register value sending a swgid to the address spaces of a
/// domain, one byte lane per window.
pub fn swgrp_value(asids: &WindowAsids) -> u32 {
    asids
        .iter()
        .enumerate()
        .filter_map(|(idx, asid)| asid.map(|asid| (regs::SWGRP_ASID_ENABLE | asid) << (8 * idx)))
        .fold(regs::SWGRP_ASID_DISABLE, |value, lane| value | lane)
}

impl SmmuBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn setup(&self) -> Result<()> {
        self.io.write(regs::TLB_CONFIG, regs::TLB_CONFIG_RESET);
        self.io.write(regs::PTC_CONFIG, regs::PTC_CONFIG_RESET);
        self.flusher.flush_global();
        self.io.write(regs::CONFIG, regs::CONFIG_ENABLE);
        self.flusher.read_back();
        info!("[SMMU] translation enabled");
        Ok(())
    }

    fn shutdown(&self) {
        self.io.write(regs::CONFIG, regs::CONFIG_DISABLE);
        self.flusher.read_back();
        info!("[SMMU] translation disabled");
    }

    fn suspend(&self) {
        self.shutdown();
    }

    fn activate_space(&self, asid: Asid, pdir: Paddr) -> Result<()> {
        self.flusher.flush_all(asid);
        self.write_ptb(asid, (pdir >> 12) as u32 | PDIR_ATTRS);
        Ok(())
    }

    fn release_space(&self, tables: &PageDirectory) {
        self.write_ptb(tables.asid(), regs::PTB_DATA_RESET);
        self.flusher.flush_all(tables.asid());
    }

    fn enable_hwgrp(&self, swgids: u64, asids: &WindowAsids) -> Result<()> {
        let value = swgrp_value(asids);
        debug!("[SMMU] routing swgids {:#x} with {:#x}", swgids, value);
        self.write_swgrps(swgids, value);
        Ok(())
    }

    fn disable_hwgrp(&self, swgids: u64) -> Result<()> {
        debug!("[SMMU] unrouting swgids {:#x}", swgids);
        self.write_swgrps(swgids, regs::SWGRP_ASID_DISABLE);
        Ok(())
    }

    fn rebind_hwgrp(&self, swgids: u64, asids: &WindowAsids) -> Result<()> {
        // One register write switches every lane at once.
        self.enable_hwgrp(swgids, asids)
    }

    fn flush_space(&self, asid: Asid) {
        self.flusher.flush_all(asid);
    }

    fn map_page(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
    ) -> Result<()> {
        space.with_tables(|pd| pd.map_page(iova, pfn, flags, &self.flusher))
    }

    fn map_large(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
    ) -> Result<()> {
        space.with_tables(|pd| pd.write_large_pde(iova, pfn, flags, &self.flusher))
    }

    fn map_run(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfns: &[Pfn],
        flags: PageFlags,
    ) -> Result<()> {
        space.with_tables(|pd| pd.map_run(iova, pfns, flags, self.map_threshold, &self.flusher))
    }

    fn unmap(&self, space: &AddressSpace, iova: Iova, bytes: usize) -> Result<usize> {
        space.with_tables(|pd| pd.unmap(iova, bytes, self.unmap_threshold, &self.flusher))
    }

    fn stats_command(&self, cmd: StatsCommand) -> Result<()> {
        match cmd {
            StatsCommand::On => {
                self.update_cache_config(CacheConfig::STATS_ENABLE, CacheConfig::empty())
            }
            StatsCommand::Off => {
                self.update_cache_config(CacheConfig::empty(), CacheConfig::STATS_ENABLE)
            }
            StatsCommand::Reset => {
                self.update_cache_config(CacheConfig::STATS_TEST, CacheConfig::empty());
                self.update_cache_config(CacheConfig::empty(), CacheConfig::STATS_TEST);
            }
        }
        Ok(())
    }

    fn sample_stats(&self, cache: Cache) -> Option<(u32, u32)> {
        let (hit, miss) = match cache {
            Cache::Tlb => (regs::STATS_TLB_HIT_COUNT, regs::STATS_TLB_MISS_COUNT),
            Cache::Ptc => (regs::STATS_PTC_HIT_COUNT, regs::STATS_PTC_MISS_COUNT),
        };
        Some((self.io.read(hit), self.io.read(miss)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        domain::MAX_AS_PER_DOMAIN,
        io::{RegAccess, SimRegisters},
    };

    fn backend() -> (Arc<SimRegisters>, NativeBackend) {
        let sim = Arc::new(SimRegisters::new());
        let backend = NativeBackend::new(sim.clone(), &SmmuConfig::default());
        (sim, backend)
    }

    #[test]
    fn routing_value_lanes() {
        let mut asids: WindowAsids = [None; MAX_AS_PER_DOMAIN];
        assert_eq!(swgrp_value(&asids), regs::SWGRP_ASID_DISABLE);
        asids[0] = Some(5);
        assert_eq!(swgrp_value(&asids), 0x85);
        asids[2] = Some(0x7f);
        assert_eq!(swgrp_value(&asids), 0x00ff_0085);
    }

    #[test]
    fn routing_writes_every_swgid() {
        let (sim, backend) = backend();
        backend
            .enable_hwgrp(0b1010, &[Some(3), None, None, None])
            .unwrap();
        assert_eq!(
            sim.take_accesses(),
            [
                RegAccess::Write(regs::swgrp_asid(1), 0x83),
                RegAccess::Write(regs::swgrp_asid(3), 0x83),
                RegAccess::Read(regs::PTB_ASID),
            ]
        );
        backend.disable_hwgrp(0b1010).unwrap();
        assert_eq!(sim.value(regs::swgrp_asid(1)), 0);
        assert_eq!(sim.value(regs::swgrp_asid(3)), 0);
    }

    #[test]
    fn setup_enables_translation() {
        let (sim, backend) = backend();
        backend.setup().unwrap();
        assert_eq!(sim.value(regs::CONFIG), regs::CONFIG_ENABLE);
        assert_eq!(sim.value(regs::TLB_CONFIG), regs::TLB_CONFIG_RESET);
        assert_eq!(sim.value(regs::PTC_CONFIG), regs::PTC_CONFIG_RESET);
        assert_eq!(sim.accesses().last(), Some(&RegAccess::Read(regs::PTB_ASID)));
        backend.shutdown();
        assert_eq!(sim.value(regs::CONFIG), regs::CONFIG_DISABLE);
    }

    #[test]
    fn activation_flushes_before_programming() {
        let (sim, backend) = backend();
        backend.activate_space(2, 0x8000_3000).unwrap();
        let accesses = sim.take_accesses();
        let flush = accesses
            .iter()
            .position(|a| matches!(a, RegAccess::Write(regs::TLB_FLUSH, _)))
            .unwrap();
        let ptb = accesses
            .iter()
            .position(|a| matches!(a, RegAccess::Write(regs::PTB_DATA, _)))
            .unwrap();
        assert!(flush < ptb);
        assert_eq!(
            &accesses[ptb - 1..],
            [
                RegAccess::Write(regs::PTB_ASID, 2),
                RegAccess::Write(regs::PTB_DATA, 0x8_0003 | PDIR_ATTRS),
                RegAccess::Read(regs::PTB_ASID),
            ]
        );
    }

    #[test]
    fn stats_toggle_cache_config() {
        let (sim, backend) = backend();
        backend.setup().unwrap();
        backend.stats_command(StatsCommand::On).unwrap();
        assert_ne!(sim.value(regs::TLB_CONFIG) & CacheConfig::STATS_ENABLE.bits(), 0);
        assert_ne!(sim.value(regs::PTC_CONFIG) & CacheConfig::STATS_ENABLE.bits(), 0);

        sim.take_accesses();
        backend.stats_command(StatsCommand::Reset).unwrap();
        let test_bit = CacheConfig::STATS_TEST.bits();
        let writes = sim.writes_to(regs::TLB_CONFIG);
        assert_eq!(writes.len(), 2);
        assert_ne!(writes[0] & test_bit, 0);
        assert_eq!(writes[1] & test_bit, 0);

        backend.stats_command(StatsCommand::Off).unwrap();
        assert_eq!(sim.value(regs::TLB_CONFIG) & CacheConfig::STATS_ENABLE.bits(), 0);

        sim.set_value(regs::STATS_PTC_HIT_COUNT, 7);
        sim.set_value(regs::STATS_PTC_MISS_COUNT, 9);
        assert_eq!(backend.sample_stats(Cache::Ptc), Some((7, 9)));
    }
}
