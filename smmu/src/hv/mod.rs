// SPDX-License-Identifier: MPL-2.0

//! The hypervisor-backed mode.
//!
//! When a hypervisor owns the SMMU, the guest never touches its registers.
//! Every mapping change is sent to the hypervisor server as a [`Message`]
//! over one of several [`CommChannel`]s, and the guest keeps a shadow copy
//! of its page tables for lookups. The last channel carries control and
//! lookup requests; the others are spread over the address spaces.

pub mod channel;
pub mod loopback;
pub mod msg;
#[cfg(test)]
mod test;

use core::{
    ops::Range,
    sync::atomic::{AtomicBool, Ordering},
};

use log::{debug, error, info, warn};

use self::{
    channel::{CommChannel, IvcTransport},
    msg::{DriverContext, InfoReply, Message, Opcode},
};
use crate::{
    backend::SmmuBackend,
    config::{MAX_NUM_AS, ShadowPolicy, SmmuConfig},
    domain::WindowAsids,
    error::Error,
    flush::NoFlush,
    mm::{LARGE_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE},
    page_table::{PageDirectory, PageFlags, Region},
    prelude::*,
    space::{AddressSpace, Asid},
    stats::StatsCommand,
    util::swgid_bits,
};

/// What the server grants this guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmmuInfo {
    pub as_pool: Range<Asid>,
    pub iova_window: Range<Iova>,
    pub swgid_mask: u64,
}

impl SmmuInfo {
    fn from_reply(reply: &InfoReply) -> Result<Self> {
        let as_pool = &reply.as_pool;
        let window = &reply.iova_window;
        if as_pool.start > as_pool.end
            || as_pool.end > Asid::MAX as u64
            || as_pool.end - as_pool.start > MAX_NUM_AS as u64
            || window.start >= window.end
        {
            error!("[SMMU-HV] unusable server info {:x?}", reply);
            return Err(Error::Corrupt);
        }
        Ok(Self {
            as_pool: as_pool.start as Asid..as_pool.end as Asid,
            iova_window: window.start..window.end,
            swgid_mask: reply.swgid_mask,
        })
    }
}

fn page_ctx(asid: Asid, iova: Iova, ipa: Paddr, pages: usize, flags: PageFlags) -> DriverContext {
    DriverContext {
        asid,
        iova,
        ipa,
        count: pages as i32,
        attr: flags.bits() as i32,
        ..Default::default()
    }
}

/// Splits `pfns` into runs of physically consecutive frames, as
/// `(first index, length)` pairs.
fn contiguous_runs(pfns: &[Pfn]) -> Vec<(usize, usize)> {
    let mut runs: Vec<(usize, usize)> = Vec::new();
    for (idx, &pfn) in pfns.iter().enumerate() {
        match runs.last_mut() {
            Some((start, len)) if pfns[*start] + *len as Pfn == pfn => *len += 1,
            _ => runs.push((idx, 1)),
        }
    }
    runs
}

/// A backend that forwards every change to the hypervisor server and
/// mirrors it in local shadow tables.
pub struct HypervisorBackend {
    transport: Arc<dyn IvcTransport>,
    channels: Vec<CommChannel>,
    info: SmmuInfo,
    policy: ShadowPolicy,
    poll_budget: usize,
    connected: AtomicBool,
}

impl HypervisorBackend {
    /// Opens the session with the server and asks what it grants.
    pub fn connect(transport: Arc<dyn IvcTransport>, config: &SmmuConfig) -> Result<Self> {
        let count = transport.num_channels();
        if count == 0 {
            error!("[SMMU-HV] the transport has no channels");
            return Err(Error::NoDevice);
        }
        let mut backend = Self {
            transport,
            channels: (0..count).map(CommChannel::new).collect(),
            info: SmmuInfo {
                as_pool: 0..0,
                iova_window: 0..0,
                swgid_mask: 0,
            },
            policy: config.shadow_policy,
            poll_budget: config.hv_poll_budget,
            connected: AtomicBool::new(false),
        };
        backend.call(backend.control(), Opcode::Connect, DriverContext::default())?;
        backend.connected.store(true, Ordering::Release);
        let reply = backend.call(backend.control(), Opcode::SmmuInfo, DriverContext::default())?;
        backend.info = SmmuInfo::from_reply(&reply.info)?;
        info!(
            "[SMMU-HV] connected over {} channel(s): asids {:?}, iova {:#x?}, swgids {:#x}",
            count, backend.info.as_pool, backend.info.iova_window, backend.info.swgid_mask
        );
        Ok(backend)
    }

    pub fn info(&self) -> &SmmuInfo {
        &self.info
    }

    pub fn channels(&self) -> &[CommChannel] {
        &self.channels
    }

    /// Returns stuck channels to service and drops late responses.
    pub fn reset_channels(&self) {
        for chan in &self.channels {
            chan.reset(&*self.transport);
        }
    }

    fn control(&self) -> &CommChannel {
        &self.channels[self.channels.len() - 1]
    }

    /// The channel carrying the requests of `asid`.
    fn channel_for(&self, asid: Asid) -> &CommChannel {
        let per_as = self.channels.len() - 1;
        if per_as == 0 {
            return self.control();
        }
        let slot = asid.wrapping_sub(self.info.as_pool.start) as usize;
        &self.channels[slot % per_as]
    }

    fn call(&self, chan: &CommChannel, opcode: Opcode, ctx: DriverContext) -> Result<Message> {
        chan.call(&*self.transport, Message::request(opcode, ctx), self.poll_budget)
            .inspect_err(|err| {
                warn!(
                    "[SMMU-HV] {:?} for asid {} iova {:#x} failed: {}",
                    opcode, ctx.asid, ctx.iova, err
                )
            })
    }

    /// Sends the mappings of `regions` to the server.
    fn send_regions(&self, asid: Asid, regions: &[Region]) -> Result<()> {
        let chan = self.channel_for(asid);
        for region in regions {
            if region.large {
                for iova in region.iova.clone().step_by(LARGE_PAGE_SIZE) {
                    let paddr = region.paddr + (iova - region.iova.start);
                    let ctx = page_ctx(asid, iova, paddr, 1, region.flags);
                    self.call(chan, Opcode::MapLargePage, ctx)?;
                }
            } else {
                let pages = ((region.iova.end - region.iova.start) >> PAGE_SHIFT) as usize;
                let ctx = page_ctx(asid, region.iova.start, region.paddr, pages, region.flags);
                self.call(chan, Opcode::MapPage, ctx)?;
            }
        }
        Ok(())
    }

    /// Removes `pages` pages at `iova` on the server, reporting failure
    /// only in the log.
    fn undo_server(&self, asid: Asid, iova: Iova, pages: usize) {
        let ctx = page_ctx(asid, iova, 0, pages, PageFlags::empty());
        if self.call(self.channel_for(asid), Opcode::UnmapPage, ctx).is_err() {
            error!(
                "[SMMU-HV] AS {}: server keeps {} page(s) at {:#x} the shadow lacks",
                asid, pages, iova
            );
        }
    }

    /// Brings the shadow of `range` back to `before`.
    fn restore_shadow(pd: &mut PageDirectory, range: Range<Iova>, before: &[Region]) {
        let _ = pd.unmap(range.start, (range.end - range.start) as usize, usize::MAX, &NoFlush);
        for region in before.iter().filter(|region| region.large) {
            let len = (region.iova.end - region.iova.start) as usize;
            let _ = pd.unmap(region.iova.start, len, usize::MAX, &NoFlush);
        }
        for region in before {
            let result = if region.large {
                region.iova.clone().step_by(LARGE_PAGE_SIZE).try_for_each(|iova| {
                    let paddr = region.paddr + (iova - region.iova.start);
                    pd.write_large_pde(iova, paddr >> PAGE_SHIFT, region.flags, &NoFlush)
                })
            } else {
                let pages = (region.iova.end - region.iova.start) >> PAGE_SHIFT;
                let first = region.paddr >> PAGE_SHIFT;
                let pfns: Vec<Pfn> = (first..first + pages).collect();
                pd.map_run(region.iova.start, &pfns, region.flags, usize::MAX, &NoFlush)
            };
            if let Err(err) = result {
                error!(
                    "[SMMU-HV] AS {}: cannot restore shadow at {:#x}: {}",
                    pd.asid(),
                    region.iova.start,
                    err
                );
            }
        }
    }

    /// Maps a run of pages for `map_sg`, overwriting pages already mapped.
    fn map_pages(
        &self,
        pd: &mut PageDirectory,
        iova: Iova,
        pfns: &[Pfn],
        flags: PageFlags,
    ) -> Result<()> {
        let asid = pd.asid();
        let range = iova..iova + ((pfns.len() as u64) << PAGE_SHIFT);
        let send_runs = |sent: &mut usize| -> Result<()> {
            for (start, len) in contiguous_runs(pfns) {
                let at = iova + ((start as u64) << PAGE_SHIFT);
                let ctx = page_ctx(asid, at, pfns[start] << PAGE_SHIFT, len, flags);
                self.call(self.channel_for(asid), Opcode::MapPage, ctx)?;
                *sent = start + len;
            }
            Ok(())
        };

        let mut sent = 0;
        match self.policy {
            ShadowPolicy::ServerFirst => {
                pd.check_map_run(iova, pfns, flags)?;
                let before = pd.regions(range);
                let result = send_runs(&mut sent)
                    .and_then(|()| pd.map_run(iova, pfns, flags, usize::MAX, &NoFlush));
                if result.is_err() && sent > 0 {
                    self.undo_server(asid, iova, sent);
                    if self.send_regions(asid, &before).is_err() {
                        error!("[SMMU-HV] AS {}: server lost mappings at {:#x}", asid, iova);
                    }
                }
                result
            }
            ShadowPolicy::ShadowFirstRollback => {
                let before = pd.regions(range.clone());
                pd.map_run(iova, pfns, flags, usize::MAX, &NoFlush)?;
                let result = send_runs(&mut sent);
                if result.is_err() {
                    if sent > 0 {
                        self.undo_server(asid, iova, sent);
                        if self.send_regions(asid, &before).is_err() {
                            error!("[SMMU-HV] AS {}: server lost mappings at {:#x}", asid, iova);
                        }
                    }
                    Self::restore_shadow(pd, range, &before);
                }
                result
            }
        }
    }
}

impl SmmuBackend for HypervisorBackend {
    fn name(&self) -> &'static str {
        "hypervisor"
    }

    fn setup(&self) -> Result<()> {
        self.reset_channels();
        Ok(())
    }

    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            let _ = self.call(self.control(), Opcode::Disconnect, DriverContext::default());
            info!("[SMMU-HV] disconnected");
        }
    }

    fn activate_space(&self, asid: Asid, _pdir: Paddr) -> Result<()> {
        if !self.info.as_pool.contains(&asid) {
            return Err(Error::InvalidArgs);
        }
        debug!("[SMMU-HV] AS {} shadowed", asid);
        Ok(())
    }

    fn release_space(&self, tables: &PageDirectory) {
        let asid = tables.asid();
        for region in tables.walk() {
            let pages = ((region.iova.end - region.iova.start) >> PAGE_SHIFT) as usize;
            self.undo_server(asid, region.iova.start, pages);
        }
    }

    fn enable_hwgrp(&self, swgids: u64, asids: &WindowAsids) -> Result<()> {
        let mut attached = Vec::new();
        for swgid in swgid_bits(swgids) {
            for &asid in asids.iter().flatten() {
                let ctx = DriverContext {
                    asid,
                    hwgroup: swgid,
                    ..Default::default()
                };
                if let Err(err) = self.call(self.channel_for(asid), Opcode::Attach, ctx) {
                    let done = attached
                        .iter()
                        .fold(1u64 << swgid, |mask, swgid| mask | (1u64 << swgid));
                    let _ = self.disable_hwgrp(done);
                    return Err(err);
                }
            }
            attached.push(swgid);
        }
        Ok(())
    }

    fn disable_hwgrp(&self, swgids: u64) -> Result<()> {
        let mut result = Ok(());
        for swgid in swgid_bits(swgids) {
            let ctx = DriverContext {
                asid: self.info.as_pool.start,
                hwgroup: swgid,
                ..Default::default()
            };
            if let Err(err) = self.call(self.control(), Opcode::Detach, ctx) {
                result = result.and(Err(err));
            }
        }
        result
    }

    fn flush_space(&self, _asid: Asid) {}

    fn map_page(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
    ) -> Result<()> {
        let asid = space.asid();
        let ctx = page_ctx(asid, iova, pfn << PAGE_SHIFT, 1, flags);
        space.with_tables(|pd| match self.policy {
            ShadowPolicy::ServerFirst => {
                pd.check_map_page(iova, pfn, flags)?;
                self.call(self.channel_for(asid), Opcode::MapPage, ctx)?;
                pd.map_page(iova, pfn, flags, &NoFlush)
                    .inspect_err(|_| self.undo_server(asid, iova, 1))
            }
            ShadowPolicy::ShadowFirstRollback => {
                pd.map_page(iova, pfn, flags, &NoFlush)?;
                self.call(self.channel_for(asid), Opcode::MapPage, ctx)
                    .map(|_| ())
                    .inspect_err(|_| {
                        let _ = pd.unmap(iova, PAGE_SIZE, usize::MAX, &NoFlush);
                    })
            }
        })
    }

    fn map_large(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
    ) -> Result<()> {
        let asid = space.asid();
        let ctx = page_ctx(asid, iova, pfn << PAGE_SHIFT, 1, flags);
        let pages = LARGE_PAGE_SIZE / PAGE_SIZE;
        space.with_tables(|pd| match self.policy {
            ShadowPolicy::ServerFirst => {
                pd.check_map_large(iova, pfn, flags)?;
                self.call(self.channel_for(asid), Opcode::MapLargePage, ctx)?;
                pd.write_large_pde(iova, pfn, flags, &NoFlush)
                    .inspect_err(|_| self.undo_server(asid, iova, pages))
            }
            ShadowPolicy::ShadowFirstRollback => {
                pd.write_large_pde(iova, pfn, flags, &NoFlush)?;
                self.call(self.channel_for(asid), Opcode::MapLargePage, ctx)
                    .map(|_| ())
                    .inspect_err(|_| {
                        let _ = pd.unmap_large(iova, &NoFlush);
                    })
            }
        })
    }

    fn map_run(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfns: &[Pfn],
        flags: PageFlags,
    ) -> Result<()> {
        space.with_tables(|pd| self.map_pages(pd, iova, pfns, flags))
    }

    fn unmap(&self, space: &AddressSpace, iova: Iova, bytes: usize) -> Result<usize> {
        if bytes % PAGE_SIZE != 0 || bytes == 0 || iova.checked_add(bytes as u64).is_none() {
            return Err(Error::InvalidArgs);
        }
        let asid = space.asid();
        let pages = bytes / PAGE_SIZE;
        let range = iova..iova + bytes as u64;
        let ctx = page_ctx(asid, iova, 0, pages, PageFlags::empty());
        space.with_tables(|pd| {
            let before = pd.regions(range.clone());
            match self.policy {
                ShadowPolicy::ServerFirst => {
                    if before.is_empty() {
                        warn!("[SMMU-HV] AS {}: nothing mapped at {:#x}", asid, iova);
                        return Err(Error::NotMapped);
                    }
                    self.call(self.channel_for(asid), Opcode::UnmapPage, ctx)?;
                    pd.unmap(iova, bytes, usize::MAX, &NoFlush).inspect_err(|_| {
                        if self.send_regions(asid, &before).is_err() {
                            error!("[SMMU-HV] AS {}: server lost mappings at {:#x}", asid, iova);
                        }
                    })
                }
                ShadowPolicy::ShadowFirstRollback => {
                    let cleared = pd.unmap(iova, bytes, usize::MAX, &NoFlush)?;
                    if let Err(err) = self.call(self.channel_for(asid), Opcode::UnmapPage, ctx) {
                        Self::restore_shadow(pd, range, &before);
                        return Err(err);
                    }
                    Ok(cleared)
                }
            }
        })
    }

    fn lookup_remote(&self, asid: Asid, iova: Iova) -> Option<Paddr> {
        let ctx = DriverContext {
            asid,
            iova,
            ..Default::default()
        };
        self.call(self.control(), Opcode::Ipa, ctx)
            .ok()
            .map(|reply| reply.ctx.ipa)
    }

    fn stats_command(&self, cmd: StatsCommand) -> Result<()> {
        let ctx = DriverContext {
            count: cmd as i32,
            ..Default::default()
        };
        self.call(self.control(), Opcode::DebugOp, ctx).map(|_| ())
    }
}

impl Drop for HypervisorBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}
