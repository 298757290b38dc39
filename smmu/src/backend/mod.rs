// SPDX-License-Identifier: MPL-2.0

//! The operations that differ between owning the SMMU and borrowing it from
//! a hypervisor.
//!
//! An [`Smmu`](crate::Smmu) picks one backend at probe time and keeps it for
//! its whole life.

mod native;

pub use self::native::NativeBackend;
use crate::{
    domain::WindowAsids,
    page_table::{PageDirectory, PageFlags},
    prelude::*,
    space::{AddressSpace, Asid},
    stats::{Cache, StatsCommand},
};

/// Hardware access of an SMMU, either direct or through a hypervisor.
pub trait SmmuBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Brings the translation hardware into its initial state.
    fn setup(&self) -> Result<()>;

    /// Stops translation.
    fn shutdown(&self);

    /// Quiesces the hardware before a system sleep; [`SmmuBackend::setup`]
    /// brings it back.
    fn suspend(&self) {}

    /// Points address space `asid` at the directory at `pdir`.
    fn activate_space(&self, asid: Asid, pdir: Paddr) -> Result<()>;

    /// Detaches the hardware from the tables before they are freed.
    fn release_space(&self, tables: &PageDirectory);

    /// Routes every swgid in `swgids` to the address spaces of a domain.
    fn enable_hwgrp(&self, swgids: u64, asids: &WindowAsids) -> Result<()>;

    /// Stops translating the swgids in `swgids`.
    fn disable_hwgrp(&self, swgids: u64) -> Result<()>;

    /// Moves routed swgids over to the address spaces `asids`.
    fn rebind_hwgrp(&self, swgids: u64, asids: &WindowAsids) -> Result<()> {
        self.disable_hwgrp(swgids)?;
        self.enable_hwgrp(swgids, asids)
    }

    /// Drops everything the hardware caches for `asid`.
    fn flush_space(&self, asid: Asid);

    fn map_page(&self, space: &AddressSpace, iova: Iova, pfn: Pfn, flags: PageFlags)
    -> Result<()>;

    fn map_large(
        &self,
        space: &AddressSpace,
        iova: Iova,
        pfn: Pfn,
        flags: PageFlags,
    ) -> Result<()>;

    fn map_run(&self, space: &AddressSpace, iova: Iova, pfns: &[Pfn], flags: PageFlags)
    -> Result<()>;

    /// Returns the number of bytes whose mapping was removed.
    fn unmap(&self, space: &AddressSpace, iova: Iova, bytes: usize) -> Result<usize>;

    /// Translates `iova` without the local tables, if the backend can.
    fn lookup_remote(&self, _asid: Asid, _iova: Iova) -> Option<Paddr> {
        None
    }

    fn stats_command(&self, cmd: StatsCommand) -> Result<()>;

    /// Reads the raw hit and miss counters of `cache`, if visible.
    fn sample_stats(&self, _cache: Cache) -> Option<(u32, u32)> {
        None
    }
}
