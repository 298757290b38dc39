// SPDX-License-Identifier: MPL-2.0

//! Access to the SMMU register file.

mod sim;

pub use self::sim::{RegAccess, SimRegisters};

/// 32-bit register access to one SMMU instance.
///
/// Writes are posted: a write is only guaranteed to have reached the device
/// once a later read from the same device returns.
pub trait SmmuIo: Send + Sync {
    fn read(&self, offset: usize) -> u32;
    fn write(&self, offset: usize, value: u32);
}

/// Register offsets and field encodings.
pub mod regs {
    pub const CONFIG: usize = 0x10;
    pub const CONFIG_DISABLE: u32 = 0;
    pub const CONFIG_ENABLE: u32 = 1;

    pub const TLB_CONFIG: usize = 0x14;
    pub const TLB_CONFIG_RESET: u32 = 0x2000_0010;
    pub const PTC_CONFIG: usize = 0x18;
    pub const PTC_CONFIG_RESET: u32 = 0x2000_003f;

    pub const PTB_ASID: usize = 0x1c;
    pub const PTB_DATA: usize = 0x20;
    pub const PTB_DATA_RESET: u32 = 0;

    pub const TLB_FLUSH: usize = 0x30;
    pub const TLB_FLUSH_VA_MATCH_ALL: u32 = 0;
    pub const TLB_FLUSH_VA_MATCH_SECTION: u32 = 2;
    pub const TLB_FLUSH_VA_MATCH_GROUP: u32 = 3;
    pub const TLB_FLUSH_VA_SECTION_MASK: u32 = 0xffc0_0000;
    pub const TLB_FLUSH_VA_GROUP_MASK: u32 = 0xffff_c000;
    pub const TLB_FLUSH_VA_SHIFT: u32 = 12;
    pub const TLB_FLUSH_ASID_SHIFT: u32 = 24;
    pub const TLB_FLUSH_ASID_MATCH: u32 = 1 << 31;

    pub const PTC_FLUSH: usize = 0x34;
    pub const PTC_FLUSH_TYPE_ALL: u32 = 0;
    pub const PTC_FLUSH_TYPE_ADR: u32 = 1;
    pub const PTC_FLUSH_ADR_MASK: u32 = 0xffff_fff0;
    /// Bits 32 and up of the entry address of an address-typed PTC flush.
    pub const PTC_FLUSH_1: usize = 0x9b8;

    pub const TLB_SYNC: usize = 0x3c;
    pub const TLB_SYNC_BUSY: u32 = 1 << 0;

    pub const STATS_TLB_HIT_COUNT: usize = 0x1f0;
    pub const STATS_TLB_MISS_COUNT: usize = 0x1f4;
    pub const STATS_PTC_HIT_COUNT: usize = 0x1f8;
    pub const STATS_PTC_MISS_COUNT: usize = 0x1fc;

    /// The routing register of swgid 0; one 32-bit register per swgid.
    pub const SWGRP_ASID_BASE: usize = 0x228;
    pub const SWGRP_ASID_DISABLE: u32 = 0;
    pub const SWGRP_ASID_ENABLE: u32 = 0x80;

    pub const fn swgrp_asid(swgid: u32) -> usize {
        SWGRP_ASID_BASE + 4 * swgid as usize
    }
}
