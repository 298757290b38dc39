// SPDX-License-Identifier: MPL-2.0

//! Page-table and address-space manager for the Tegra SMMU.
//!
//! The SMMU translates device DMA addresses (IOVAs) through a two-level
//! table: a 1024-entry page directory whose entries either point at a
//! 1024-entry page table of 4 KiB mappings or map a 4 MiB page directly.
//! Each hardware address space (AS) owns one such directory.
//!
//! This crate keeps those tables, hands out address spaces from the
//! hardware pool, invalidates the page-table cache (PTC) and TLB after
//! every mutation, and routes device stream IDs (swgids) to address spaces.
//! When the hardware belongs to a hypervisor, every mutation is forwarded
//! to the server over a message channel and only a local shadow of the
//! tables is kept.
//!
//! The entry point is [`Smmu`], created by [`Smmu::probe`] for bare-metal
//! hardware or [`Smmu::probe_virtualized`] for the hypervisor-backed mode.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

extern crate alloc;

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod flush;
pub mod hv;
pub mod io;
pub mod mm;
pub mod page_table;
pub mod prelude;
mod smmu;
pub mod space;
pub mod stats;
mod util;

pub use self::{
    config::{ShadowPolicy, SmmuConfig},
    domain::{DomainId, client::DeviceId},
    error::Error,
    prelude::Result,
    smmu::{FaultReport, Smmu},
};
