// SPDX-License-Identifier: MPL-2.0

//! Tunables of an SMMU instance.
//!
//! Values can be given programmatically or parsed from kernel command-line
//! style arguments, e.g.
//! `tegra_smmu.num_as=4 tegra_smmu.flush_all_threshold_map=0x40`.

use core::ops::Range;

use log::warn;

use crate::{error::Error, mm::PAGE_SHIFT, prelude::*};

/// The largest number of address spaces any SMMU generation implements.
pub const MAX_NUM_AS: usize = 128;

/// The IOVA span one address space translates.
pub const AS_WINDOW_SIZE: u64 = 1 << 32;

/// The module name recognized by [`SmmuConfig::from_module_args`].
const MODULE_NAME: &str = "tegra_smmu";

/// How the hypervisor backend orders a server request and the local shadow
/// update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShadowPolicy {
    /// Ask the server first and touch the shadow only on success.
    ServerFirst,
    /// Update the shadow first and undo the update if the server refuses.
    ShadowFirstRollback,
}

/// The configuration of one SMMU instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SmmuConfig {
    /// Number of hardware address spaces.
    pub num_as: usize,
    /// First IOVA of the default DMA window.
    pub iova_base: Iova,
    /// Number of 4 KiB pages in the default DMA window.
    pub page_count: u64,
    /// The swgids this SMMU may route.
    pub swgid_mask: u64,
    /// PTC line size in bytes.
    pub ptc_cache_line: usize,
    /// TLB line size in bytes.
    pub tlb_cache_line: usize,
    /// Pages above which `map_sg` flushes the whole AS instead of ranges.
    pub flush_all_threshold_map: usize,
    /// Pages above which `unmap` flushes the whole AS instead of ranges.
    pub flush_all_threshold_unmap: usize,
    /// Polls of the TLB sync bit before the flush is assumed done.
    pub tlb_sync_poll_budget: usize,
    /// Polls of a hypervisor channel before a request times out.
    pub hv_poll_budget: usize,
    /// Ordering of shadow and server updates in virtualized mode.
    pub shadow_policy: ShadowPolicy,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            num_as: 4,
            iova_base: 0,
            page_count: AS_WINDOW_SIZE >> PAGE_SHIFT,
            swgid_mask: u64::MAX,
            ptc_cache_line: 64,
            tlb_cache_line: 32,
            flush_all_threshold_map: 512,
            flush_all_threshold_unmap: 512,
            tlb_sync_poll_budget: 1000,
            hv_poll_budget: 100_000,
            shadow_policy: ShadowPolicy::ServerFirst,
        }
    }
}

impl SmmuConfig {
    /// Parses `tegra_smmu.<key>=<value>` arguments on top of the defaults.
    ///
    /// Arguments of other modules are ignored. Unknown keys and unparsable
    /// values are reported and skipped. The result is validated.
    pub fn from_module_args(args: &str) -> Result<Self> {
        let mut config = Self::default();
        for arg in args.split_whitespace() {
            let Some((module, option)) = arg.split_once('.') else {
                continue;
            };
            if module != MODULE_NAME {
                continue;
            }
            let Some((key, value)) = option.split_once('=') else {
                warn!("[SMMU] ignoring argument without value: {}", arg);
                continue;
            };
            if config.apply(key, value).is_none() {
                warn!("[SMMU] ignoring unrecognized argument: {}", arg);
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Option<()> {
        match key {
            "num_as" => self.num_as = parse_int(value)? as usize,
            "iova_base" => self.iova_base = parse_int(value)?,
            "page_count" => self.page_count = parse_int(value)?,
            "swgid_mask" => self.swgid_mask = parse_int(value)?,
            "ptc_cache_line" => self.ptc_cache_line = parse_int(value)? as usize,
            "tlb_cache_line" => self.tlb_cache_line = parse_int(value)? as usize,
            "flush_all_threshold_map" => self.flush_all_threshold_map = parse_int(value)? as usize,
            "flush_all_threshold_unmap" => {
                self.flush_all_threshold_unmap = parse_int(value)? as usize
            }
            "tlb_sync_poll_budget" => self.tlb_sync_poll_budget = parse_int(value)? as usize,
            "hv_poll_budget" => self.hv_poll_budget = parse_int(value)? as usize,
            "shadow_policy" => {
                self.shadow_policy = match value {
                    "server_first" => ShadowPolicy::ServerFirst,
                    "shadow_first" => ShadowPolicy::ShadowFirstRollback,
                    _ => return None,
                }
            }
            _ => return None,
        }
        Some(())
    }

    /// Checks that the values are consistent with each other and with the
    /// hardware limits.
    pub fn validate(&self) -> Result<()> {
        let line_ok = |line: usize| line.is_power_of_two() && line >= size_of::<u32>();
        let window_end = self
            .page_count
            .checked_shl(PAGE_SHIFT)
            .and_then(|len| self.iova_base.checked_add(len));

        let valid = (1..=MAX_NUM_AS).contains(&self.num_as)
            && self.page_count != 0
            && self.iova_base % (1 << PAGE_SHIFT) == 0
            && window_end.is_some_and(|end| end <= 4 * AS_WINDOW_SIZE)
            && self.swgid_mask != 0
            && line_ok(self.ptc_cache_line)
            && line_ok(self.tlb_cache_line)
            && self.tlb_cache_line <= self.ptc_cache_line
            && self.flush_all_threshold_map != 0
            && self.flush_all_threshold_unmap != 0
            && self.tlb_sync_poll_budget != 0
            && self.hv_poll_budget != 0;
        if valid {
            Ok(())
        } else {
            warn!("[SMMU] rejecting configuration {:?}", self);
            Err(Error::InvalidArgs)
        }
    }

    /// The default DMA window of new domains.
    pub fn window(&self) -> Range<Iova> {
        self.iova_base..self.iova_base + (self.page_count << PAGE_SHIFT)
    }
}

fn parse_int(value: &str) -> Option<u64> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SmmuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window(), 0..AS_WINDOW_SIZE);
        assert_eq!(config.flush_all_threshold_map, 512);
        assert_eq!(config.flush_all_threshold_unmap, 512);
    }

    #[test]
    fn module_args() {
        let config = SmmuConfig::from_module_args(
            "console=ttyS0 tegra_smmu.num_as=128 tegra_smmu.ptc_cache_line=0x80 \
             tegra_smmu.flush_all_threshold_unmap=64 tegra_smmu.shadow_policy=shadow_first \
             tegra_smmu.bogus=1 other.num_as=2",
        )
        .unwrap();
        assert_eq!(config.num_as, 128);
        assert_eq!(config.ptc_cache_line, 128);
        assert_eq!(config.flush_all_threshold_unmap, 64);
        assert_eq!(config.shadow_policy, ShadowPolicy::ShadowFirstRollback);
        assert_eq!(config.tlb_cache_line, 32);
    }

    #[test]
    fn unparsable_value_keeps_default() {
        let config = SmmuConfig::from_module_args("tegra_smmu.num_as=many").unwrap();
        assert_eq!(config.num_as, SmmuConfig::default().num_as);
    }

    #[test]
    fn rejects_inconsistent_values() {
        assert_eq!(
            SmmuConfig::from_module_args("tegra_smmu.num_as=129"),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            SmmuConfig::from_module_args("tegra_smmu.tlb_cache_line=128"),
            Err(Error::InvalidArgs)
        );
        assert_eq!(
            SmmuConfig::from_module_args("tegra_smmu.ptc_cache_line=48"),
            Err(Error::InvalidArgs)
        );
        let config = SmmuConfig {
            iova_base: 3 * AS_WINDOW_SIZE,
            page_count: (2 * AS_WINDOW_SIZE) >> PAGE_SHIFT,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(Error::InvalidArgs));
    }
}
