// SPDX-License-Identifier: MPL-2.0

//! Hit and miss statistics of the PTC and the TLB.
//!
//! The hardware counters are 32 bits wide and wrap silently. They are
//! folded into 64-bit totals each time they are sampled, so sampling more
//! often than once per wrap keeps the totals exact.

use bitflags::bitflags;
use int_to_c_enum::TryFromInt;

bitflags! {
    /// Statistics bits of `TLB_CONFIG` and `PTC_CONFIG`.
    pub struct CacheConfig: u32 {
        const STATS_ENABLE = 1 << 31;
        /// Writing one clears the counters.
        const STATS_TEST = 1 << 30;
    }
}

/// A cache with hit and miss counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cache {
    Tlb,
    Ptc,
}

/// Control of the statistics counters.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum StatsCommand {
    On = 0,
    Off = 1,
    Reset = 2,
}

/// Accumulated counts of one cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hit: u64,
    pub miss: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Counter {
    total: u64,
    last_raw: u32,
}

impl Counter {
    fn update(&mut self, raw: u32) {
        self.total += u64::from(raw.wrapping_sub(self.last_raw));
        self.last_raw = raw;
    }
}

/// The 64-bit totals of both caches.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    tlb: [Counter; 2],
    ptc: [Counter; 2],
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds freshly read hardware counters into the totals.
    pub fn update(&mut self, cache: Cache, hit: u32, miss: u32) {
        let counters = self.counters_mut(cache);
        counters[0].update(hit);
        counters[1].update(miss);
    }

    pub fn get(&self, cache: Cache) -> CacheStats {
        let counters = match cache {
            Cache::Tlb => &self.tlb,
            Cache::Ptc => &self.ptc,
        };
        CacheStats {
            hit: counters[0].total,
            miss: counters[1].total,
        }
    }

    /// Clears the totals, matching a hardware counter reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn counters_mut(&mut self, cache: Cache) -> &mut [Counter; 2] {
        match cache {
            Cache::Tlb => &mut self.tlb,
            Cache::Ptc => &mut self.ptc,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn totals_survive_wrap() {
        let mut stats = StatsAccumulator::new();
        stats.update(Cache::Tlb, 0xffff_fff0, 10);
        stats.update(Cache::Tlb, 0x10, 12);
        assert_eq!(
            stats.get(Cache::Tlb),
            CacheStats {
                hit: 0x1_0000_0010,
                miss: 12,
            }
        );
        assert_eq!(stats.get(Cache::Ptc), CacheStats::default());
    }

    #[test]
    fn reset_clears() {
        let mut stats = StatsAccumulator::new();
        stats.update(Cache::Ptc, 5, 6);
        stats.reset();
        assert_eq!(stats.get(Cache::Ptc), CacheStats::default());
        stats.update(Cache::Ptc, 2, 3);
        assert_eq!(stats.get(Cache::Ptc), CacheStats { hit: 2, miss: 3 });
    }

    #[test]
    fn command_codes() {
        assert_eq!(StatsCommand::try_from(2u32).ok(), Some(StatsCommand::Reset));
        assert!(StatsCommand::try_from(3u32).is_err());
    }
}
