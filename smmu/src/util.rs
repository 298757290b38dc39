// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicU32, Ordering};

/// The swgids set in `mask`, lowest first.
pub(crate) fn swgid_bits(mask: u64) -> impl Iterator<Item = u32> {
    (0..u64::BITS).filter(move |&bit| mask & (1u64 << bit) != 0)
}

/// Limits how often a noisy diagnostic is emitted.
///
/// The crate has no clock, so the window is counted in events: out of every
/// `interval` calls to [`RateLimit::check`], only the first `burst` pass.
pub(crate) struct RateLimit {
    interval: u32,
    burst: u32,
    events: AtomicU32,
    suppressed: AtomicU32,
}

impl RateLimit {
    pub(crate) const fn new(interval: u32, burst: u32) -> Self {
        Self {
            interval,
            burst,
            events: AtomicU32::new(0),
            suppressed: AtomicU32::new(0),
        }
    }

    /// Returns whether this event may be reported.
    pub(crate) fn check(&self) -> bool {
        let n = self.events.fetch_add(1, Ordering::Relaxed) % self.interval;
        if n < self.burst {
            true
        } else {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Returns and clears the number of events dropped since the last call.
    pub(crate) fn take_suppressed(&self) -> u32 {
        self.suppressed.swap(0, Ordering::Relaxed)
    }
}
