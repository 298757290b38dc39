// SPDX-License-Identifier: MPL-2.0

use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Mutex;

use super::{SmmuIo, regs};
use crate::prelude::*;

/// One access observed by [`SimRegisters`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegAccess {
    Read(usize),
    Write(usize, u32),
}

/// An in-memory register file.
///
/// Every access is recorded in issue order, so the ordering of flushes and
/// read-backs can be checked. The TLB sync register can be made to report
/// busy for a number of polls.
pub struct SimRegisters {
    values: Mutex<BTreeMap<usize, u32>>,
    log: Mutex<Vec<RegAccess>>,
    sync_busy_polls: AtomicUsize,
}

impl SimRegisters {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(BTreeMap::new()),
            log: Mutex::new(Vec::new()),
            sync_busy_polls: AtomicUsize::new(0),
        }
    }

    /// The current value of a register, without logging an access.
    pub fn value(&self, offset: usize) -> u32 {
        self.values.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Sets a register as the hardware would, without logging an access.
    pub fn set_value(&self, offset: usize, value: u32) {
        self.values.lock().insert(offset, value);
    }

    /// Makes the next `polls` reads of the sync register report busy.
    pub fn set_sync_busy(&self, polls: usize) {
        self.sync_busy_polls.store(polls, Ordering::Relaxed);
    }

    pub fn accesses(&self) -> Vec<RegAccess> {
        self.log.lock().clone()
    }

    /// Returns the recorded accesses and starts a new log.
    pub fn take_accesses(&self) -> Vec<RegAccess> {
        core::mem::take(&mut *self.log.lock())
    }

    /// The values written to `offset`, oldest first.
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.log
            .lock()
            .iter()
            .filter_map(|access| match *access {
                RegAccess::Write(off, value) if off == offset => Some(value),
                _ => None,
            })
            .collect()
    }
}

impl Default for SimRegisters {
    fn default() -> Self {
        Self::new()
    }
}

impl SmmuIo for SimRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.log.lock().push(RegAccess::Read(offset));
        if offset == regs::TLB_SYNC {
            let busy = self
                .sync_busy_polls
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return regs::TLB_SYNC_BUSY;
            }
        }
        self.value(offset)
    }

    fn write(&self, offset: usize, value: u32) {
        self.log.lock().push(RegAccess::Write(offset, value));
        self.values.lock().insert(offset, value);
    }
}
