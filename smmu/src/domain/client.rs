// SPDX-License-Identifier: MPL-2.0

//! The devices known to the SMMU.

use alloc::collections::BTreeMap;
use core::fmt;

use log::warn;

use super::DomainId;
use crate::{error::Error, prelude::*};

/// Identifies a client device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

/// A registered device and the stream IDs it issues DMA with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Client {
    pub dev: DeviceId,
    pub swgids: u64,
    /// The domain the device is attached to.
    pub domain: Option<DomainId>,
}

/// The registered devices.
#[derive(Default)]
pub struct ClientRegistry {
    clients: BTreeMap<DeviceId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `dev` as issuing DMA with the swgids of `swgids`.
    ///
    /// Every swgid must be routable, i.e. set in `routable`.
    pub fn register(&mut self, dev: DeviceId, swgids: u64, routable: u64) -> Result<()> {
        if swgids == 0 || swgids & !routable != 0 {
            warn!(
                "[SMMU] {}: swgids {:#x} outside the routable set {:#x}",
                dev, swgids, routable
            );
            return Err(Error::InvalidArgs);
        }
        if self.clients.contains_key(&dev) {
            warn!("[SMMU] {} is already registered", dev);
            return Err(Error::AlreadyAttached);
        }
        if let Some(owner) = self.clients.values().find(|c| c.swgids & swgids != 0) {
            warn!(
                "[SMMU] {}: swgids {:#x} overlap those of {}",
                dev,
                owner.swgids & swgids,
                owner.dev
            );
        }
        self.clients.insert(
            dev,
            Client {
                dev,
                swgids,
                domain: None,
            },
        );
        Ok(())
    }

    pub fn unregister(&mut self, dev: DeviceId) -> Option<Client> {
        self.clients.remove(&dev)
    }

    pub fn get(&self, dev: DeviceId) -> Option<&Client> {
        self.clients.get(&dev)
    }

    pub fn get_mut(&mut self, dev: DeviceId) -> Option<&mut Client> {
        self.clients.get_mut(&dev)
    }

    /// The client whose swgids include `swgid`.
    pub fn by_swgid(&self, swgid: u32) -> Option<&Client> {
        let bit = 1u64.checked_shl(swgid)?;
        self.clients.values().find(|c| c.swgids & bit != 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
