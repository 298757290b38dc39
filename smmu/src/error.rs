// SPDX-License-Identifier: MPL-2.0

use core::fmt;

use crate::hv::msg::ServerError;

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// Every address-space slot of the pool is in use.
    ResourceExhausted,
    /// A page-directory or page-table frame could not be allocated.
    NoMemory,
    /// Misaligned address, unsupported size or out-of-range value.
    InvalidArgs,
    /// The entry to be written is already mapped.
    AlreadyMapped,
    /// The entry to be cleared is already vacant.
    NotMapped,
    /// A domain could not get the address spaces it needs.
    NoFreeAddressSpace,
    /// The device is already attached, or already registered.
    AlreadyAttached,
    /// The device or address space is not bound where the caller expected.
    NotAttached,
    /// No such device or domain.
    NoDevice,
    /// The hypervisor did not answer within the polling budget.
    Timeout,
    /// A hypervisor response failed framing checks.
    Corrupt,
    /// The channel already has a request in flight.
    ChannelBusy,
    /// The channel timed out earlier and must be reset.
    ChannelStuck,
    /// The hypervisor rejected the request.
    Server(ServerError),
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::Server(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ResourceExhausted => write!(f, "address-space pool exhausted"),
            Error::NoMemory => write!(f, "out of page-table memory"),
            Error::InvalidArgs => write!(f, "invalid arguments"),
            Error::AlreadyMapped => write!(f, "entry already mapped"),
            Error::NotMapped => write!(f, "entry not mapped"),
            Error::NoFreeAddressSpace => write!(f, "no free address space"),
            Error::AlreadyAttached => write!(f, "device already attached"),
            Error::NotAttached => write!(f, "device not attached"),
            Error::NoDevice => write!(f, "no such device or domain"),
            Error::Timeout => write!(f, "hypervisor request timed out"),
            Error::Corrupt => write!(f, "corrupt hypervisor response"),
            Error::ChannelBusy => write!(f, "channel busy"),
            Error::ChannelStuck => write!(f, "channel stuck, reset required"),
            Error::Server(err) => write!(f, "hypervisor error: {:?}", err),
        }
    }
}
