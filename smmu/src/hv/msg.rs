// SPDX-License-Identifier: MPL-2.0

//! The request/response message exchanged with the hypervisor server.
//!
//! Requests and responses share one fixed 96-byte C layout in host byte
//! order. A response is accepted only if both markers are intact and it
//! names the channel it arrived on.

use int_to_c_enum::TryFromInt;
use log::error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{error::Error, prelude::*};

pub const START_MARKER: u32 = 0xDEAD_BEAF;
pub const END_MARKER: u32 = 0xBEAF_DEAD;

/// The operation a message carries.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum Opcode {
    SmmuInfo = 0,
    Attach = 1,
    Detach = 2,
    MapPage = 3,
    MapLargePage = 4,
    UnmapPage = 5,
    Ipa = 6,
    Connect = 7,
    Disconnect = 8,
    DebugOp = 9,
}

/// The failures a server reports in `error_code`.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromInt)]
pub enum ServerError {
    ServerState = 1,
    PermissionDenied = 2,
    InvalidArgs = 3,
    InvalidRequest = 4,
    UnsupportedRequest = 5,
}

/// The request payload.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DriverContext {
    pub asid: u32,
    pub hwgroup: u32,
    pub iova: u64,
    pub ipa: u64,
    /// The number of 4 KiB pages, or the command of a `DebugOp`.
    pub count: i32,
    pub attr: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireRange {
    pub start: u64,
    pub end: u64,
}

/// The payload of an `SmmuInfo` response.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InfoReply {
    /// The ASIDs granted to this guest, end exclusive.
    pub as_pool: WireRange,
    /// The IOVA window the guest may map, end exclusive.
    pub iova_window: WireRange,
    pub swgid_mask: u64,
}

/// One message, request or response.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Message {
    pub start_marker: u32,
    pub msg: u32,
    pub channel_id: i32,
    /// Alignment padding before the 8-byte aligned context.
    pub _reserved: u32,
    pub ctx: DriverContext,
    pub info: InfoReply,
    pub error_code: u32,
    pub end_marker: u32,
}

const _: () = assert!(size_of::<Message>() == 96);

impl Message {
    pub const SIZE: usize = size_of::<Self>();

    /// Builds a request. The channel fills in `channel_id`.
    pub fn request(opcode: Opcode, ctx: DriverContext) -> Self {
        Self {
            start_marker: START_MARKER,
            msg: opcode as u32,
            ctx,
            end_marker: END_MARKER,
            ..Default::default()
        }
    }

    /// Builds the success response to `request`.
    pub fn response_to(request: &Message) -> Self {
        Self {
            error_code: 0,
            ..*request
        }
    }

    /// Parses a received frame.
    ///
    /// The frame must be exactly one message with intact markers.
    pub fn from_frame(frame: &[u8]) -> Result<Self> {
        let Ok(msg) = Message::read_from_bytes(frame) else {
            error!(
                "[SMMU-HV] dropping {}-byte frame, expected {}",
                frame.len(),
                Self::SIZE
            );
            return Err(Error::Corrupt);
        };
        if !msg.has_valid_markers() {
            error!(
                "[SMMU-HV] dropping frame with markers {:#x}/{:#x}",
                msg.start_marker, msg.end_marker
            );
            return Err(Error::Corrupt);
        }
        Ok(msg)
    }

    pub fn has_valid_markers(&self) -> bool {
        self.start_marker == START_MARKER && self.end_marker == END_MARKER
    }

    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::try_from(self.msg).map_err(|_| Error::Corrupt)
    }

    /// Converts the `error_code` of a response.
    pub fn status(&self) -> Result<()> {
        if self.error_code == 0 {
            return Ok(());
        }
        match ServerError::try_from(self.error_code) {
            Ok(err) => Err(Error::Server(err)),
            Err(_) => {
                error!("[SMMU-HV] unknown server error code {}", self.error_code);
                Err(Error::Corrupt)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_is_fixed() {
        let mut msg = Message::request(
            Opcode::MapPage,
            DriverContext {
                asid: 1,
                hwgroup: 2,
                iova: 0x1000,
                ipa: 0x50_0000,
                count: 1,
                attr: -1,
            },
        );
        msg.channel_id = 7;
        let bytes = msg.as_bytes();
        assert_eq!(bytes.len(), 96);
        assert_eq!(bytes[0..4], START_MARKER.to_ne_bytes());
        assert_eq!(bytes[4..8], 3u32.to_ne_bytes());
        assert_eq!(bytes[8..12], 7i32.to_ne_bytes());
        assert_eq!(bytes[16..20], 1u32.to_ne_bytes());
        assert_eq!(bytes[20..24], 2u32.to_ne_bytes());
        assert_eq!(bytes[24..32], 0x1000u64.to_ne_bytes());
        assert_eq!(bytes[32..40], 0x50_0000u64.to_ne_bytes());
        assert_eq!(bytes[40..44], 1i32.to_ne_bytes());
        assert_eq!(bytes[44..48], (-1i32).to_ne_bytes());
        assert_eq!(bytes[88..92], 0u32.to_ne_bytes());
        assert_eq!(bytes[92..96], END_MARKER.to_ne_bytes());
        assert_eq!(Message::from_frame(bytes), Ok(msg));
    }

    #[test]
    fn info_reply_offsets() {
        let mut msg = Message::request(Opcode::SmmuInfo, DriverContext::default());
        msg.info = InfoReply {
            as_pool: WireRange { start: 4, end: 8 },
            iova_window: WireRange {
                start: 0x1000,
                end: 0x8000_0000,
            },
            swgid_mask: 0xff,
        };
        let bytes = msg.as_bytes();
        assert_eq!(bytes[48..56], 4u64.to_ne_bytes());
        assert_eq!(bytes[56..64], 8u64.to_ne_bytes());
        assert_eq!(bytes[80..88], 0xffu64.to_ne_bytes());
    }

    #[test]
    fn swapped_markers_are_corrupt() {
        let mut msg = Message::request(Opcode::Ipa, DriverContext::default());
        core::mem::swap(&mut msg.start_marker, &mut msg.end_marker);
        assert_eq!(Message::from_frame(msg.as_bytes()), Err(Error::Corrupt));
    }

    #[test]
    fn short_frame_is_corrupt() {
        let msg = Message::request(Opcode::Ipa, DriverContext::default());
        assert_eq!(Message::from_frame(&msg.as_bytes()[..90]), Err(Error::Corrupt));
    }

    #[test]
    fn status_codes() {
        let mut msg = Message::request(Opcode::Attach, DriverContext::default());
        assert_eq!(msg.status(), Ok(()));
        msg.error_code = 2;
        assert_eq!(
            msg.status(),
            Err(Error::Server(ServerError::PermissionDenied))
        );
        msg.error_code = 99;
        assert_eq!(msg.status(), Err(Error::Corrupt));
        msg.msg = 42;
        assert_eq!(msg.opcode(), Err(Error::Corrupt));
    }
}
