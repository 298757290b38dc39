// SPDX-License-Identifier: MPL-2.0

//! An in-process hypervisor server.
//!
//! [`LoopbackServer`] answers requests synchronously from `send`, keeping
//! its own translation table keyed by ASID and page-aligned IOVA. Faults
//! can be injected into the next exchange.

use alloc::collections::{BTreeMap, VecDeque};
use core::ops::Range;

use log::debug;
use spin::Mutex;
use zerocopy::{FromBytes, IntoBytes};

use super::{
    channel::IvcTransport,
    msg::{DriverContext, InfoReply, Message, Opcode, ServerError, WireRange},
};
use crate::{
    error::Error,
    mm::{LARGE_PAGE_SIZE, PAGE_SIZE},
    prelude::*,
    space::Asid,
    stats::StatsCommand,
};

/// A misbehavior applied to the next request the server receives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this error code.
    Reject(ServerError),
    /// Answer with an unknown error code.
    UnknownError,
    /// Answer with start and end markers swapped.
    SwapMarkers,
    /// Answer as if on another channel.
    WrongChannel,
    /// Answer with a truncated frame.
    Truncate,
    /// Process the request but never answer.
    Silent,
}

/// One page as the server maps it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ServerPage {
    pub ipa: u64,
    pub attr: i32,
}

enum Reply {
    Empty,
    Info(InfoReply),
    Ipa(u64),
}

struct ServerState {
    queues: Vec<VecDeque<Vec<u8>>>,
    connected: bool,
    pages: BTreeMap<(Asid, u64), ServerPage>,
    routes: BTreeMap<u32, Vec<Asid>>,
    requests: Vec<Opcode>,
    debug_ops: Vec<StatsCommand>,
    fault: Option<Fault>,
}

pub struct LoopbackServer {
    info: InfoReply,
    state: Mutex<ServerState>,
}

fn page_key(asid: Asid, iova: u64) -> (Asid, u64) {
    (asid, iova & !(PAGE_SIZE as u64 - 1))
}

impl LoopbackServer {
    /// Creates a server with `channels` channels granting the given pools.
    pub fn new(
        channels: usize,
        as_pool: Range<Asid>,
        iova_window: Range<Iova>,
        swgid_mask: u64,
    ) -> Self {
        Self {
            info: InfoReply {
                as_pool: WireRange {
                    start: as_pool.start as u64,
                    end: as_pool.end as u64,
                },
                iova_window: WireRange {
                    start: iova_window.start,
                    end: iova_window.end,
                },
                swgid_mask,
            },
            state: Mutex::new(ServerState {
                queues: (0..channels).map(|_| VecDeque::new()).collect(),
                connected: false,
                pages: BTreeMap::new(),
                routes: BTreeMap::new(),
                requests: Vec::new(),
                debug_ops: Vec::new(),
                fault: None,
            }),
        }
    }

    /// Applies `fault` to the next request.
    pub fn inject(&self, fault: Fault) {
        self.state.lock().fault = Some(fault);
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    pub fn page(&self, asid: Asid, iova: Iova) -> Option<ServerPage> {
        self.state.lock().pages.get(&page_key(asid, iova)).copied()
    }

    pub fn mapped_pages(&self, asid: Asid) -> usize {
        self.state
            .lock()
            .pages
            .keys()
            .filter(|(owner, _)| *owner == asid)
            .count()
    }

    /// The address spaces `swgid` is attached to.
    pub fn routes(&self, swgid: u32) -> Vec<Asid> {
        self.state
            .lock()
            .routes
            .get(&swgid)
            .cloned()
            .unwrap_or_default()
    }

    /// Every opcode received so far, in order.
    pub fn requests(&self) -> Vec<Opcode> {
        self.state.lock().requests.clone()
    }

    pub fn debug_ops(&self) -> Vec<StatsCommand> {
        self.state.lock().debug_ops.clone()
    }

    /// Queues an unsolicited frame on `chan`.
    pub fn push_frame(&self, chan: usize, frame: &[u8]) {
        if let Some(queue) = self.state.lock().queues.get_mut(chan) {
            queue.push_back(frame.to_vec());
        }
    }

    fn in_pool(&self, asid: Asid) -> bool {
        (self.info.as_pool.start..self.info.as_pool.end).contains(&(asid as u64))
    }

    fn in_window(&self, iova: u64, len: u64) -> bool {
        let window = &self.info.iova_window;
        iova >= window.start && iova.checked_add(len).is_some_and(|end| end <= window.end)
    }

    fn process(
        &self,
        state: &mut ServerState,
        opcode: Opcode,
        ctx: &DriverContext,
    ) -> core::result::Result<Reply, ServerError> {
        match opcode {
            Opcode::Connect => {
                state.connected = true;
                state.pages.clear();
                state.routes.clear();
                return Ok(Reply::Empty);
            }
            Opcode::Disconnect => {
                state.connected = false;
                return Ok(Reply::Empty);
            }
            _ if !state.connected => return Err(ServerError::ServerState),
            _ => {}
        }
        match opcode {
            Opcode::SmmuInfo => return Ok(Reply::Info(self.info)),
            Opcode::DebugOp => {
                let cmd = u32::try_from(ctx.count)
                    .ok()
                    .and_then(|cmd| StatsCommand::try_from(cmd).ok())
                    .ok_or(ServerError::UnsupportedRequest)?;
                state.debug_ops.push(cmd);
                return Ok(Reply::Empty);
            }
            _ => {}
        }
        if !self.in_pool(ctx.asid) {
            return Err(ServerError::PermissionDenied);
        }
        match opcode {
            Opcode::Attach => {
                if ctx.hwgroup >= u64::BITS || self.info.swgid_mask & (1u64 << ctx.hwgroup) == 0 {
                    return Err(ServerError::PermissionDenied);
                }
                let asids = state.routes.entry(ctx.hwgroup).or_default();
                if !asids.contains(&ctx.asid) {
                    asids.push(ctx.asid);
                }
            }
            Opcode::Detach => {
                state
                    .routes
                    .remove(&ctx.hwgroup)
                    .ok_or(ServerError::InvalidArgs)?;
            }
            Opcode::MapPage | Opcode::MapLargePage => {
                let pages = if opcode == Opcode::MapLargePage {
                    (LARGE_PAGE_SIZE / PAGE_SIZE) as u64
                } else {
                    u64::try_from(ctx.count).map_err(|_| ServerError::InvalidArgs)?
                };
                let len = pages * PAGE_SIZE as u64;
                if pages == 0 || ctx.iova % PAGE_SIZE as u64 != 0 || !self.in_window(ctx.iova, len)
                {
                    return Err(ServerError::InvalidArgs);
                }
                for idx in 0..pages {
                    let offset = idx * PAGE_SIZE as u64;
                    state.pages.insert(
                        page_key(ctx.asid, ctx.iova + offset),
                        ServerPage {
                            ipa: ctx.ipa + offset,
                            attr: ctx.attr,
                        },
                    );
                }
            }
            Opcode::UnmapPage => {
                let pages = u64::try_from(ctx.count).map_err(|_| ServerError::InvalidArgs)?;
                let removed = (0..pages)
                    .filter(|idx| {
                        let iova = ctx.iova + idx * PAGE_SIZE as u64;
                        state.pages.remove(&page_key(ctx.asid, iova)).is_some()
                    })
                    .count();
                if removed == 0 {
                    return Err(ServerError::InvalidArgs);
                }
            }
            Opcode::Ipa => {
                let page = state
                    .pages
                    .get(&page_key(ctx.asid, ctx.iova))
                    .ok_or(ServerError::InvalidArgs)?;
                return Ok(Reply::Ipa(page.ipa + (ctx.iova & (PAGE_SIZE as u64 - 1))));
            }
            Opcode::SmmuInfo | Opcode::Connect | Opcode::Disconnect | Opcode::DebugOp => {}
        }
        Ok(Reply::Empty)
    }
}

impl IvcTransport for LoopbackServer {
    fn num_channels(&self) -> usize {
        self.state.lock().queues.len()
    }

    fn send(&self, chan: usize, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if chan >= state.queues.len() {
            return Err(Error::InvalidArgs);
        }
        if !state.queues[chan].is_empty() {
            return Err(Error::ChannelBusy);
        }
        let request = Message::read_from_bytes(frame).map_err(|_| Error::InvalidArgs)?;

        let mut response = Message::response_to(&request);
        let fault = state.fault.take();
        match (fault, Opcode::try_from(request.msg)) {
            (Some(Fault::Reject(err)), _) => response.error_code = err as u32,
            (Some(Fault::UnknownError), _) => response.error_code = 0x7f,
            (_, Err(_)) => response.error_code = ServerError::UnsupportedRequest as u32,
            (_, Ok(opcode)) => {
                state.requests.push(opcode);
                match self.process(&mut state, opcode, &request.ctx) {
                    Ok(Reply::Empty) => {}
                    Ok(Reply::Info(info)) => response.info = info,
                    Ok(Reply::Ipa(ipa)) => response.ctx.ipa = ipa,
                    Err(err) => response.error_code = err as u32,
                }
            }
        }
        debug!(
            "[SMMU-HV] loopback: channel {} op {} -> {}",
            chan, request.msg, response.error_code
        );

        let frame = match fault {
            Some(Fault::Silent) => return Ok(()),
            Some(Fault::SwapMarkers) => {
                core::mem::swap(&mut response.start_marker, &mut response.end_marker);
                response.as_bytes().to_vec()
            }
            Some(Fault::WrongChannel) => {
                response.channel_id += 1;
                response.as_bytes().to_vec()
            }
            Some(Fault::Truncate) => response.as_bytes()[..Message::SIZE / 2].to_vec(),
            _ => response.as_bytes().to_vec(),
        };
        state.queues[chan].push_back(frame);
        Ok(())
    }

    fn recv(&self, chan: usize, buf: &mut [u8]) -> Option<usize> {
        let frame = self.state.lock().queues.get_mut(chan)?.pop_front()?;
        let len = frame.len().min(buf.len());
        buf[..len].copy_from_slice(&frame[..len]);
        Some(frame.len())
    }
}
