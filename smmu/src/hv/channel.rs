// SPDX-License-Identifier: MPL-2.0

//! Half-duplex request/response channels to the hypervisor server.
//!
//! A channel carries at most one request at a time:
//!
//! ```text
//! Idle --submit--> RequestPending --poll--> ResponseAvailable --take--> Idle
//!                        |
//!                        +--budget exhausted--> Stuck --reset--> Idle
//! ```
//!
//! Responses are polled for rather than waited on, so every operation can
//! run where sleeping is not allowed.

use log::{error, info};
use spin::Mutex;
use zerocopy::IntoBytes;

use super::msg::Message;
use crate::{error::Error, prelude::*};

/// The shared-memory transport underneath the channels.
pub trait IvcTransport: Send + Sync {
    fn num_channels(&self) -> usize;

    /// Queues one frame towards the server on channel `chan`.
    fn send(&self, chan: usize, frame: &[u8]) -> Result<()>;

    /// Takes the next frame from the server on `chan` without blocking.
    ///
    /// Copies as much as fits into `buf` and returns the full frame length.
    fn recv(&self, chan: usize, buf: &mut [u8]) -> Option<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    RequestPending,
    ResponseAvailable,
    /// The server missed its deadline; [`CommChannel::reset`] is required.
    Stuck,
}

struct ChannelInner {
    state: ChannelState,
    response: Option<Message>,
}

/// One channel to the server.
pub struct CommChannel {
    id: usize,
    /// Held across a whole exchange by [`CommChannel::call`].
    exchange: Mutex<()>,
    inner: Mutex<ChannelInner>,
}

impl CommChannel {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            exchange: Mutex::new(()),
            inner: Mutex::new(ChannelInner {
                state: ChannelState::Idle,
                response: None,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.lock().state
    }

    /// Sends `request` on an idle channel.
    pub fn submit(&self, transport: &dyn IvcTransport, mut request: Message) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::Idle => {}
            ChannelState::Stuck => return Err(Error::ChannelStuck),
            ChannelState::RequestPending | ChannelState::ResponseAvailable => {
                return Err(Error::ChannelBusy);
            }
        }
        request.channel_id = self.id as i32;
        transport.send(self.id, request.as_bytes())?;
        inner.state = ChannelState::RequestPending;
        Ok(())
    }

    /// Checks once whether the response has arrived.
    ///
    /// A frame that fails the framing checks ends the exchange: it is
    /// dropped, the channel goes back to idle and `Corrupt` is returned.
    pub fn poll(&self, transport: &dyn IvcTransport) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.state {
            ChannelState::RequestPending => {}
            ChannelState::ResponseAvailable => return Ok(true),
            ChannelState::Idle => return Ok(false),
            ChannelState::Stuck => return Err(Error::ChannelStuck),
        }

        let mut buf = [0u8; Message::SIZE];
        let Some(len) = transport.recv(self.id, &mut buf) else {
            return Ok(false);
        };
        let response = if len == Message::SIZE {
            Message::from_frame(&buf)
        } else {
            error!(
                "[SMMU-HV] channel {}: dropping {}-byte frame",
                self.id, len
            );
            Err(Error::Corrupt)
        };
        match response {
            Ok(msg) if msg.channel_id == self.id as i32 => {
                inner.response = Some(msg);
                inner.state = ChannelState::ResponseAvailable;
                Ok(true)
            }
            Ok(msg) => {
                error!(
                    "[SMMU-HV] channel {}: dropping response for channel {}",
                    self.id, msg.channel_id
                );
                inner.state = ChannelState::Idle;
                Err(Error::Corrupt)
            }
            Err(err) => {
                inner.state = ChannelState::Idle;
                Err(err)
            }
        }
    }

    /// Takes an arrived response, making the channel idle again.
    pub fn take_response(&self) -> Option<Message> {
        let mut inner = self.inner.lock();
        if inner.state != ChannelState::ResponseAvailable {
            return None;
        }
        inner.state = ChannelState::Idle;
        inner.response.take()
    }

    /// Polls for the response up to `budget` times, calling `relax` in
    /// between.
    ///
    /// If the budget runs out the channel is left stuck.
    pub fn wait(
        &self,
        transport: &dyn IvcTransport,
        budget: usize,
        mut relax: impl FnMut(),
    ) -> Result<Message> {
        for _ in 0..budget {
            if self.poll(transport)? {
                return self.take_response().ok_or(Error::Corrupt);
            }
            relax();
        }
        let mut inner = self.inner.lock();
        if inner.state == ChannelState::RequestPending {
            inner.state = ChannelState::Stuck;
        }
        error!(
            "[SMMU-HV] channel {}: no response after {} polls",
            self.id, budget
        );
        Err(Error::Timeout)
    }

    /// Sends `request` and spins until its response arrives.
    ///
    /// A response reporting a server error is turned into
    /// [`Error::Server`].
    pub fn call(
        &self,
        transport: &dyn IvcTransport,
        request: Message,
        budget: usize,
    ) -> Result<Message> {
        let _exchange = self.exchange.lock();
        self.submit(transport, request)?;
        let response = self.wait(transport, budget, core::hint::spin_loop)?;
        if response.msg != request.msg {
            error!(
                "[SMMU-HV] channel {}: response opcode {} to request {}",
                self.id, response.msg, request.msg
            );
            return Err(Error::Corrupt);
        }
        response.status()?;
        Ok(response)
    }

    /// Returns the channel to idle and discards late frames.
    pub fn reset(&self, transport: &dyn IvcTransport) {
        let _exchange = self.exchange.lock();
        let mut inner = self.inner.lock();
        let mut buf = [0u8; Message::SIZE];
        let mut dropped = 0;
        while transport.recv(self.id, &mut buf).is_some() {
            dropped += 1;
        }
        if inner.state != ChannelState::Idle || dropped != 0 {
            info!(
                "[SMMU-HV] channel {}: reset from {:?}, {} frame(s) dropped",
                self.id, inner.state, dropped
            );
        }
        inner.state = ChannelState::Idle;
        inner.response = None;
    }
}
