// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! EP0 control transfer sequencing.
//!
//! A control transfer is three stages:
//!
//! - SETUP: the host sends an 8-byte request.
//! - DATA (optional): one or more packets in the direction the request names.
//! - STATUS: a zero-length packet in the _opposite_ direction to DATA (or IN,
//!   if there was no data stage), which is how the host learns the request
//!   succeeded.
//!
//! [`Control`] walks those stages. It doesn't know any registers; instead it
//! drives an [`Ep0Port`], which each controller implements, and tells its
//! caller through [`Next`] when the class driver needs to be involved. A new
//! SETUP always starts over, whatever state the previous transfer was in.

use core::cell::Cell;

use log::{debug, trace, warn};

use crate::endpoint::{tx_advance, EpState, TxStep, Xfer};
use crate::error::Stall;
use crate::setup::{Direction, Recipient, Request, SetupPacket};

/// The hardware half of EP0.
pub trait Ep0Port<'a> {
    /// Whether `SET_ADDRESS` has to reach the hardware before the status
    /// stage is loaded. The Synopsys core wants it early, because it answers
    /// the status IN from the old address by itself; the USB_FS block must
    /// keep using address 0 until the status stage is done.
    const ADDRESS_BEFORE_STATUS: bool;

    /// Loads one IN packet (possibly empty) and lets the host have it.
    fn ep0_send(&mut self, data: &'a [Cell<u8>]);

    /// Accepts one OUT packet, data or status.
    fn ep0_arm_out(&mut self);

    /// Moves the pending OUT packet of `len` bytes into `dst`, dropping
    /// whatever doesn't fit. Returns the number of bytes kept.
    fn ep0_read(&mut self, dst: &[Cell<u8>], len: usize) -> usize;

    /// STALLs both directions until the next SETUP.
    fn ep0_stall(&mut self);

    fn set_address(&mut self, addr: u8);
}

/// What the caller of a sequencer method must do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Next {
    /// Nothing; wait for the next interrupt.
    Wait,
    /// Call the class's SETUP handler with `request()` and `handler_data()`,
    /// then hand the result to `reply`.
    CallHandler,
    /// The status stage finished; tell the class.
    StatusDone,
}

pub struct Control<'a> {
    state: EpState,
    req: SetupPacket,
    xfer: Xfer,
    /// OUT data-stage bytes seen on the wire, including any that didn't fit
    /// in `buf`.
    received: usize,
    mps: usize,
    buf: &'a [Cell<u8>],
    address: u8,
    pending_address: Option<u8>,
}

impl<'a> Control<'a> {
    pub fn new() -> Self {
        Self {
            state: EpState::Unconfigured,
            req: SetupPacket::new(0, 0, 0, 0, 0),
            xfer: Xfer::default(),
            received: 0,
            mps: 0,
            buf: Default::default(),
            address: 0,
            pending_address: None,
        }
    }

    pub fn configure(&mut self, mps: usize, buf: &'a [Cell<u8>]) {
        self.mps = mps;
        self.buf = buf;
        self.state = EpState::Idle;
        self.xfer = Xfer::default();
    }

    /// Bus reset: back to address 0 and unconfigured.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> EpState {
        self.state
    }

    pub fn is_configured(&self) -> bool {
        self.state != EpState::Unconfigured
    }

    pub fn mps(&self) -> usize {
        self.mps
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn request(&self) -> SetupPacket {
        self.req
    }

    /// The buffer view the SETUP handler gets: the whole buffer for IN
    /// requests, the received bytes for OUT requests, nothing otherwise.
    pub fn handler_data(&self) -> &'a [Cell<u8>] {
        if self.req.length() == 0 {
            Default::default()
        } else if self.req.direction() == Direction::In {
            self.buf
        } else {
            &self.buf[..self.xfer.count]
        }
    }

    /// A SETUP packet arrived.
    pub fn setup<P: Ep0Port<'a>>(&mut self, port: &mut P, req: SetupPacket) -> Next {
        if self.state == EpState::Unconfigured {
            warn!("SETUP on unconfigured EP0: {:02x?}", zerocopy::AsBytes::as_bytes(&req));
            port.ep0_stall();
            return Next::Wait;
        }
        trace!(
            "SETUP rt={:02x} req={:02x} val={:04x} idx={:04x} len={}",
            req.request_type,
            req.request,
            req.value.get(),
            req.index.get(),
            req.length()
        );
        if !matches!(self.state, EpState::Idle | EpState::Stalled) {
            debug!("SETUP restarts control transfer in {:?}", self.state);
        }
        self.req = req;
        self.received = 0;
        self.pending_address = None;
        if req.direction() == Direction::Out && req.length() > 0 {
            self.xfer = Xfer::new(req.length().min(self.buf.len()), false);
            self.state = EpState::OutData;
            port.ep0_arm_out();
            Next::Wait
        } else {
            self.xfer = Xfer::default();
            self.state = EpState::Setup;
            Next::CallHandler
        }
    }

    /// Acts on the SETUP handler's verdict.
    pub fn reply<P: Ep0Port<'a>>(&mut self, port: &mut P, result: Result<usize, Stall>) {
        let n = match result {
            Ok(n) => n,
            Err(Stall) => {
                debug!("request {:02x} refused, stalling EP0", self.req.request);
                self.state = EpState::Stalled;
                port.ep0_stall();
                return;
            }
        };
        let req = self.req;
        if req.direction() == Direction::In && req.length() > 0 {
            let len = n.min(req.length()).min(self.buf.len());
            // A response shorter than the host asked for ends on a short
            // packet, which may have to be a ZLP.
            self.xfer = Xfer::new(len, len < req.length());
            self.state = EpState::Setup;
            let step = tx_advance(&mut self.state, &mut self.xfer, self.mps);
            self.load(port, step);
        } else {
            if req.standard_request() == Some(Request::SetAddress)
                && req.recipient() == Some(Recipient::Device)
            {
                let addr = (req.value.get() & 0x7F) as u8;
                if P::ADDRESS_BEFORE_STATUS {
                    self.commit_address(port, addr);
                } else {
                    self.pending_address = Some(addr);
                }
            }
            self.state = EpState::WaitStatusIn;
            port.ep0_send(Default::default());
        }
    }

    /// The host took the IN packet we loaded.
    pub fn in_complete<P: Ep0Port<'a>>(&mut self, port: &mut P) -> Next {
        match self.state {
            EpState::InData | EpState::InDataLast | EpState::InZlp => {
                let step = tx_advance(&mut self.state, &mut self.xfer, self.mps);
                self.load(port, step);
                Next::Wait
            }
            EpState::WaitStatusIn => {
                if let Some(addr) = self.pending_address.take() {
                    self.commit_address(port, addr);
                }
                self.state = EpState::Idle;
                Next::StatusDone
            }
            s => {
                debug!("EP0 IN complete in {:?}", s);
                Next::Wait
            }
        }
    }

    /// An OUT packet of `len` bytes is waiting for EP0.
    pub fn out_packet<P: Ep0Port<'a>>(&mut self, port: &mut P, len: usize) -> Next {
        match self.state {
            EpState::OutData => {
                let dst = &self.buf[self.xfer.count..self.xfer.len];
                let kept = port.ep0_read(dst, len);
                if kept < len {
                    warn!("control write overflows EP0 buffer, {} bytes dropped", len - kept);
                }
                self.xfer.count += kept;
                self.xfer.last = len;
                self.received += len;
                if len < self.mps || self.received >= self.req.length() {
                    self.state = EpState::OutDataLast;
                    Next::CallHandler
                } else {
                    port.ep0_arm_out();
                    Next::Wait
                }
            }
            // The host may end an IN data stage early by moving on to status.
            EpState::WaitStatusOut | EpState::InData | EpState::InDataLast | EpState::InZlp => {
                port.ep0_read(Default::default(), len);
                if len != 0 {
                    warn!("{}-byte EP0 status packet", len);
                }
                self.state = EpState::Idle;
                Next::StatusDone
            }
            s => {
                port.ep0_read(Default::default(), len);
                debug!("EP0 OUT({}) in {:?} dropped", len, s);
                Next::Wait
            }
        }
    }

    fn load<P: Ep0Port<'a>>(&mut self, port: &mut P, step: TxStep) {
        match step {
            TxStep::Packet { offset, len } => port.ep0_send(&self.buf[offset..offset + len]),
            TxStep::Zlp => port.ep0_send(Default::default()),
            TxStep::Done => {
                self.state = EpState::WaitStatusOut;
                port.ep0_arm_out();
            }
        }
    }

    fn commit_address<P: Ep0Port<'a>>(&mut self, port: &mut P, addr: u8) {
        debug!("address {}", addr);
        self.address = addr;
        port.set_address(addr);
    }
}

impl<'a> Default for Control<'a> {
    fn default() -> Self {
        Self::new()
    }
}
