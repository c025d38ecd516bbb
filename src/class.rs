// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The contract between a controller driver and the class driver above it.
//!
//! Class drivers see the controller only as a `&mut dyn UsbDev`, handed to
//! them in every callback. Callbacks run in interrupt context, synchronously,
//! from inside the driver's `isr`; they may call back into the controller
//! (to queue the next packet, drain a received one, configure endpoints after
//! `SET_CONFIGURATION`, and so on) but must not block.
//!
//! Transfer buffers are `&'a [Cell<u8>]` rather than `&'a mut [u8]` so that
//! the class can keep its own reference to a buffer it has lent to an
//! endpoint, and lend it again after every bus reset.

use core::cell::Cell;

use crate::descriptor::EndpointDescriptor;
use crate::endpoint::EpState;
use crate::error::{Result, Stall};
use crate::setup::{EpAddr, SetupPacket};

/// Endpoint control operations accepted by `UsbDev::ep_ctl`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EpCtl {
    /// Re-arm an OUT endpoint to accept the next packet.
    RecvOk,
    /// NAK everything on the endpoint until `NakClr`.
    NakSet,
    NakClr,
    /// Send a zero-length packet on an idle IN endpoint.
    ZlpSend,
    StallSet,
    /// Clear a STALL and reset the data toggle to DATA0.
    StallClr,
    /// Deactivate the endpoint; it must be `ep_init`ed again before use.
    Disable,
}

/// What happened on an endpoint whose handler is `EpHandler::Event`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EpEvent {
    /// An IN transfer finished.
    In,
    /// An OUT packet of this many bytes is waiting in packet memory.
    Out(usize),
}

/// Handles a control request. `data` is the EP0 buffer: for IN requests the
/// handler writes its response there and returns the length; for OUT
/// requests it holds the bytes received in the data stage; for requests with
/// no data stage it is empty.
pub type SetupFn<'a, C> =
    fn(&mut C, &mut dyn UsbDev<'a, C>, &SetupPacket, &'a [Cell<u8>]) -> core::result::Result<usize, Stall>;
/// An IN transfer queued with `ep_pkt_xmit` has been fully sent.
pub type InFn<'a, C> = fn(&mut C, &mut dyn UsbDev<'a, C>, EpAddr);
/// An OUT packet of the given length is ready for `ep_pkt_recv`.
pub type OutFn<'a, C> = fn(&mut C, &mut dyn UsbDev<'a, C>, EpAddr, usize);
pub type EventFn<'a, C> = fn(&mut C, &mut dyn UsbDev<'a, C>, EpAddr, EpEvent);

/// Per-endpoint callback, tagged by the role the endpoint plays.
pub enum EpHandler<'a, C> {
    /// Control endpoint (EP0).
    Setup(SetupFn<'a, C>),
    In(InFn<'a, C>),
    Out(OutFn<'a, C>),
    /// Gets both IN completions and OUT arrivals.
    Event(EventFn<'a, C>),
}

// Derived impls would require `C: Copy`, which a function pointer doesn't
// need.
impl<'a, C> Clone for EpHandler<'a, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, C> Copy for EpHandler<'a, C> {}

impl<'a, C> core::fmt::Debug for EpHandler<'a, C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let role = match self {
            EpHandler::Setup(_) => "Setup",
            EpHandler::In(_) => "In",
            EpHandler::Out(_) => "Out",
            EpHandler::Event(_) => "Event",
        };
        f.write_str(role)
    }
}

/// Device-level events delivered to the class driver.
pub trait Class<'a>: Sized {
    /// The host reset the bus. Every endpoint, EP0 included, is unconfigured
    /// at this point; the class is expected to `ep_init` EP0 again.
    fn on_reset(&mut self, dev: &mut dyn UsbDev<'a, Self>);

    fn on_suspend(&mut self, _dev: &mut dyn UsbDev<'a, Self>) {}

    fn on_wakeup(&mut self, _dev: &mut dyn UsbDev<'a, Self>) {}

    /// The status stage of a control transfer completed. This is the point
    /// at which the host considers the request done.
    fn on_status(&mut self, _dev: &mut dyn UsbDev<'a, Self>, _req: &SetupPacket) {}
}

/// The controller, as seen from a class driver.
pub trait UsbDev<'a, C> {
    /// Configures an endpoint from its descriptor and allocates packet
    /// memory for it. `buf` holds outgoing data for IN endpoints and control
    /// data for EP0; OUT endpoints may pass an empty slice.
    fn ep_init(
        &mut self,
        desc: &EndpointDescriptor,
        handler: EpHandler<'a, C>,
        buf: &'a [Cell<u8>],
    ) -> Result<EpAddr>;

    fn ep_ctl(&mut self, ep: EpAddr, op: EpCtl) -> Result<()>;

    /// Starts an IN transfer of `data`, copied into the endpoint's buffer.
    /// Returns the number of bytes accepted, which is less than `data.len()`
    /// if the buffer is smaller. Fails with `WouldBlock` if the previous
    /// transfer hasn't completed.
    fn ep_pkt_xmit(&mut self, ep: EpAddr, data: &[u8]) -> Result<usize>;

    /// Copies the pending OUT packet into `buf` and re-arms the endpoint.
    /// Bytes that don't fit are discarded. Returns 0 if nothing is pending.
    fn ep_pkt_recv(&mut self, ep: EpAddr, buf: &mut [u8]) -> Result<usize>;

    fn ep_state(&self, ep: EpAddr) -> Option<EpState>;

    /// Current device address.
    fn address(&self) -> u8;

    /// Presents the device on the bus.
    fn connect(&mut self);

    fn disconnect(&mut self);

    /// Signals remote wakeup to a suspended host.
    fn remote_wakeup(&mut self);
}

/// Views a byte buffer as cells, for lending to an endpoint.
pub fn cells(buf: &mut [u8]) -> &[Cell<u8>] {
    Cell::from_mut(buf).as_slice_of_cells()
}

/// Copies as much of `src` as fits into `dst`. Returns the count copied.
pub fn copy_to_cells(dst: &[Cell<u8>], src: &[u8]) -> usize {
    for (d, s) in dst.iter().zip(src) {
        d.set(*s);
    }
    dst.len().min(src.len())
}

/// Copies as much of `src` as fits into `dst`. Returns the count copied.
pub fn copy_from_cells(dst: &mut [u8], src: &[Cell<u8>]) -> usize {
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.get();
    }
    dst.len().min(src.len())
}
