// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Things that can go wrong when a class driver talks to the controller.
///
/// Protocol-level errors (CRC, bit stuffing, timeouts) never show up here: the
/// host retries those on its own and the dispatcher only logs them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UsbError {
    /// The endpoint address is out of range for this controller, or names an
    /// endpoint that isn't configured.
    InvalidEndpoint,
    /// The endpoint is busy with a previous transfer. Retry after the
    /// completion callback.
    WouldBlock,
    /// The operation doesn't make sense in the endpoint's current state, e.g.
    /// transmitting on an OUT endpoint.
    InvalidState,
    /// Configuring the endpoint would overrun the controller's packet memory.
    PacketMemory,
    /// The endpoint's transfer buffer can't hold even one packet.
    BufferOverflow,
}

pub type Result<T> = core::result::Result<T, UsbError>;

/// Returned by a class driver's SETUP handler to refuse a control request. The
/// control sequencer answers with a STALL handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Stall;
