// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Controller-independent endpoint bookkeeping.
//!
//! Nothing in here touches hardware. The controller drivers ask an
//! [`Endpoint`] what to do next (load a packet, load a zero-length packet,
//! report completion) and then do it with their own registers. That keeps the
//! transfer-splitting and ZLP rules in one place for both controller families.

use core::cell::Cell;

use crate::class::{copy_to_cells, EpHandler};
use crate::error::{Result, UsbError};
use crate::setup::{EpAddr, TransferType};

/// Where an endpoint is in its transfer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EpState {
    /// Not configured since the last bus reset, or disabled.
    Unconfigured,
    Idle,
    Stalled,
    /// EP0 only: a SETUP packet has arrived and not been answered yet.
    Setup,
    /// An IN packet is loaded and more data follows it.
    InData,
    /// The last data packet of an IN transfer is loaded.
    InDataLast,
    /// A terminating zero-length packet is loaded.
    InZlp,
    /// EP0 only: our zero-length status packet is loaded.
    WaitStatusIn,
    /// EP0 only: IN data is done, waiting for the host's zero-length OUT.
    WaitStatusOut,
    /// An OUT packet is in packet memory and the class hasn't drained it.
    OutData,
    /// As `OutData`, for the final packet of a control write.
    OutDataLast,
}

/// Progress through one transfer buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Xfer {
    /// Total bytes in the transfer.
    pub len: usize,
    /// Bytes handed to the hardware (IN) or received (OUT) so far.
    pub count: usize,
    /// Size of the packet most recently loaded.
    pub last: usize,
    /// End with a zero-length packet if the last data packet is full.
    pub zlp: bool,
}

impl Xfer {
    pub const fn new(len: usize, zlp: bool) -> Self {
        Self {
            len,
            count: 0,
            last: 0,
            zlp,
        }
    }

    pub fn remaining(&self) -> usize {
        self.len - self.count
    }

    /// Claims the next packet of at most `mps` bytes. Returns its offset and
    /// length within the transfer buffer.
    fn next_packet(&mut self, mps: usize) -> (usize, usize) {
        let offset = self.count;
        let n = self.remaining().min(mps);
        self.count += n;
        self.last = n;
        (offset, n)
    }
}

/// What the driver should load into the IN pipe next.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TxStep {
    /// `len` bytes starting at `offset` in the transfer buffer.
    Packet { offset: usize, len: usize },
    Zlp,
    /// The transfer is finished.
    Done,
}

/// Advances an IN transfer after the previous packet (if any) went out.
///
/// Call it once to load the first packet, with `state` in `Idle` (or `Setup`
/// for EP0), and again on every IN completion. On `Done`, `state` is left as
/// it was, so the caller picks the follow-on state.
pub(crate) fn tx_advance(state: &mut EpState, xfer: &mut Xfer, mps: usize) -> TxStep {
    match *state {
        EpState::Idle | EpState::Setup if xfer.len == 0 => {
            *state = EpState::InZlp;
            TxStep::Zlp
        }
        EpState::Idle | EpState::Setup | EpState::InData => {
            let (offset, len) = xfer.next_packet(mps);
            *state = if xfer.remaining() == 0 {
                EpState::InDataLast
            } else {
                EpState::InData
            };
            TxStep::Packet { offset, len }
        }
        EpState::InDataLast if xfer.zlp && xfer.last == mps => {
            *state = EpState::InZlp;
            TxStep::Zlp
        }
        _ => TxStep::Done,
    }
}

/// One direction of one non-control endpoint.
pub struct Endpoint<'a, C> {
    pub addr: EpAddr,
    pub ty: TransferType,
    pub mps: usize,
    pub state: EpState,
    pub xfer: Xfer,
    /// Source of IN transfers.
    pub buf: &'a [Cell<u8>],
    /// Length of the OUT packet waiting to be drained.
    pub rx_pending: usize,
    /// Held off by `EpCtl::NakSet`: an OUT endpoint isn't re-armed after a
    /// packet is drained until the class clears it.
    pub nak: bool,
    pub handler: Option<EpHandler<'a, C>>,
}

impl<'a, C> Endpoint<'a, C> {
    pub fn new() -> Self {
        Self {
            addr: EpAddr(0),
            ty: TransferType::Bulk,
            mps: 0,
            state: EpState::Unconfigured,
            xfer: Xfer::new(0, false),
            buf: Default::default(),
            rx_pending: 0,
            nak: false,
            handler: None,
        }
    }

    pub fn configure(
        &mut self,
        addr: EpAddr,
        ty: TransferType,
        mps: usize,
        handler: EpHandler<'a, C>,
        buf: &'a [Cell<u8>],
    ) {
        *self = Self {
            addr,
            ty,
            mps,
            state: EpState::Idle,
            xfer: Xfer::new(0, false),
            buf,
            rx_pending: 0,
            nak: false,
            handler: Some(handler),
        };
    }

    /// Back to the power-on state. The handler is dropped too; the class
    /// supplies it again on the next `ep_init`.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn is_configured(&self) -> bool {
        self.state != EpState::Unconfigured
    }

    /// Copies `data` into the transfer buffer and starts an IN transfer.
    /// Returns the number of bytes accepted and the first step to load.
    pub fn xmit(&mut self, data: &[u8]) -> Result<(usize, TxStep)> {
        match self.state {
            EpState::Idle => {}
            EpState::Unconfigured => return Err(UsbError::InvalidEndpoint),
            EpState::Stalled => return Err(UsbError::InvalidState),
            _ => return Err(UsbError::WouldBlock),
        }
        if !self.addr.is_in() {
            return Err(UsbError::InvalidState);
        }
        if !data.is_empty() && self.buf.is_empty() {
            return Err(UsbError::BufferOverflow);
        }
        let n = copy_to_cells(self.buf, data);
        // Isochronous transfers have no handshake to end, so no ZLP.
        self.xfer = Xfer::new(n, self.ty != TransferType::Isochronous);
        let step = tx_advance(&mut self.state, &mut self.xfer, self.mps);
        Ok((n, step))
    }

    /// A queued zero-length packet, for `EpCtl::ZlpSend`.
    pub fn xmit_zlp(&mut self) -> Result<TxStep> {
        self.xmit(&[]).map(|(_, step)| step)
    }

    /// The previously loaded IN packet was taken by the host. Returns `None`
    /// if no transfer was in flight.
    pub fn tx_complete(&mut self) -> Option<TxStep> {
        if !matches!(self.state, EpState::InData | EpState::InDataLast | EpState::InZlp) {
            return None;
        }
        let step = tx_advance(&mut self.state, &mut self.xfer, self.mps);
        if step == TxStep::Done {
            self.state = EpState::Idle;
        }
        Some(step)
    }

    /// The bytes of a packet chosen by `TxStep::Packet`.
    pub fn packet(&self, offset: usize, len: usize) -> &'a [Cell<u8>] {
        &self.buf[offset..offset + len]
    }

    /// An OUT packet of `len` bytes has landed in packet memory.
    pub fn rx_packet(&mut self, len: usize) {
        self.rx_pending = len;
        self.state = EpState::OutData;
    }

    /// The pending OUT packet was drained.
    pub fn rx_drained(&mut self) {
        self.rx_pending = 0;
        if matches!(self.state, EpState::OutData | EpState::OutDataLast) {
            self.state = EpState::Idle;
        }
    }

    pub fn has_rx_pending(&self) -> bool {
        matches!(self.state, EpState::OutData | EpState::OutDataLast)
    }

    pub fn stall(&mut self) {
        self.state = EpState::Stalled;
        self.xfer = Xfer::default();
        self.rx_pending = 0;
    }

    pub fn unstall(&mut self) {
        if self.state == EpState::Stalled {
            self.state = EpState::Idle;
        }
    }
}

impl<'a, C> Default for Endpoint<'a, C> {
    fn default() -> Self {
        Self::new()
    }
}
