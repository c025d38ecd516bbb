// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet memory (PMA) for the USB_FS block.
//!
//! The PMA is a small dual-ported SRAM holding every endpoint's packet
//! buffers plus the buffer descriptor table that tells the block where they
//! are. Addresses stored in the table are "USB local": byte offsets into the
//! PMA as the USB block sees it. How that maps onto the CPU bus depends on the
//! part:
//!
//! - [`PmaLayout::Pma2x16`] (F1, F3): each 16-bit halfword of PMA occupies
//!   a 32-bit slot on the CPU side, upper half unused.
//! - [`PmaLayout::Pma1x16`] (F0, L0): halfwords are packed, CPU offset and
//!   local address coincide.
//!
//! Either way the CPU only ever makes halfword accesses.
//!
//! The descriptor table sits at local address 0 and has a 4-halfword entry
//! per endpoint:
//!
//! ```text
//!   +0  ADDR_TX    (double-buffered: buffer 0 address)
//!   +2  COUNT_TX   (double-buffered: buffer 0 count)
//!   +4  ADDR_RX    (double-buffered: buffer 1 address)
//!   +6  COUNT_RX   (double-buffered: buffer 1 count)
//! ```
//!
//! Packet buffers are bump-allocated after the table and released all at once
//! on bus reset. Each endpoint direction remembers its buffer, so configuring
//! an endpoint again (a repeated `SET_CONFIGURATION`, say) reuses it rather
//! than taking more memory.

use core::cell::Cell;

use log::{trace, warn};
use tock_registers::register_bitfields;

use crate::error::{Result, UsbError};
use crate::reg::Regs;

/// Endpoints with a descriptor table entry.
pub const TABLE_ENTRIES: usize = 8;

/// Size of the descriptor table in bytes of local address space.
pub const TABLE_BYTES: usize = TABLE_ENTRIES * 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PmaLayout {
    Pma2x16,
    Pma1x16,
}

/// A slot in an endpoint's descriptor table entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum Slot {
    AddrTx = 0,
    CountTx = 2,
    AddrRx = 4,
    CountRx = 6,
}

impl Slot {
    /// Address and count slots of buffer `b` (0 or 1) of a double-buffered
    /// endpoint.
    pub fn double(b: bool) -> (Slot, Slot) {
        if b {
            (Slot::AddrRx, Slot::CountRx)
        } else {
            (Slot::AddrTx, Slot::CountTx)
        }
    }
}

register_bitfields![u16,
    /// COUNT_TX/COUNT_RX descriptor slots. Only COUNT_RX has the buffer size
    /// fields.
    pub BD_COUNT [
        COUNT OFFSET(0) NUMBITS(10) [],
        NUM_BLOCK OFFSET(10) NUMBITS(5) [],
        BL_SIZE OFFSET(15) NUMBITS(1) []
    ]
];

/// Encodes a receive buffer of at least `size` bytes as COUNT_RX's
/// BL_SIZE/NUM_BLOCK fields. Returns the encoding and the buffer size it
/// actually describes, which is what must be allocated.
///
/// Up to 62 bytes the block counts in 2-byte units; beyond that, in 32-byte
/// units with NUM_BLOCK holding one less than the count.
pub fn rx_count_encode(size: usize) -> (u16, usize) {
    if size <= 62 {
        let blocks = (size + 1) / 2;
        (BD_COUNT::NUM_BLOCK.val(blocks as u16).value, blocks * 2)
    } else {
        let blocks = (size + 31) / 32;
        let enc = BD_COUNT::BL_SIZE::SET + BD_COUNT::NUM_BLOCK.val((blocks - 1) as u16);
        (enc.value, blocks * 32)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Buf {
    at: u16,
    bytes: usize,
}

pub struct Pma {
    layout: PmaLayout,
    size: usize,
    cursor: usize,
    /// Buffers handed to each endpoint, OUT then IN.
    bufs: [[Option<Buf>; 2]; TABLE_ENTRIES],
}

impl Pma {
    /// `size` bytes of packet memory, in the given CPU-side layout.
    pub const fn new(size: usize, layout: PmaLayout) -> Self {
        Self {
            layout,
            size,
            cursor: TABLE_BYTES,
            bufs: [[None; 2]; TABLE_ENTRIES],
        }
    }

    /// Releases every packet buffer. The descriptor table stays put.
    pub fn reset(&mut self) {
        self.cursor = TABLE_BYTES;
        self.bufs = [[None; 2]; TABLE_ENTRIES];
    }

    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Reserves `bytes` of packet memory, rounded up to a halfword. Returns
    /// the local address.
    pub fn alloc(&mut self, bytes: usize) -> Result<u16> {
        let bytes = (bytes + 1) & !1;
        if self.cursor + bytes > self.size {
            warn!(
                "no room for {}-byte packet buffer ({} of {} used)",
                bytes, self.cursor, self.size
            );
            return Err(UsbError::PacketMemory);
        }
        let at = self.cursor;
        self.cursor += bytes;
        trace!("pma {}+{}", at, bytes);
        Ok(at as u16)
    }

    /// Packet memory for one direction of endpoint `ep`. If that direction
    /// already has a buffer of at least `bytes` it's handed back again.
    pub fn alloc_ep(&mut self, ep: usize, is_in: bool, bytes: usize) -> Result<u16> {
        let dir = usize::from(is_in);
        if let Some(b) = self.bufs[ep][dir] {
            if b.bytes >= bytes {
                return Ok(b.at);
            }
        }
        let at = self.alloc(bytes)?;
        self.bufs[ep][dir] = Some(Buf { at, bytes });
        Ok(at)
    }

    /// CPU-side offset of local address `a`.
    fn cpu(&self, a: usize) -> usize {
        match self.layout {
            PmaLayout::Pma2x16 => (a / 2) * 4,
            PmaLayout::Pma1x16 => a,
        }
    }

    pub fn read16<M: Regs>(&self, mem: &M, a: usize) -> u16 {
        mem.read16(self.cpu(a))
    }

    pub fn write16<M: Regs>(&self, mem: &M, a: usize, v: u16) {
        mem.write16(self.cpu(a), v)
    }

    /// Reads slot `s` of endpoint `ep`'s descriptor table entry.
    pub fn bd<M: Regs>(&self, mem: &M, ep: usize, s: Slot) -> u16 {
        self.read16(mem, ep * 8 + s as usize)
    }

    pub fn set_bd<M: Regs>(&self, mem: &M, ep: usize, s: Slot, v: u16) {
        self.write16(mem, ep * 8 + s as usize, v)
    }

    /// Copies `src` into packet memory at local address `a`.
    pub fn write<M: Regs>(&self, mem: &M, a: u16, src: &[Cell<u8>]) {
        for (i, pair) in src.chunks(2).enumerate() {
            let lo = pair[0].get();
            let hi = pair.get(1).map_or(0, Cell::get);
            self.write16(mem, a as usize + i * 2, u16::from_le_bytes([lo, hi]));
        }
    }

    /// Copies a `len`-byte packet at local address `a` into `dst`, dropping
    /// whatever doesn't fit. Returns the number of bytes kept.
    pub fn read<M: Regs>(&self, mem: &M, a: u16, dst: &[Cell<u8>], len: usize) -> usize {
        let keep = len.min(dst.len());
        for (i, pair) in dst[..keep].chunks(2).enumerate() {
            let [lo, hi] = self.read16(mem, a as usize + i * 2).to_le_bytes();
            pair[0].set(lo);
            if let Some(d) = pair.get(1) {
                d.set(hi);
            }
        }
        if keep < len {
            warn!("rx packet of {} bytes truncated to {}", len, keep);
        }
        keep
    }
}
