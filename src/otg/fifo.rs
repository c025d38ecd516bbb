// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Packet FIFO management for the Synopsys core.
//!
//! The core has one shared receive FIFO and one transmit FIFO per IN
//! endpoint, all carved out of the same block of FIFO RAM. We hand the RAM
//! out with a bump allocator: the receive FIFO first, then transmit FIFOs in
//! the order endpoints are configured. Nothing is freed until bus reset.
//!
//! FIFO access is word-wide and little-endian. Transfers that aren't a
//! multiple of 4 bytes are padded on push; on pop, the padding in the final
//! word is read and thrown away, since the core counts words, not bytes.

use core::cell::Cell;

use log::{error, trace, warn};
use tock_registers::fields::{Field, FieldValue};

use super::regs::*;
use super::MAX_ENDPOINTS;
use crate::error::{Result, UsbError};
use crate::reg::{delay, Regs};

/// Smallest transmit FIFO the core accepts, in words.
const MIN_TX_WORDS: usize = 16;

/// Bounded wait for self-clearing reset/flush bits.
const SPIN_LIMIT: u32 = 100_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct TxFifo {
    start: usize,
    words: usize,
}

pub struct Fifo {
    depth: usize,
    cursor: usize,
    tx: [Option<TxFifo>; MAX_ENDPOINTS],
}

impl Fifo {
    /// FIFO RAM of `depth` 32-bit words.
    pub const fn new(depth: usize) -> Self {
        Self {
            depth,
            cursor: 0,
            tx: [None; MAX_ENDPOINTS],
        }
    }

    /// Releases every allocation and sizes the receive FIFO.
    pub fn reset<R: Regs>(&mut self, regs: &R, rx_words: usize) -> Result<()> {
        self.tx = [None; MAX_ENDPOINTS];
        self.cursor = 0;
        if rx_words > self.depth {
            warn!("rx fifo of {} words exceeds {}-word fifo ram", rx_words, self.depth);
            return Err(UsbError::PacketMemory);
        }
        regs.write(GRXFSIZ, rx_words as u32);
        self.cursor = rx_words;
        Ok(())
    }

    /// Words of FIFO RAM handed out so far.
    pub fn used(&self) -> usize {
        self.cursor
    }

    /// Gives IN endpoint `ep` a transmit FIFO big enough for one packet of
    /// `bytes`. Re-configuring an endpoint reuses its FIFO if that's big
    /// enough.
    pub fn alloc_tx<R: Regs>(&mut self, regs: &R, ep: usize, bytes: usize) -> Result<()> {
        let words = ((bytes + 3) / 4).max(MIN_TX_WORDS);
        if let Some(f) = self.tx[ep] {
            if f.words >= words {
                return Ok(());
            }
        }
        if self.cursor + words > self.depth {
            warn!(
                "no room for {}-word tx fifo on ep{} ({} of {} used)",
                words, ep, self.cursor, self.depth
            );
            return Err(UsbError::PacketMemory);
        }
        let f = TxFifo {
            start: self.cursor,
            words,
        };
        regs.write_fields(
            dieptxf(ep),
            DIEPTXF::DEPTH.val(words as u32) + DIEPTXF::START.val(f.start as u32),
        );
        trace!("ep{} tx fifo {}+{}", ep, f.start, f.words);
        self.tx[ep] = Some(f);
        self.cursor += words;
        Ok(())
    }

    /// Pushes as much of `src` into IN endpoint `ep`'s FIFO as there is room
    /// for, a whole word at a time. Returns the number of bytes pushed.
    pub fn push<R: Regs>(&self, regs: &R, ep: usize, src: &[Cell<u8>]) -> usize {
        let free = regs.extract::<DTXFSTS::Register>(dtxfsts(ep)).read(DTXFSTS::INEPTFSAV) as usize;
        let bytes = src.len().min(free * 4);
        for chunk in src[..bytes].chunks(4) {
            regs.write(fifo(ep), pack(chunk));
        }
        bytes
    }

    /// Pops an OUT packet of `len` bytes from the receive FIFO into `dst`.
    /// Whatever doesn't fit is still popped, so the FIFO stays in step, and
    /// discarded. Returns the number of bytes kept.
    pub fn pop<R: Regs>(&self, regs: &R, dst: &[Cell<u8>], len: usize) -> usize {
        let keep = len.min(dst.len());
        for (i, word) in (0..(len + 3) / 4).map(|_| regs.read(fifo(0))).enumerate() {
            for (j, b) in word.to_le_bytes().iter().enumerate() {
                if let Some(d) = dst[..keep].get(i * 4 + j) {
                    d.set(*b);
                }
            }
        }
        if keep < len {
            warn!("rx packet of {} bytes truncated to {}", len, keep);
        }
        keep
    }

    /// Flushes the transmit FIFO selected by `which`: one endpoint's, or
    /// all of them with `TXFNUM::All`.
    pub fn flush_tx<R: Regs>(&self, regs: &R, which: FieldValue<u32, GRSTCTL::Register>) {
        wait_idle(regs);
        regs.write_fields(GRSTCTL, GRSTCTL::TXFFLSH::SET + which);
        spin_clear(regs, GRSTCTL::TXFFLSH);
        // The core needs a few PHY clocks after the flush bit drops.
        delay(3);
    }

    pub fn flush_rx<R: Regs>(&self, regs: &R) {
        wait_idle(regs);
        regs.write_fields(GRSTCTL, GRSTCTL::RXFFLSH::SET);
        spin_clear(regs, GRSTCTL::RXFFLSH);
        delay(3);
    }
}

/// Packs up to 4 bytes into a FIFO word, zero-padded.
fn pack(chunk: &[Cell<u8>]) -> u32 {
    let mut b = [0u8; 4];
    for (d, s) in b.iter_mut().zip(chunk) {
        *d = s.get();
    }
    u32::from_le_bytes(b)
}

pub(crate) fn wait_idle<R: Regs>(regs: &R) {
    for _ in 0..SPIN_LIMIT {
        if regs.extract::<GRSTCTL::Register>(GRSTCTL).is_set(GRSTCTL::AHBIDL) {
            return;
        }
    }
    warn!("AHB master never went idle");
}

pub(crate) fn spin_clear<R: Regs>(regs: &R, bit: Field<u32, GRSTCTL::Register>) {
    for _ in 0..SPIN_LIMIT {
        if !regs.extract(GRSTCTL).is_set(bit) {
            return;
        }
    }
    error!("GRSTCTL bit {} stuck", bit.shift);
}
