// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB_FS register map (STM32F1/F3/F0/L0 device-only block).
//!
//! The endpoint registers are the awkward part. Each `EPnR` mixes three kinds
//! of bit:
//!
//! - plain read/write (address, type, kind),
//! - toggle-on-write-1 (`STAT_TX`, `STAT_RX`, `DTOG_TX`, `DTOG_RX`),
//! - clear-on-write-0 (`CTR_TX`, `CTR_RX`).
//!
//! so a naive read-modify-write flips whatever toggles happened to be set and
//! clears completion flags that arrived in between. Every write goes through
//! the helpers at the bottom of this file, which start from [`epr_keep`]: the
//! value that, written back, changes nothing.

use tock_registers::fields::{Field, FieldValue};
use tock_registers::register_bitfields;

use crate::reg::Regs;

pub const fn epr(n: usize) -> usize {
    n * 4
}

pub const CNTR: usize = 0x40;
pub const ISTR: usize = 0x44;
pub const DADDR: usize = 0x4C;
pub const BTABLE: usize = 0x50;
/// Battery charging detector register, which holds the D+ pull-up on parts
/// that have one built in.
pub const BCDR: usize = 0x58;

register_bitfields![u32,
    pub EPR [
        EA OFFSET(0) NUMBITS(4) [],
        STAT_TX OFFSET(4) NUMBITS(2) [],
        DTOG_TX OFFSET(6) NUMBITS(1) [],
        CTR_TX OFFSET(7) NUMBITS(1) [],
        /// DBL_BUF for bulk endpoints, STATUS_OUT for control.
        EP_KIND OFFSET(8) NUMBITS(1) [],
        EP_TYPE OFFSET(9) NUMBITS(2) [
            Bulk = 0,
            Control = 1,
            Iso = 2,
            Interrupt = 3
        ],
        SETUP OFFSET(11) NUMBITS(1) [],
        STAT_RX OFFSET(12) NUMBITS(2) [],
        DTOG_RX OFFSET(14) NUMBITS(1) [],
        CTR_RX OFFSET(15) NUMBITS(1) []
    ],
    pub CNTR [
        FRES OFFSET(0) NUMBITS(1) [],
        LPMODE OFFSET(2) NUMBITS(1) [],
        FSUSP OFFSET(3) NUMBITS(1) [],
        RESUME OFFSET(4) NUMBITS(1) [],
        RESETM OFFSET(10) NUMBITS(1) [],
        SUSPM OFFSET(11) NUMBITS(1) [],
        WKUPM OFFSET(12) NUMBITS(1) [],
        ERRM OFFSET(13) NUMBITS(1) [],
        PMAOVRM OFFSET(14) NUMBITS(1) [],
        CTRM OFFSET(15) NUMBITS(1) []
    ],
    /// ISTR flags are cleared by writing 0; writing 1 leaves them alone.
    pub ISTR [
        EP_ID OFFSET(0) NUMBITS(4) [],
        ESOF OFFSET(8) NUMBITS(1) [],
        SOF OFFSET(9) NUMBITS(1) [],
        RESET OFFSET(10) NUMBITS(1) [],
        SUSP OFFSET(11) NUMBITS(1) [],
        WKUP OFFSET(12) NUMBITS(1) [],
        ERR OFFSET(13) NUMBITS(1) [],
        PMAOVR OFFSET(14) NUMBITS(1) [],
        CTR OFFSET(15) NUMBITS(1) []
    ],
    pub DADDR [
        ADD OFFSET(0) NUMBITS(7) [],
        EF OFFSET(7) NUMBITS(1) []
    ],
    pub BCDR [
        DPPU OFFSET(15) NUMBITS(1) []
    ]
];

/// A field of EPnR in register position.
const fn bits(f: Field<u32, EPR::Register>) -> u32 {
    f.mask << f.shift
}

/// Plain read/write bits of EPnR.
pub const EPR_RW: u32 = bits(EPR::EA) | bits(EPR::EP_KIND) | bits(EPR::EP_TYPE);
/// Bits that flip when written 1.
pub const EPR_TOGGLE: u32 =
    bits(EPR::STAT_TX) | bits(EPR::DTOG_TX) | bits(EPR::STAT_RX) | bits(EPR::DTOG_RX);
/// Bits that clear when written 0.
pub const EPR_CTR: u32 = bits(EPR::CTR_TX) | bits(EPR::CTR_RX);

/// Endpoint status, as found in `STAT_TX`/`STAT_RX`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Stat {
    Disabled = 0,
    Stall = 1,
    Nak = 2,
    Valid = 3,
}

/// The write value that leaves `EPnR` exactly as `cur` found it: read/write
/// bits as they are, toggles written 0, completion flags written 1.
pub const fn epr_keep(cur: u32) -> u32 {
    (cur & EPR_RW) | EPR_CTR
}

fn stat_toggle(field: Field<u32, EPR::Register>, cur: u32, stat: Stat) -> u32 {
    field.val(field.read(cur) ^ stat as u32).value
}

pub fn set_stat_tx<R: Regs>(r: &R, n: usize, stat: Stat) {
    let cur = r.read(epr(n));
    r.write(epr(n), epr_keep(cur) | stat_toggle(EPR::STAT_TX, cur, stat));
}

pub fn set_stat_rx<R: Regs>(r: &R, n: usize, stat: Stat) {
    let cur = r.read(epr(n));
    r.write(epr(n), epr_keep(cur) | stat_toggle(EPR::STAT_RX, cur, stat));
}

/// Drives the toggle bits named in `want` (`DTOG_TX` and/or `DTOG_RX`) to
/// the values it gives them.
pub fn set_dtog<R: Regs>(r: &R, n: usize, want: FieldValue<u32, EPR::Register>) {
    let cur = r.read(epr(n));
    let flip = (cur ^ want.value) & want.mask();
    if flip != 0 {
        r.write(epr(n), epr_keep(cur) | flip);
    }
}

/// Flips a toggle bit. Used to hand a double buffer over.
pub fn flip_dtog<R: Regs>(r: &R, n: usize, dtog: Field<u32, EPR::Register>) {
    let cur = r.read(epr(n));
    r.write(epr(n), epr_keep(cur) | bits(dtog));
}

/// Acknowledges one of the completion flags.
pub fn clear_ctr<R: Regs>(r: &R, n: usize, ctr: Field<u32, EPR::Register>) {
    let cur = r.read(epr(n));
    r.write(epr(n), epr_keep(cur) & !bits(ctr));
}

/// Acknowledges the ISTR flags in `flags`, leaving any others that came up
/// in the meantime pending.
pub fn ack_istr<R: Regs>(r: &R, flags: FieldValue<u32, ISTR::Register>) {
    r.write(ISTR, !flags.value);
}
