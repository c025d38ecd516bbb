// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A register-level model of the USB_FS block and its packet memory, plus the
//! host side of the wire.
//!
//! Modelled: the toggle / clear-on-0 / read-write mix of EPnR, ISTR's CTR
//! summary, the buffer descriptor table, both PMA layouts, and how STAT, the
//! data toggles and double buffering decide whether the host gets data or a
//! handshake.

use std::cell::RefCell;
use std::collections::HashMap;

use stm32_usbdev::usb_fs::regs::*;
use stm32_usbdev::{PmaLayout, Regs};
use tock_registers::fields::Field;

use super::Handshake;

const ADDR_TX: usize = 0;
const COUNT_TX: usize = 2;
const ADDR_RX: usize = 4;
const COUNT_RX: usize = 6;

/// ISTR.DIR: the pending completion is OUT/SETUP.
const ISTR_DIR: u32 = 1 << 4;

struct State {
    epr: [u32; 8],
    istr: u32,
    regs: HashMap<usize, u32>,
    pma: Vec<u16>,
    writes: Vec<(usize, u32)>,
    /// Which of the two buffers each double-buffered packet used, per
    /// endpoint and direction (`[n][0]` OUT, `[n][1]` IN).
    buffers: [[Vec<u8>; 2]; 8],
}

impl State {
    fn stat_tx(&self, n: usize) -> Stat {
        stat(EPR::STAT_TX.read(self.epr[n]))
    }

    fn stat_rx(&self, n: usize) -> Stat {
        stat(EPR::STAT_RX.read(self.epr[n]))
    }

    fn is_double(&self, n: usize) -> bool {
        let v = self.epr[n];
        let ty = EPR::EP_TYPE.read(v);
        ty == EPR::EP_TYPE::Value::Iso as u32
            || (ty == EPR::EP_TYPE::Value::Bulk as u32 && EPR::EP_KIND.is_set(v))
    }

    fn bd(&self, n: usize, slot: usize) -> usize {
        let table = self.regs.get(&BTABLE).copied().unwrap_or(0) as usize;
        usize::from(self.pma[(table + n * 8 + slot) / 2])
    }

    fn set_count(&mut self, n: usize, slot: usize, len: usize) {
        let table = self.regs.get(&BTABLE).copied().unwrap_or(0) as usize;
        let i = (table + n * 8 + slot) / 2;
        self.pma[i] = (self.pma[i] & !0x3FF) | len as u16;
    }

    fn store(&mut self, at: usize, data: &[u8]) {
        for (i, pair) in data.chunks(2).enumerate() {
            let hi = pair.get(1).copied().unwrap_or(0);
            self.pma[at / 2 + i] = u16::from_le_bytes([pair[0], hi]);
        }
    }

    fn load(&self, at: usize, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.pma[(at + i) / 2].to_le_bytes()[(at + i) % 2])
            .collect()
    }

    fn flip(&mut self, n: usize, bit: Field<u32, EPR::Register>) {
        self.epr[n] ^= bit.mask << bit.shift;
    }

    fn set_stat_bits(&mut self, n: usize, field: Field<u32, EPR::Register>, s: Stat) {
        self.epr[n] = field.val(s as u32).modify(self.epr[n]);
    }
}

fn stat(v: u32) -> Stat {
    match v {
        0 => Stat::Disabled,
        1 => Stat::Stall,
        2 => Stat::Nak,
        _ => Stat::Valid,
    }
}

pub struct FsSim {
    st: RefCell<State>,
    layout: PmaLayout,
}

impl FsSim {
    pub fn new(pma_bytes: usize, layout: PmaLayout) -> Self {
        Self {
            st: RefCell::new(State {
                epr: [0; 8],
                istr: 0,
                regs: HashMap::new(),
                pma: vec![0; pma_bytes / 2],
                writes: Vec::new(),
                buffers: Default::default(),
            }),
            layout,
        }
    }

    pub fn pma(&self) -> PmaPort<'_> {
        PmaPort(self)
    }

    pub fn epr(&self, n: usize) -> u32 {
        self.st.borrow().epr[n]
    }

    pub fn reg(&self, off: usize) -> u32 {
        self.read(off)
    }

    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.st.borrow().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.st.borrow().writes.len()
    }

    /// Buffer index used by each double-buffered packet on endpoint `n`.
    pub fn buffers_used(&self, n: usize, is_in: bool) -> Vec<u8> {
        self.st.borrow().buffers[n][is_in as usize].clone()
    }

    pub fn pending(&self) -> bool {
        let cntr = self.st.borrow().regs.get(&CNTR).copied().unwrap_or(0);
        let istr = self.read(ISTR);
        // Each ISTR event bit lines up with its CNTR mask bit.
        istr & cntr & 0xFF00 != 0
    }

    pub fn bus_reset(&self) {
        let mut st = self.st.borrow_mut();
        st.istr |= ISTR::RESET::SET.value;
        for v in st.epr.iter_mut() {
            *v = (EPR::STAT_TX::CLEAR + EPR::STAT_RX::CLEAR).modify(*v);
        }
        st.regs.insert(DADDR, 0);
    }

    pub fn suspend(&self) {
        self.st.borrow_mut().istr |= ISTR::SUSP::SET.value;
    }

    pub fn wakeup(&self) {
        self.st.borrow_mut().istr |= ISTR::WKUP::SET.value;
    }

    /// The host sends a SETUP packet to EP0. It's accepted whatever STAT_RX
    /// says, as long as EP0 is a control endpoint.
    pub fn setup(&self, bytes: [u8; 8]) -> Handshake {
        let mut st = self.st.borrow_mut();
        let v = st.epr[0];
        if EPR::EP_TYPE.read(v) != EPR::EP_TYPE::Value::Control as u32
            || st.stat_rx(0) == Stat::Disabled
        {
            return Handshake::Nak;
        }
        let at = st.bd(0, ADDR_RX);
        st.store(at, &bytes);
        st.set_count(0, COUNT_RX, 8);
        st.epr[0] |= (EPR::CTR_RX::SET + EPR::SETUP::SET).value;
        st.set_stat_bits(0, EPR::STAT_RX, Stat::Nak);
        st.set_stat_bits(0, EPR::STAT_TX, Stat::Nak);
        Handshake::Ack(Vec::new())
    }

    /// The host sends an OUT packet to endpoint `n`.
    pub fn host_out(&self, n: usize, data: &[u8]) -> Handshake {
        let mut st = self.st.borrow_mut();
        match st.stat_rx(n) {
            Stat::Stall => return Handshake::Stall,
            Stat::Valid => {}
            _ => return Handshake::Nak,
        }
        if st.is_double(n) {
            let hw = EPR::DTOG_RX.is_set(st.epr[n]);
            let sw = EPR::DTOG_TX.is_set(st.epr[n]);
            if hw == sw {
                return Handshake::Nak;
            }
            let (addr, count) = if hw { (ADDR_RX, COUNT_RX) } else { (ADDR_TX, COUNT_TX) };
            let at = st.bd(n, addr);
            st.store(at, data);
            st.set_count(n, count, data.len());
            st.buffers[n][0].push(hw as u8);
            st.flip(n, EPR::DTOG_RX);
        } else {
            let at = st.bd(n, ADDR_RX);
            st.store(at, data);
            st.set_count(n, COUNT_RX, data.len());
            st.flip(n, EPR::DTOG_RX);
            st.set_stat_bits(n, EPR::STAT_RX, Stat::Nak);
        }
        st.epr[n] = (EPR::SETUP::CLEAR + EPR::CTR_RX::SET).modify(st.epr[n]);
        Handshake::Ack(Vec::new())
    }

    /// The host sends an IN token to endpoint `n`.
    pub fn host_in(&self, n: usize) -> Handshake {
        let mut st = self.st.borrow_mut();
        match st.stat_tx(n) {
            Stat::Stall => return Handshake::Stall,
            Stat::Valid => {}
            _ => return Handshake::Nak,
        }
        let pkt = if st.is_double(n) {
            let hw = EPR::DTOG_TX.is_set(st.epr[n]);
            let sw = EPR::DTOG_RX.is_set(st.epr[n]);
            if hw == sw {
                return Handshake::Nak;
            }
            let (addr, count) = if hw { (ADDR_RX, COUNT_RX) } else { (ADDR_TX, COUNT_TX) };
            let len = st.bd(n, count) & 0x3FF;
            let pkt = st.load(st.bd(n, addr), len);
            st.buffers[n][1].push(hw as u8);
            st.flip(n, EPR::DTOG_TX);
            pkt
        } else {
            let len = st.bd(n, COUNT_TX) & 0x3FF;
            let pkt = st.load(st.bd(n, ADDR_TX), len);
            st.flip(n, EPR::DTOG_TX);
            st.set_stat_bits(n, EPR::STAT_TX, Stat::Nak);
            pkt
        };
        st.epr[n] |= EPR::CTR_TX::SET.value;
        Handshake::Ack(pkt)
    }
}

impl Regs for FsSim {
    fn read(&self, off: usize) -> u32 {
        let st = self.st.borrow();
        match off {
            o if o < 0x20 => st.epr[o / 4],
            ISTR => {
                let mut v = st.istr;
                if let Some(n) = st.epr.iter().position(|e| e & EPR_CTR != 0) {
                    v |= (ISTR::CTR::SET + ISTR::EP_ID.val(n as u32)).value;
                    if EPR::CTR_RX.is_set(st.epr[n]) {
                        v |= ISTR_DIR;
                    }
                }
                v
            }
            o => st.regs.get(&o).copied().unwrap_or(0),
        }
    }

    fn write(&self, off: usize, w: u32) {
        let mut st = self.st.borrow_mut();
        st.writes.push((off, w));
        match off {
            o if o < 0x20 => {
                let n = o / 4;
                let old = st.epr[n];
                let toggled = (old ^ w) & EPR_TOGGLE;
                let ctr = old & w & EPR_CTR;
                let setup = old & EPR::SETUP::SET.value;
                st.epr[n] = (w & EPR_RW) | toggled | ctr | setup;
            }
            ISTR => st.istr &= w,
            o => {
                st.regs.insert(o, w);
            }
        }
    }
}

/// The CPU's view of packet memory.
pub struct PmaPort<'s>(&'s FsSim);

impl Regs for PmaPort<'_> {
    fn read(&self, off: usize) -> u32 {
        let st = self.0.st.borrow();
        match self.0.layout {
            PmaLayout::Pma2x16 => u32::from(st.pma[off / 4]),
            PmaLayout::Pma1x16 => {
                u32::from(st.pma[off / 2]) | u32::from(st.pma[off / 2 + 1]) << 16
            }
        }
    }

    fn write(&self, off: usize, value: u32) {
        let mut st = self.0.st.borrow_mut();
        match self.0.layout {
            PmaLayout::Pma2x16 => st.pma[off / 4] = value as u16,
            PmaLayout::Pma1x16 => {
                st.pma[off / 2] = value as u16;
                st.pma[off / 2 + 1] = (value >> 16) as u16;
            }
        }
    }
}
