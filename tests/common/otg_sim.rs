// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A register-level model of the OTG core in device mode, plus the host side
//! of the wire.
//!
//! Modelled: write-1-to-clear interrupt registers, the DAINT/GINTSTS summary
//! bits, the receive status queue with its data, per-endpoint transmit
//! FIFOs sized from DIEPTXFx, and the effect of SNAK/CNAK/EPDIS/EPENA/STALL
//! on whether the host gets data or a handshake. Timing isn't, except that a
//! test can pinch the free space the transmit FIFOs report and decide when
//! the core takes the words already pushed.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};

use stm32_usbdev::otg::regs::*;
use stm32_usbdev::Regs;

use super::Handshake;

struct RxEntry {
    status: u32,
    words: Vec<u32>,
}

#[derive(Default)]
struct State {
    regs: HashMap<usize, u32>,
    gintsts: u32,
    diepint: [u32; 8],
    doepint: [u32; 8],
    nak_in: [bool; 8],
    nak_out: [bool; 8],
    rx: VecDeque<RxEntry>,
    /// Data words of the entry whose status was popped last.
    popped: VecDeque<u32>,
    tx: [Vec<u8>; 8],
    /// Words still sitting in each transmit FIFO.
    tx_level: [usize; 8],
    tx_space_cap: Option<u32>,
    writes: Vec<(usize, u32)>,
}

impl State {
    fn reg(&self, off: usize) -> u32 {
        *self.regs.get(&off).unwrap_or(&0)
    }

    fn daint(&self) -> u32 {
        let mut v = 0;
        let emp = self.reg(DIEPEMPMSK);
        for n in 0..8 {
            let mut mask = self.reg(DIEPMSK);
            if emp & (1 << n) != 0 {
                mask |= DIEPINT::TXFE::SET.value;
            }
            if self.diepint_of(n) & mask != 0 {
                v |= 1 << n;
            }
            if self.doepint[n] & self.reg(DOEPMSK) != 0 {
                v |= 1 << (16 + n);
            }
        }
        v
    }

    fn diepint_of(&self, n: usize) -> u32 {
        let txfe = if self.tx_level[n] == 0 {
            DIEPINT::TXFE::SET.value
        } else {
            0
        };
        self.diepint[n] | txfe
    }

    fn gintsts(&self) -> u32 {
        let daint = self.daint() & self.reg(DAINTMSK);
        let mut v = self.gintsts;
        if daint & 0xFFFF != 0 {
            v |= GINT::IEPINT::SET.value;
        }
        if daint >> 16 != 0 {
            v |= GINT::OEPINT::SET.value;
        }
        if !self.rx.is_empty() {
            v |= GINT::RXFLVL::SET.value;
        }
        v
    }

    fn tx_free_words(&self, n: usize) -> u32 {
        let depth = DIEPTXF::DEPTH.read(self.reg(dieptxf(n))) as usize;
        let free = depth.saturating_sub(self.tx_level[n]) as u32;
        self.tx_space_cap.map_or(free, |cap| free.min(cap))
    }

    fn write_ctl(&mut self, off: usize, n: usize, is_in: bool, w: u32) {
        let nak = if is_in { &mut self.nak_in[n] } else { &mut self.nak_out[n] };
        if DEPCTL::CNAK.is_set(w) {
            *nak = false;
        }
        if DEPCTL::SNAK.is_set(w) {
            *nak = true;
        }
        // The command bits read back as zero.
        let mut v = (DEPCTL::CNAK::CLEAR
            + DEPCTL::SNAK::CLEAR
            + DEPCTL::SD0PID::CLEAR
            + DEPCTL::SODDFRM::CLEAR)
            .modify(w);
        if DEPCTL::EPDIS.is_set(v) {
            v = (DEPCTL::EPDIS::CLEAR + DEPCTL::EPENA::CLEAR).modify(v);
            if is_in {
                self.diepint[n] |= DIEPINT::EPDISD::SET.value;
            } else {
                self.doepint[n] |= DOEPINT::EPDISD::SET.value;
            }
        }
        let naksts = if *nak {
            DEPCTL::NAKSTS::SET
        } else {
            DEPCTL::NAKSTS::CLEAR
        };
        self.regs.insert(off, naksts.modify(v));
    }

    fn pop_status(&mut self) -> u32 {
        let Some(e) = self.rx.pop_front() else {
            return 0;
        };
        self.popped = e.words.into();
        let n = GRXSTS::EPNUM.read(e.status) as usize;
        let pktsts = e.status & (GRXSTS::PKTSTS.mask << GRXSTS::PKTSTS.shift);
        match pktsts {
            s if s == GRXSTS::PKTSTS::OutComplete.value => {
                self.doepint[n] |= DOEPINT::XFRC::SET.value;
                let v = DEPCTL::EPENA::CLEAR.modify(self.reg(doepctl(n)));
                self.regs.insert(doepctl(n), v);
            }
            s if s == GRXSTS::PKTSTS::SetupComplete.value => {
                self.doepint[0] |= DOEPINT::STUP::SET.value;
                let v = (DEPCTL::EPENA::CLEAR + DEPCTL::STALL::CLEAR).modify(self.reg(doepctl(0)));
                self.regs.insert(doepctl(0), v);
                let v = DEPCTL::STALL::CLEAR.modify(self.reg(diepctl(0)));
                self.regs.insert(diepctl(0), v);
            }
            _ => {}
        }
        e.status
    }
}

#[derive(Default)]
pub struct OtgSim {
    st: RefCell<State>,
}

impl Regs for OtgSim {
    fn read(&self, off: usize) -> u32 {
        let mut st = self.st.borrow_mut();
        match off {
            GINTSTS => st.gintsts(),
            GRSTCTL => GRSTCTL::AHBIDL::SET.value,
            GRXSTSP => st.pop_status(),
            DAINT => st.daint(),
            CID => 0x0000_2000,
            o if o == fifo(0) => st.popped.pop_front().unwrap_or(0),
            o if (0x908..0x908 + 8 * 0x20).contains(&o) && (o - 0x908) % 0x20 == 0 => {
                st.diepint_of((o - 0x908) / 0x20)
            }
            o if (0xB08..0xB08 + 8 * 0x20).contains(&o) && (o - 0xB08) % 0x20 == 0 => {
                st.doepint[(o - 0xB08) / 0x20]
            }
            o if (0x918..0x918 + 8 * 0x20).contains(&o) && (o - 0x918) % 0x20 == 0 => {
                st.tx_free_words((o - 0x918) / 0x20)
            }
            o => st.reg(o),
        }
    }

    fn write(&self, off: usize, value: u32) {
        let mut st = self.st.borrow_mut();
        st.writes.push((off, value));
        match off {
            GINTSTS => st.gintsts &= !value,
            GRSTCTL => {}
            o if (0x1000..0x9000).contains(&o) => {
                let n = o / 0x1000 - 1;
                st.tx[n].extend_from_slice(&value.to_le_bytes());
                st.tx_level[n] += 1;
            }
            o if (0x900..0x900 + 8 * 0x20).contains(&o) && (o - 0x900) % 0x20 == 0 => {
                st.write_ctl(o, (o - 0x900) / 0x20, true, value)
            }
            o if (0xB00..0xB00 + 8 * 0x20).contains(&o) && (o - 0xB00) % 0x20 == 0 => {
                st.write_ctl(o, (o - 0xB00) / 0x20, false, value)
            }
            o if (0x908..0x908 + 8 * 0x20).contains(&o) && (o - 0x908) % 0x20 == 0 => {
                st.diepint[(o - 0x908) / 0x20] &= !value
            }
            o if (0xB08..0xB08 + 8 * 0x20).contains(&o) && (o - 0xB08) % 0x20 == 0 => {
                st.doepint[(o - 0xB08) / 0x20] &= !value
            }
            o => {
                st.regs.insert(o, value);
            }
        }
    }
}

impl OtgSim {
    pub fn reg(&self, off: usize) -> u32 {
        self.st.borrow().reg(off)
    }

    /// Every register write so far, in order.
    pub fn writes(&self) -> Vec<(usize, u32)> {
        self.st.borrow().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.st.borrow().writes.len()
    }

    /// Interrupts the driver would see.
    pub fn pending(&self) -> bool {
        let st = self.st.borrow();
        st.gintsts() & st.reg(GINTMSK) != 0
    }

    pub fn bus_reset(&self) {
        self.st.borrow_mut().gintsts |= GINT::USBRST::SET.value;
    }

    pub fn enum_done(&self) {
        self.st.borrow_mut().gintsts |= GINT::ENUMDNE::SET.value;
    }

    pub fn suspend(&self) {
        let mut st = self.st.borrow_mut();
        st.gintsts |= GINT::USBSUSP::SET.value;
        let v = st.reg(DSTS) | DSTS::SUSPSTS::SET.value;
        st.regs.insert(DSTS, v);
    }

    /// Caps the free space every transmit FIFO reports, in words.
    pub fn limit_tx_space(&self, words: u32) {
        self.st.borrow_mut().tx_space_cap = Some(words);
    }

    /// The core moves what has been pushed for `ep` out of the FIFO, which
    /// leaves it empty and raises TXFE.
    pub fn take_tx(&self, ep: usize) {
        self.st.borrow_mut().tx_level[ep] = 0;
    }

    pub fn setup(&self, bytes: [u8; 8]) {
        let mut st = self.st.borrow_mut();
        st.rx.push_back(RxEntry {
            status: (GRXSTS::PKTSTS::SetupData + GRXSTS::BCNT.val(8)).value,
            words: words(&bytes),
        });
        st.rx.push_back(RxEntry {
            status: GRXSTS::PKTSTS::SetupComplete.value,
            words: Vec::new(),
        });
    }

    /// The host sends an OUT packet. Returns the handshake it gets back.
    pub fn host_out(&self, ep: usize, data: &[u8]) -> Handshake {
        let mut st = self.st.borrow_mut();
        let ctl = st.reg(doepctl(ep));
        if DEPCTL::STALL.is_set(ctl) {
            return Handshake::Stall;
        }
        // The core NAKs once the programmed packet count is used up, even
        // before the endpoint is disabled.
        let tsiz = st.reg(doeptsiz(ep));
        let pktcnt = DEPTSIZ::PKTCNT.read(tsiz);
        if !DEPCTL::EPENA.is_set(ctl) || st.nak_out[ep] || pktcnt == 0 {
            return Handshake::Nak;
        }
        st.regs
            .insert(doeptsiz(ep), DEPTSIZ::PKTCNT.val(pktcnt - 1).modify(tsiz));
        let epnum = GRXSTS::EPNUM.val(ep as u32);
        st.rx.push_back(RxEntry {
            status: (epnum + GRXSTS::PKTSTS::OutData + GRXSTS::BCNT.val(data.len() as u32))
                .value,
            words: words(data),
        });
        st.rx.push_back(RxEntry {
            status: (epnum + GRXSTS::PKTSTS::OutComplete).value,
            words: Vec::new(),
        });
        Handshake::Ack(Vec::new())
    }

    /// The host sends an IN token. A full packet must be in the FIFO.
    pub fn host_in(&self, ep: usize) -> Handshake {
        let mut st = self.st.borrow_mut();
        let ctl = st.reg(diepctl(ep));
        if DEPCTL::STALL.is_set(ctl) {
            return Handshake::Stall;
        }
        let size = DEPTSIZ::XFRSIZ.read(st.reg(dieptsiz(ep))) as usize;
        if !DEPCTL::EPENA.is_set(ctl) || st.nak_in[ep] || st.tx[ep].len() < size {
            return Handshake::Nak;
        }
        let padded = (size + 3) / 4 * 4;
        let pkt: Vec<u8> = st.tx[ep].drain(..padded).take(size).collect();
        st.tx_level[ep] = st.tx_level[ep].saturating_sub(padded / 4);
        st.diepint[ep] |= DIEPINT::XFRC::SET.value;
        st.regs.insert(diepctl(ep), DEPCTL::EPENA::CLEAR.modify(ctl));
        Handshake::Ack(pkt)
    }
}

fn words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|c| {
            let mut b = [0u8; 4];
            b[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(b)
        })
        .collect()
}
