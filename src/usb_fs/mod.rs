// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device driver for the USB_FS block of STM32F1/F3/F0/L0 parts.
//!
//! # Data flow
//!
//! Unlike the OTG core there are no FIFOs. Each endpoint has packet buffers
//! in PMA, located through the buffer descriptor table, and the hardware
//! moves whole packets between them and the wire on its own. Completion of
//! either direction raises CTR, with ISTR naming the endpoint; the per-
//! endpoint `CTR_TX`/`CTR_RX` flags say which half finished.
//!
//! After a completed transfer the hardware sets that direction to NAK, so
//! single-buffered endpoints are explicitly handed back (`STAT = VALID`)
//! each time a packet has been loaded or drained.
//!
//! Double-buffered endpoints (isochronous ones always, bulk ones when asked
//! for in [`UsbFsConfig::double_buffered`]) use both descriptor slots as
//! two buffers of one direction and stay VALID. Ownership of the buffers is
//! tracked with the toggle bits instead:
//!
//! - IN: the hardware sends from buffer `DTOG_TX`; software fills buffer
//!   `SW_BUF` (the `DTOG_RX` bit) and flips it. The hardware NAKs while the
//!   two point at the same buffer, i.e. while nothing new has been loaded.
//! - OUT: the hardware receives into buffer `DTOG_RX`; software reads buffer
//!   `!SW_BUF` (`SW_BUF` is the `DTOG_TX` bit) and flips it. The endpoint
//!   starts with `SW_BUF = 1` so that buffer 0 is the hardware's.

pub mod pma;
pub mod regs;

use core::cell::Cell;

use log::{debug, info, trace, warn};
use tock_registers::fields::FieldValue;

use self::pma::{rx_count_encode, Pma, PmaLayout, Slot, BD_COUNT, TABLE_BYTES, TABLE_ENTRIES};
use self::regs::*;
use crate::class::{cells, Class, EpCtl, EpEvent, EpHandler, SetupFn, UsbDev};
use crate::control::{Control, Ep0Port, Next};
use crate::descriptor::EndpointDescriptor;
use crate::endpoint::{EpState, Endpoint, TxStep};
use crate::error::{Result, Stall, UsbError};
use crate::reg::{delay, Mmio, Regs};
use crate::setup::{EpAddr, SetupPacket, TransferType};

pub const ENDPOINT_COUNT: usize = TABLE_ENTRIES;

/// USB_FS register block on F1/F3/F0/L0.
pub const BASE: usize = 0x4000_5C00;
/// Packet memory, as seen from the CPU.
pub const PMA_BASE: usize = 0x4000_6000;

/// Transceiver startup time, about 1us at 72MHz.
const STARTUP_CYCLES: u32 = 72;

/// Roughly 5ms at 72MHz, within the 1-15ms remote wakeup window.
const REMOTE_WAKEUP_CYCLES: u32 = 360_000;

/// Upper bound on completions handled in one interrupt.
const MAX_CTR_ROUNDS: usize = 2 * ENDPOINT_COUNT;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbFsConfig {
    /// Bytes of packet memory: 512 on F103, 1024 on F0/L0/F303.
    pub pma_size: usize,
    pub pma_layout: PmaLayout,
    /// Bulk endpoints to double-buffer, as a mask of endpoint numbers.
    pub double_buffered: u8,
    /// Drive the D+ pull-up from BCDR. Only F0/L0 parts have one built in;
    /// elsewhere the board switches it.
    pub internal_pullup: bool,
}

impl UsbFsConfig {
    pub const DEFAULT: Self = Self {
        pma_size: 512,
        pma_layout: PmaLayout::Pma2x16,
        double_buffered: 0,
        internal_pullup: false,
    };
}

impl Default for UsbFsConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Registers and packet memory.
struct Hw<R, M> {
    regs: R,
    mem: M,
    pma: Pma,
}

impl<R: Regs, M: Regs> Hw<R, M> {
    fn bd(&self, n: usize, s: Slot) -> u16 {
        self.pma.bd(&self.mem, n, s)
    }

    fn set_bd(&self, n: usize, s: Slot, v: u16) {
        self.pma.set_bd(&self.mem, n, s, v)
    }

    /// Loads one IN packet on single-buffered endpoint `n`.
    fn send(&self, n: usize, data: &[Cell<u8>]) {
        self.pma.write(&self.mem, self.bd(n, Slot::AddrTx), data);
        self.set_bd(n, Slot::CountTx, data.len() as u16);
        set_stat_tx(&self.regs, n, Stat::Valid);
    }

    /// Loads one IN packet on double-buffered endpoint `n`.
    fn send_double(&self, n: usize, data: &[Cell<u8>]) {
        let sw = self.regs.extract(epr(n)).is_set(EPR::DTOG_RX);
        let (addr, count) = Slot::double(sw);
        self.pma.write(&self.mem, self.bd(n, addr), data);
        self.set_bd(n, count, data.len() as u16);
        flip_dtog(&self.regs, n, EPR::DTOG_RX);
    }

    /// Slots holding the OUT packet the hardware last completed.
    fn rx_slots(&self, n: usize, double: bool) -> (Slot, Slot) {
        if double {
            let sw = self.regs.extract(epr(n)).is_set(EPR::DTOG_TX);
            Slot::double(!sw)
        } else {
            (Slot::AddrRx, Slot::CountRx)
        }
    }

    fn rx_len(&self, n: usize, double: bool) -> usize {
        let (_, count) = self.rx_slots(n, double);
        BD_COUNT::COUNT.read(self.bd(n, count)) as usize
    }

    /// Copies the completed OUT packet out of PMA. A double-buffered
    /// endpoint gets the buffer back.
    fn recv(&self, n: usize, double: bool, dst: &[Cell<u8>], len: usize) -> usize {
        let (addr, _) = self.rx_slots(n, double);
        let kept = self.pma.read(&self.mem, self.bd(n, addr), dst, len);
        if double {
            flip_dtog(&self.regs, n, EPR::DTOG_TX);
        }
        kept
    }
}

impl<'a, R: Regs, M: Regs> Ep0Port<'a> for Hw<R, M> {
    // DADDR applies immediately, and the status IN must still go out from
    // address 0.
    const ADDRESS_BEFORE_STATUS: bool = false;

    fn ep0_send(&mut self, data: &'a [Cell<u8>]) {
        self.send(0, data);
    }

    fn ep0_arm_out(&mut self) {
        set_stat_rx(&self.regs, 0, Stat::Valid);
    }

    fn ep0_read(&mut self, dst: &[Cell<u8>], len: usize) -> usize {
        self.recv(0, false, dst, len)
    }

    fn ep0_stall(&mut self) {
        // SETUP packets are still accepted on a stalled control endpoint.
        set_stat_tx(&self.regs, 0, Stat::Stall);
        set_stat_rx(&self.regs, 0, Stat::Stall);
    }

    fn set_address(&mut self, addr: u8) {
        self.regs
            .write_fields(DADDR, DADDR::EF::SET + DADDR::ADD.val(u32::from(addr)));
    }
}

fn ep_type(ty: TransferType) -> FieldValue<u32, EPR::Register> {
    match ty {
        TransferType::Control => EPR::EP_TYPE::Control,
        TransferType::Isochronous => EPR::EP_TYPE::Iso,
        TransferType::Bulk => EPR::EP_TYPE::Bulk,
        TransferType::Interrupt => EPR::EP_TYPE::Interrupt,
    }
}

/// A USB_FS device controller.
///
/// `R` is the register block and `M` the packet memory (both `Mmio` on
/// silicon), and `C` is the class driver that receives callbacks.
pub struct UsbFsDev<'a, R, M, C> {
    hw: Hw<R, M>,
    config: UsbFsConfig,
    ctrl: Control<'a>,
    ctrl_handler: Option<SetupFn<'a, C>>,
    in_eps: [Endpoint<'a, C>; ENDPOINT_COUNT],
    out_eps: [Endpoint<'a, C>; ENDPOINT_COUNT],
    /// Endpoint numbers currently running double-buffered.
    double: u8,
}

impl<'a, C: Class<'a>> UsbFsDev<'a, Mmio, Mmio, C> {
    /// Drives the block at [`BASE`].
    ///
    /// # Safety
    ///
    /// Nothing else may be using the peripheral, and its clock must be
    /// enabled.
    pub unsafe fn steal(config: UsbFsConfig) -> Self {
        Self::new(Mmio::new(BASE), Mmio::new(PMA_BASE), config)
    }
}

impl<'a, R: Regs, M: Regs, C: Class<'a>> UsbFsDev<'a, R, M, C> {
    pub fn new(regs: R, mem: M, config: UsbFsConfig) -> Self {
        Self {
            hw: Hw {
                regs,
                mem,
                pma: Pma::new(config.pma_size, config.pma_layout),
            },
            config,
            ctrl: Control::new(),
            ctrl_handler: None,
            in_eps: core::array::from_fn(|_| Endpoint::new()),
            out_eps: core::array::from_fn(|_| Endpoint::new()),
            double: 0,
        }
    }

    fn is_double(&self, n: usize) -> bool {
        self.double & (1 << n) != 0
    }

    /// Powers up the block and connects to the bus. Endpoints come up on the
    /// first bus reset, when the class is asked to configure EP0.
    pub fn dev_init(&mut self) -> Result<()> {
        if self.config.pma_size <= TABLE_BYTES {
            warn!("{} bytes of packet memory won't hold any buffers", self.config.pma_size);
            return Err(UsbError::PacketMemory);
        }
        let r = &self.hw.regs;
        // Out of power-down with the block still held in reset.
        r.write_fields(CNTR, CNTR::FRES::SET);
        delay(STARTUP_CYCLES);
        r.write(CNTR, 0);
        r.write(ISTR, 0);
        r.write(BTABLE, 0);
        self.hw.pma.reset();
        r.write_fields(
            CNTR,
            CNTR::CTRM::SET
                + CNTR::RESETM::SET
                + CNTR::SUSPM::SET
                + CNTR::WKUPM::SET
                + CNTR::ERRM::SET
                + CNTR::PMAOVRM::SET,
        );
        info!(
            "usb_fs: up, {} bytes packet memory ({:?})",
            self.config.pma_size, self.config.pma_layout
        );
        self.connect();
        Ok(())
    }

    /// The interrupt handler. Call it from the USB low-priority vector (and
    /// the high-priority one, on parts that split them).
    pub fn isr(&mut self, class: &mut C) {
        let istr = self.hw.regs.extract::<ISTR::Register>(ISTR);

        if istr.is_set(ISTR::CTR) {
            self.ctr(class);
        }
        if istr.is_set(ISTR::RESET) {
            ack_istr(&self.hw.regs, ISTR::RESET::SET);
            self.bus_reset(class);
        }
        if istr.is_set(ISTR::SUSP) {
            ack_istr(&self.hw.regs, ISTR::SUSP::SET);
            self.hw.regs.modify(CNTR, CNTR::FSUSP::SET);
            info!("suspend");
            class.on_suspend(self);
        }
        if istr.is_set(ISTR::WKUP) {
            ack_istr(&self.hw.regs, ISTR::WKUP::SET);
            self.hw.regs.modify(CNTR, CNTR::FSUSP::CLEAR + CNTR::LPMODE::CLEAR);
            info!("resume");
            class.on_wakeup(self);
        }
        if istr.is_set(ISTR::PMAOVR) {
            ack_istr(&self.hw.regs, ISTR::PMAOVR::SET);
            warn!("packet memory over/underrun");
        }
        if istr.is_set(ISTR::ERR) {
            ack_istr(&self.hw.regs, ISTR::ERR::SET);
            debug!("bus error");
        }
        if istr.is_set(ISTR::SOF) || istr.is_set(ISTR::ESOF) {
            ack_istr(&self.hw.regs, ISTR::SOF::SET + ISTR::ESOF::SET);
        }
    }

    /// Services completed transfers until ISTR.CTR drops.
    fn ctr(&mut self, class: &mut C) {
        for _ in 0..MAX_CTR_ROUNDS {
            let istr = self.hw.regs.extract::<ISTR::Register>(ISTR);
            if !istr.is_set(ISTR::CTR) {
                return;
            }
            let n = istr.read(ISTR::EP_ID) as usize;
            let v = self.hw.regs.extract::<EPR::Register>(epr(n));
            // IN first: a stale IN completion must not be applied to a
            // control transfer started by a SETUP that came in after it.
            if v.is_set(EPR::CTR_TX) {
                clear_ctr(&self.hw.regs, n, EPR::CTR_TX);
                self.in_complete(class, n);
            }
            if v.is_set(EPR::CTR_RX) {
                clear_ctr(&self.hw.regs, n, EPR::CTR_RX);
                if n == 0 {
                    self.ep0_rx(class, v.is_set(EPR::SETUP));
                } else {
                    self.out_packet(class, n);
                }
            }
        }
        warn!("CTR still pending after {} rounds", MAX_CTR_ROUNDS);
    }

    fn bus_reset(&mut self, class: &mut C) {
        info!("bus reset");
        let r = &self.hw.regs;
        for n in 0..ENDPOINT_COUNT {
            // Writing the toggles back flips every set one to zero; the
            // zeroes clear CTR and the read/write bits.
            let cur = r.read(epr(n));
            r.write(epr(n), cur & EPR_TOGGLE);
        }
        r.write_fields(DADDR, DADDR::EF::SET);
        self.hw.pma.reset();

        for ep in self.in_eps.iter_mut().chain(self.out_eps.iter_mut()) {
            ep.reset();
        }
        self.double = 0;
        self.ctrl.reset();
        self.ctrl_handler = None;

        class.on_reset(self);
    }

    fn ep0_rx(&mut self, class: &mut C, setup: bool) {
        let len = self.hw.rx_len(0, false);
        if !setup {
            let next = self.ctrl.out_packet(&mut self.hw, len);
            self.ctrl_next(class, next);
            return;
        }
        let mut raw = [0u8; SetupPacket::LEN];
        let kept = self.hw.recv(0, false, cells(&mut raw), len);
        let req = if kept == SetupPacket::LEN {
            SetupPacket::parse(&raw)
        } else {
            None
        };
        match req {
            Some(req) => {
                let next = self.ctrl.setup(&mut self.hw, req);
                self.ctrl_next(class, next);
            }
            None => warn!("{}-byte SETUP packet", len),
        }
    }

    fn out_packet(&mut self, class: &mut C, n: usize) {
        if !self.out_eps[n].is_configured() {
            warn!("OUT on unconfigured ep{}", n);
            return;
        }
        let len = self.hw.rx_len(n, self.is_double(n));
        trace!("ep{} OUT {}", n, len);
        self.out_eps[n].rx_packet(len);
        if len == 0 {
            // Nothing to drain.
            self.release_rx(n, Default::default());
        }
        self.out_notify(class, n, len);
    }

    /// Copies out the pending OUT packet on `n` and hands the buffer back to
    /// the hardware.
    fn release_rx(&mut self, n: usize, dst: &[Cell<u8>]) -> usize {
        let double = self.is_double(n);
        let e = &mut self.out_eps[n];
        let kept = self.hw.recv(n, double, dst, e.rx_pending);
        e.rx_drained();
        // A double-buffered endpoint never left VALID.
        if !double && !e.nak {
            set_stat_rx(&self.hw.regs, n, Stat::Valid);
        }
        kept
    }

    fn in_complete(&mut self, class: &mut C, n: usize) {
        if n == 0 {
            let next = self.ctrl.in_complete(&mut self.hw);
            self.ctrl_next(class, next);
            return;
        }
        let ep = &mut self.in_eps[n];
        match ep.tx_complete() {
            None => debug!("ep{} IN complete while {:?}", n, ep.state),
            Some(TxStep::Done) => {
                let (addr, handler) = (ep.addr, ep.handler);
                match handler {
                    Some(EpHandler::In(f)) => f(class, self, addr),
                    Some(EpHandler::Event(f)) => f(class, self, addr, EpEvent::In),
                    _ => {}
                }
            }
            Some(step) => self.load_in(n, step),
        }
    }

    fn out_notify(&mut self, class: &mut C, n: usize, len: usize) {
        let (addr, handler) = (self.out_eps[n].addr, self.out_eps[n].handler);
        match handler {
            Some(EpHandler::Out(f)) => f(class, self, addr, len),
            Some(EpHandler::Event(f)) => f(class, self, addr, EpEvent::Out(len)),
            _ => debug!("ep{} has no OUT handler", n),
        }
    }

    fn load_in(&mut self, n: usize, step: TxStep) {
        let pkt = match step {
            TxStep::Packet { offset, len } => self.in_eps[n].packet(offset, len),
            TxStep::Zlp => Default::default(),
            TxStep::Done => return,
        };
        if self.is_double(n) {
            self.hw.send_double(n, pkt);
        } else {
            self.hw.send(n, pkt);
        }
    }

    fn ctrl_next(&mut self, class: &mut C, next: Next) {
        match next {
            Next::Wait => {}
            Next::CallHandler => {
                let req = self.ctrl.request();
                let data = self.ctrl.handler_data();
                let result = match self.ctrl_handler {
                    Some(f) => f(class, self, &req, data),
                    None => Err(Stall),
                };
                self.ctrl.reply(&mut self.hw, result);
            }
            Next::StatusDone => {
                let req = self.ctrl.request();
                class.on_status(self, &req);
            }
        }
    }

    fn init_ep0(
        &mut self,
        ty: TransferType,
        mps: usize,
        handler: EpHandler<'a, C>,
        buf: &'a [Cell<u8>],
    ) -> Result<EpAddr> {
        let f = match handler {
            EpHandler::Setup(f) if ty == TransferType::Control => f,
            _ => return Err(UsbError::InvalidState),
        };
        if !matches!(mps, 8 | 16 | 32 | 64) {
            return Err(UsbError::InvalidState);
        }
        let (count, rx_size) = rx_count_encode(mps);
        let base = self.hw.pma.alloc_ep(0, false, mps + rx_size)?;
        self.hw.set_bd(0, Slot::AddrTx, base);
        self.hw.set_bd(0, Slot::CountTx, 0);
        self.hw.set_bd(0, Slot::AddrRx, base + mps as u16);
        self.hw.set_bd(0, Slot::CountRx, count);

        let r = &self.hw.regs;
        r.write(epr(0), EPR_CTR | EPR::EP_TYPE::Control.value);
        set_dtog(r, 0, EPR::DTOG_TX::CLEAR + EPR::DTOG_RX::CLEAR);
        set_stat_tx(r, 0, Stat::Nak);
        set_stat_rx(r, 0, Stat::Valid);
        self.ctrl.configure(mps, buf);
        self.ctrl_handler = Some(f);
        debug!("ep0 mps {}", mps);
        Ok(EpAddr::EP0_OUT)
    }
}

impl<'a, R: Regs, M: Regs, C: Class<'a>> UsbDev<'a, C> for UsbFsDev<'a, R, M, C> {
    fn ep_init(
        &mut self,
        desc: &EndpointDescriptor,
        handler: EpHandler<'a, C>,
        buf: &'a [Cell<u8>],
    ) -> Result<EpAddr> {
        let addr = desc.address();
        let n = addr.number();
        let ty = desc.transfer_type();
        let mps = usize::from(desc.max_packet_size());
        if n >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        if n == 0 {
            return self.init_ep0(ty, mps, handler, buf);
        }
        if ty == TransferType::Control {
            return Err(UsbError::InvalidEndpoint);
        }
        if mps == 0 || mps > 1023 || matches!(handler, EpHandler::Setup(_)) {
            return Err(UsbError::InvalidState);
        }

        let is_in = addr.is_in();
        let double = ty == TransferType::Isochronous
            || (ty == TransferType::Bulk && self.config.double_buffered & (1 << n) != 0);
        // Both directions share one EPnR, so they share its type, and a
        // double-buffered endpoint takes both descriptor slots.
        let other = if is_in { &self.out_eps[n] } else { &self.in_eps[n] };
        if other.is_configured() && (double || self.is_double(n) || other.ty != ty) {
            warn!("ep{} can't be {:?} in both directions", n, ty);
            return Err(UsbError::InvalidState);
        }

        let (count, size) = if is_in {
            (0, (mps + 1) & !1)
        } else {
            rx_count_encode(mps)
        };
        let base = self
            .hw
            .pma
            .alloc_ep(n, is_in, if double { 2 * size } else { size })?;
        if double {
            self.hw.set_bd(n, Slot::AddrTx, base);
            self.hw.set_bd(n, Slot::CountTx, count);
            self.hw.set_bd(n, Slot::AddrRx, base + size as u16);
            self.hw.set_bd(n, Slot::CountRx, count);
        } else if is_in {
            self.hw.set_bd(n, Slot::AddrTx, base);
            self.hw.set_bd(n, Slot::CountTx, 0);
        } else {
            self.hw.set_bd(n, Slot::AddrRx, base);
            self.hw.set_bd(n, Slot::CountRx, count);
        }

        let r = &self.hw.regs;
        let kind = if double && ty == TransferType::Bulk {
            EPR::EP_KIND::SET
        } else {
            EPR::EP_KIND::CLEAR
        };
        r.write(
            epr(n),
            EPR_CTR | (EPR::EA.val(n as u32) + ep_type(ty) + kind).value,
        );
        match (is_in, double) {
            (true, true) => {
                set_dtog(r, n, EPR::DTOG_TX::CLEAR + EPR::DTOG_RX::CLEAR);
                set_stat_tx(r, n, Stat::Valid);
                set_stat_rx(r, n, Stat::Disabled);
            }
            (true, false) => {
                set_dtog(r, n, EPR::DTOG_TX::CLEAR);
                set_stat_tx(r, n, Stat::Nak);
            }
            (false, true) => {
                set_dtog(r, n, EPR::DTOG_TX::SET + EPR::DTOG_RX::CLEAR);
                set_stat_rx(r, n, Stat::Valid);
                set_stat_tx(r, n, Stat::Disabled);
            }
            (false, false) => {
                set_dtog(r, n, EPR::DTOG_RX::CLEAR);
                set_stat_rx(r, n, Stat::Valid);
            }
        }

        if double {
            self.double |= 1 << n;
        } else {
            self.double &= !(1 << n);
        }
        if is_in {
            self.in_eps[n].configure(addr, ty, mps, handler, buf);
        } else {
            self.out_eps[n].configure(addr, ty, mps, handler, buf);
        }
        debug!(
            "ep {:02x} {:?} mps {}{}",
            addr.0,
            ty,
            mps,
            if double { " double-buffered" } else { "" }
        );
        Ok(addr)
    }

    fn ep_ctl(&mut self, ep: EpAddr, op: EpCtl) -> Result<()> {
        let n = ep.number();
        if n >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        if n == 0 {
            return match op {
                EpCtl::StallSet => {
                    self.hw.ep0_stall();
                    Ok(())
                }
                EpCtl::StallClr => {
                    set_stat_tx(&self.hw.regs, 0, Stat::Nak);
                    set_stat_rx(&self.hw.regs, 0, Stat::Valid);
                    Ok(())
                }
                _ => Err(UsbError::InvalidEndpoint),
            };
        }

        let is_in = ep.is_in();
        let double = self.is_double(n);
        let e = if is_in {
            &mut self.in_eps[n]
        } else {
            &mut self.out_eps[n]
        };
        if !e.is_configured() {
            return Err(UsbError::InvalidEndpoint);
        }
        debug!("ep {:02x} {:?}", ep.0, op);
        let r = &self.hw.regs;
        let set_stat = |stat: Stat| {
            if is_in {
                set_stat_tx(r, n, stat)
            } else {
                set_stat_rx(r, n, stat)
            }
        };
        match op {
            EpCtl::RecvOk => {
                if is_in {
                    return Err(UsbError::InvalidState);
                }
                if e.state != EpState::Idle {
                    return Err(UsbError::WouldBlock);
                }
                e.nak = false;
                set_stat(Stat::Valid);
            }
            EpCtl::NakSet => {
                e.nak = true;
                set_stat(Stat::Nak);
            }
            EpCtl::NakClr => {
                e.nak = false;
                // A single-buffered IN endpoint with nothing loaded, or OUT
                // endpoint holding an undrained packet, stays NAKed.
                let ready = if is_in {
                    e.state != EpState::Idle
                } else {
                    e.state == EpState::Idle
                };
                if double || ready {
                    set_stat(Stat::Valid);
                }
            }
            EpCtl::ZlpSend => {
                if !is_in {
                    return Err(UsbError::InvalidState);
                }
                let step = e.xmit_zlp()?;
                self.load_in(n, step);
            }
            EpCtl::StallSet => {
                e.stall();
                set_stat(Stat::Stall);
            }
            EpCtl::StallClr => {
                e.unstall();
                // Back to DATA0, and for double buffering, back to the
                // initial buffer ownership.
                let stat = match (is_in, double) {
                    (true, true) => {
                        set_dtog(r, n, EPR::DTOG_TX::CLEAR + EPR::DTOG_RX::CLEAR);
                        Stat::Valid
                    }
                    (true, false) => {
                        set_dtog(r, n, EPR::DTOG_TX::CLEAR);
                        Stat::Nak
                    }
                    (false, true) => {
                        set_dtog(r, n, EPR::DTOG_TX::SET + EPR::DTOG_RX::CLEAR);
                        Stat::Valid
                    }
                    (false, false) => {
                        set_dtog(r, n, EPR::DTOG_RX::CLEAR);
                        Stat::Valid
                    }
                };
                set_stat(if e.nak { Stat::Nak } else { stat });
            }
            EpCtl::Disable => {
                set_stat(Stat::Disabled);
                e.reset();
                self.double &= !(1 << n);
            }
        }
        Ok(())
    }

    fn ep_pkt_xmit(&mut self, ep: EpAddr, data: &[u8]) -> Result<usize> {
        let n = ep.number();
        if n == 0 || n >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        if !ep.is_in() {
            return Err(UsbError::InvalidState);
        }
        let (accepted, step) = self.in_eps[n].xmit(data)?;
        trace!("ep{} IN xmit {}", n, accepted);
        self.load_in(n, step);
        Ok(accepted)
    }

    fn ep_pkt_recv(&mut self, ep: EpAddr, buf: &mut [u8]) -> Result<usize> {
        let n = ep.number();
        if n == 0 || n >= ENDPOINT_COUNT {
            return Err(UsbError::InvalidEndpoint);
        }
        if ep.is_in() {
            return Err(UsbError::InvalidState);
        }
        let e = &self.out_eps[n];
        if !e.is_configured() {
            return Err(UsbError::InvalidEndpoint);
        }
        if !e.has_rx_pending() {
            return Ok(0);
        }
        Ok(self.release_rx(n, cells(buf)))
    }

    fn ep_state(&self, ep: EpAddr) -> Option<EpState> {
        let n = ep.number();
        if n >= ENDPOINT_COUNT {
            None
        } else if n == 0 {
            Some(self.ctrl.state())
        } else if ep.is_in() {
            Some(self.in_eps[n].state)
        } else {
            Some(self.out_eps[n].state)
        }
    }

    fn address(&self) -> u8 {
        self.ctrl.address()
    }

    fn connect(&mut self) {
        if self.config.internal_pullup {
            self.hw.regs.modify(BCDR, BCDR::DPPU::SET);
        } else {
            debug!("D+ pull-up is up to the board");
        }
    }

    fn disconnect(&mut self) {
        if self.config.internal_pullup {
            self.hw.regs.modify(BCDR, BCDR::DPPU::CLEAR);
        }
    }

    fn remote_wakeup(&mut self) {
        let r = &self.hw.regs;
        if !r.extract(CNTR).is_set(CNTR::FSUSP) {
            debug!("remote wakeup while not suspended");
            return;
        }
        r.modify(CNTR, CNTR::FSUSP::CLEAR + CNTR::LPMODE::CLEAR);
        r.modify(CNTR, CNTR::RESUME::SET);
        delay(REMOTE_WAKEUP_CYCLES);
        r.modify(CNTR, CNTR::RESUME::CLEAR);
    }
}
