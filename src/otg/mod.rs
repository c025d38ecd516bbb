// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device driver for the Synopsys OTG core found in STM32F2/F4/F7 parts, as
//! OTG_FS or as OTG_HS running on its embedded full-speed PHY.
//!
//! # Data flow
//!
//! OUT and SETUP data arrive through a single receive FIFO shared by all
//! endpoints. The core announces each entry with RXFLVL and a status word
//! naming the endpoint and byte count; we must pop the status, then exactly
//! that many bytes, before the next entry becomes visible. When a packet is
//! for a class endpoint we hand the class an `on_out` callback and leave the
//! bytes in the FIFO until it calls `ep_pkt_recv`. In the meantime RXFLVL
//! stays masked, since servicing it again would pop the next status word out
//! from under the pending data.
//!
//! IN data is sent a packet at a time: program the transfer size for one
//! packet, enable the endpoint, push the bytes into its transmit FIFO. If the
//! FIFO can't take the whole packet yet, the TXFE interrupt for that endpoint
//! is unmasked and the rest goes in when it fires. The core raises XFRC
//! once the host has ACKed the packet, and we move on to the next one.

mod fifo;
pub mod regs;

use core::cell::Cell;
use core::marker::PhantomData;

use log::{debug, info, trace, warn};
use tock_registers::LocalRegisterCopy;

use self::fifo::Fifo;
use self::regs::*;
use crate::class::{cells, Class, EpCtl, EpEvent, EpHandler, SetupFn, UsbDev};
use crate::control::{Control, Ep0Port, Next};
use crate::descriptor::EndpointDescriptor;
use crate::endpoint::{EpState, Endpoint, TxStep};
use crate::error::{Result, Stall, UsbError};
use crate::reg::{delay, Mmio, Regs};
use crate::setup::{EpAddr, SetupPacket, TransferType};

/// Size of the endpoint tables, covering the largest OTG core we drive.
pub const MAX_ENDPOINTS: usize = 8;

/// Roughly 25ms at 168MHz: how long the core needs to settle after forcing
/// device mode.
const FORCE_MODE_CYCLES: u32 = 4_200_000;

/// Roughly 6ms at 168MHz, within the 1-15ms remote wakeup window.
const REMOTE_WAKEUP_CYCLES: u32 = 1_000_000;

/// Describes one instance of the OTG core.
pub trait OtgPeripheral {
    /// Address of the register block.
    const BASE: usize;
    /// Size of FIFO RAM in 32-bit words.
    const FIFO_DEPTH_WORDS: usize;
    /// Number of bidirectional endpoints, EP0 included.
    const ENDPOINT_COUNT: usize;
    const HIGH_SPEED: bool;
}

/// The full-speed core.
pub struct OtgFs;

impl OtgPeripheral for OtgFs {
    const BASE: usize = 0x5000_0000;
    const FIFO_DEPTH_WORDS: usize = 320;
    const ENDPOINT_COUNT: usize = 4;
    const HIGH_SPEED: bool = false;
}

/// The high-speed core, used in full-speed mode on the internal PHY.
pub struct OtgHs;

impl OtgPeripheral for OtgHs {
    const BASE: usize = 0x4004_0000;
    const FIFO_DEPTH_WORDS: usize = 1024;
    const ENDPOINT_COUNT: usize = 6;
    const HIGH_SPEED: bool = true;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct OtgConfig {
    /// Receive FIFO size in words. Shared by every OUT endpoint and by
    /// SETUP packets.
    pub rx_fifo_words: usize,
    /// Gate the pull-up on VBUS sensing. Boards that don't route VBUS to
    /// the PA9 pin must turn this off.
    pub vbus_sensing: bool,
    /// USB turnaround time in PHY clocks, GUSBCFG.TRDT. Depends on the AHB
    /// clock; 6 is right for AHB at 32MHz and above.
    pub turnaround: u8,
}

impl OtgConfig {
    pub const DEFAULT: Self = Self {
        rx_fifo_words: 128,
        vbus_sensing: false,
        turnaround: 6,
    };
}

impl Default for OtgConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// The register-level half of the driver, split out so the EP0 sequencer
/// can borrow it while the endpoint tables are borrowed elsewhere.
struct Core<'a, R> {
    regs: R,
    fifo: Fifo,
    /// Bytes of the current IN packet still waiting for FIFO space.
    tx_rest: [&'a [Cell<u8>]; MAX_ENDPOINTS],
    ep0_mps: usize,
    /// EP0 OUT was asked to re-arm while its previous transfer was still
    /// enabled; do it on XFRC.
    ep0_rearm: bool,
}

impl<'a, R: Regs> Core<'a, R> {
    /// Loads one IN packet on endpoint `n`.
    fn send(&mut self, n: usize, data: &'a [Cell<u8>]) {
        let len = data.len() as u32;
        self.regs
            .write_fields(dieptsiz(n), DEPTSIZ::PKTCNT.val(1) + DEPTSIZ::XFRSIZ.val(len));
        self.regs.modify(
            diepctl(n),
            DEPCTL::EPDIS::CLEAR + DEPCTL::EPENA::SET + DEPCTL::CNAK::SET,
        );
        let pushed = self.fifo.push(&self.regs, n, data);
        self.tx_rest[n] = &data[pushed..];
        if pushed < data.len() {
            trace!("ep{} IN: {} of {} pushed, waiting for TXFE", n, pushed, data.len());
            self.regs.set_bits(DIEPEMPMSK, 1 << n);
        }
    }

    /// TXFE: push what's left of the current packet.
    fn refill(&mut self, n: usize) {
        let rest = self.tx_rest[n];
        let pushed = self.fifo.push(&self.regs, n, rest);
        self.tx_rest[n] = &rest[pushed..];
        if self.tx_rest[n].is_empty() {
            self.regs.clear_bits(DIEPEMPMSK, 1 << n);
        }
    }

    /// Lets OUT endpoint `n` accept one packet. If it's still enabled for
    /// the last one, the transfer size is left alone and only the NAK is
    /// cleared; the core owns DOEPTSIZ until it disables the endpoint.
    fn arm_out(&self, n: usize, mps: usize) {
        if self.regs.extract(doepctl(n)).is_set(DEPCTL::EPENA) {
            self.regs.modify(doepctl(n), DEPCTL::CNAK::SET);
            return;
        }
        let mut tsiz = DEPTSIZ::PKTCNT.val(1) + DEPTSIZ::XFRSIZ.val(mps as u32);
        if n == 0 {
            tsiz += DEPTSIZ::STUPCNT.val(3);
        }
        self.regs.write_fields(doeptsiz(n), tsiz);
        self.regs.modify(
            doepctl(n),
            DEPCTL::EPDIS::CLEAR + DEPCTL::EPENA::SET + DEPCTL::CNAK::SET,
        );
    }

    /// EP0 is always ready for SETUP packets, even when not enabled, as long
    /// as STUPCNT is non-zero.
    fn arm_setup(&self) {
        self.regs.write_fields(
            doeptsiz(0),
            DEPTSIZ::STUPCNT.val(3) + DEPTSIZ::PKTCNT.val(1) + DEPTSIZ::XFRSIZ.val(3 * 8),
        );
    }

    /// NAKs endpoint `n` in both directions, disables it if it was enabled
    /// and acknowledges its interrupts.
    fn quiesce(&self, n: usize) {
        let mut v = self.regs.extract::<DEPCTL::Register>(diepctl(n));
        let was_enabled = v.is_set(DEPCTL::EPENA);
        v.modify(DEPCTL::EPENA::CLEAR + DEPCTL::STALL::CLEAR + DEPCTL::SNAK::SET);
        if was_enabled {
            v.modify(DEPCTL::EPDIS::SET);
        }
        self.regs.write(diepctl(n), v.get());
        self.regs.write(diepint(n), DIEPINT_ALL);

        let mut v = self.regs.extract::<DEPCTL::Register>(doepctl(n));
        let was_enabled = v.is_set(DEPCTL::EPENA);
        v.modify(DEPCTL::EPENA::CLEAR + DEPCTL::STALL::CLEAR + DEPCTL::SNAK::SET);
        // OUT EP0 can't be disabled.
        if n != 0 && was_enabled {
            v.modify(DEPCTL::EPDIS::SET);
        }
        self.regs.write(doepctl(n), v.get());
        self.regs.write(doepint(n), DOEPINT_ALL);
    }

    fn core_reset(&self) {
        fifo::wait_idle(&self.regs);
        self.regs.write_fields(GRSTCTL, GRSTCTL::CSRST::SET);
        fifo::spin_clear(&self.regs, GRSTCTL::CSRST);
        delay(3);
    }
}

impl<'a, R: Regs> Ep0Port<'a> for Core<'a, R> {
    // DAD takes effect once the status stage completes, and the reference
    // manual wants it written before the status packet is queued.
    const ADDRESS_BEFORE_STATUS: bool = true;

    fn ep0_send(&mut self, data: &'a [Cell<u8>]) {
        self.send(0, data);
    }

    fn ep0_arm_out(&mut self) {
        if self.regs.extract(doepctl(0)).is_set(DEPCTL::EPENA) {
            self.ep0_rearm = true;
        } else {
            self.arm_out(0, self.ep0_mps);
        }
    }

    fn ep0_read(&mut self, dst: &[Cell<u8>], len: usize) -> usize {
        self.fifo.pop(&self.regs, dst, len)
    }

    fn ep0_stall(&mut self) {
        self.regs.modify(diepctl(0), DEPCTL::STALL::SET);
        self.regs.modify(doepctl(0), DEPCTL::STALL::SET);
    }

    fn set_address(&mut self, addr: u8) {
        self.regs.modify(DCFG, DCFG::DAD.val(u32::from(addr)));
    }
}

/// A device-mode OTG controller.
///
/// `R` is the register block (`Mmio` on silicon), `P` says which core it is,
/// and `C` is the class driver that receives callbacks.
pub struct OtgDev<'a, R, P, C> {
    core: Core<'a, R>,
    config: OtgConfig,
    ctrl: Control<'a>,
    ctrl_handler: Option<SetupFn<'a, C>>,
    /// Last SETUP popped from the receive FIFO, processed on STUP.
    setup: Option<SetupPacket>,
    in_eps: [Endpoint<'a, C>; MAX_ENDPOINTS],
    out_eps: [Endpoint<'a, C>; MAX_ENDPOINTS],
    _periph: PhantomData<P>,
}

impl<'a, P: OtgPeripheral, C: Class<'a>> OtgDev<'a, Mmio, P, C> {
    /// Drives the core at `P::BASE`.
    ///
    /// # Safety
    ///
    /// Nothing else may be using the peripheral, and its clock must be
    /// enabled.
    pub unsafe fn steal(config: OtgConfig) -> Self {
        Self::new(Mmio::new(P::BASE), config)
    }
}

impl<'a, R: Regs, P: OtgPeripheral, C: Class<'a>> OtgDev<'a, R, P, C> {
    pub fn new(regs: R, config: OtgConfig) -> Self {
        Self {
            core: Core {
                regs,
                fifo: Fifo::new(P::FIFO_DEPTH_WORDS),
                tx_rest: [Default::default(); MAX_ENDPOINTS],
                ep0_mps: 0,
                ep0_rearm: false,
            },
            config,
            ctrl: Control::new(),
            ctrl_handler: None,
            setup: None,
            in_eps: core::array::from_fn(|_| Endpoint::new()),
            out_eps: core::array::from_fn(|_| Endpoint::new()),
            _periph: PhantomData,
        }
    }

    fn ep_count() -> usize {
        P::ENDPOINT_COUNT.min(MAX_ENDPOINTS)
    }

    /// Brings the core up in device mode and connects to the bus. Endpoints
    /// come up on the first bus reset, when the class is asked to configure
    /// EP0.
    pub fn dev_init(&mut self) -> Result<()> {
        let r = &self.core.regs;
        r.modify(GAHBCFG, GAHBCFG::GINT::CLEAR);
        // Every part we drive uses the embedded full-speed PHY.
        r.modify(GUSBCFG, GUSBCFG::PHYSEL::SET);
        self.core.core_reset();

        let trdt = u32::from(self.config.turnaround);
        r.modify(
            GUSBCFG,
            GUSBCFG::FHMOD::CLEAR
                + GUSBCFG::FDMOD::SET
                + GUSBCFG::TRDT.val(trdt)
                + GUSBCFG::TOCAL.val(1),
        );
        delay(FORCE_MODE_CYCLES);

        let vbus = if self.config.vbus_sensing {
            GCCFG::VBUSBSEN::SET
        } else {
            GCCFG::NOVBUSSENS::SET
        };
        r.write_fields(GCCFG, GCCFG::PWRDWN::SET + vbus);
        r.write(PCGCCTL, 0);
        r.modify(DCFG, DCFG::DSPD::FullSpeed);
        r.modify(DCTL, DCTL::SDIS::SET);

        self.core.fifo.reset(r, self.config.rx_fifo_words)?;
        self.core.fifo.flush_tx(r, GRSTCTL::TXFNUM::All);
        self.core.fifo.flush_rx(r);

        r.write(DIEPMSK, 0);
        r.write(DOEPMSK, 0);
        r.write(DAINTMSK, 0);
        r.write(DIEPEMPMSK, 0);
        for n in 0..Self::ep_count() {
            self.core.quiesce(n);
        }

        // GINTSTS is write-1-to-clear throughout.
        r.write(GINTSTS, u32::MAX);
        r.write_fields(
            GINTMSK,
            GINT::USBRST::SET
                + GINT::ENUMDNE::SET
                + GINT::USBSUSP::SET
                + GINT::WKUPINT::SET
                + GINT::IEPINT::SET
                + GINT::OEPINT::SET
                + GINT::RXFLVL::SET
                + GINT::ISOODRP::SET
                + GINT::IISOIXFR::SET
                + GINT::INCOMPISOOUT::SET,
        );
        r.write_fields(GAHBCFG, GAHBCFG::GINT::SET + GAHBCFG::TXFELVL::SET);
        info!(
            "otg: core {:#010x} up, {} words fifo ram, {} endpoints{}",
            r.read(CID),
            P::FIFO_DEPTH_WORDS,
            P::ENDPOINT_COUNT,
            if P::HIGH_SPEED { " (HS core)" } else { "" }
        );
        r.modify(DCTL, DCTL::SDIS::CLEAR);
        Ok(())
    }

    /// The interrupt handler. Call it from the OTG interrupt vector.
    pub fn isr(&mut self, class: &mut C) {
        let r = &self.core.regs;
        let sts: LocalRegisterCopy<u32, GINT::Register> =
            LocalRegisterCopy::new(r.read(GINTSTS) & r.read(GINTMSK));

        if sts.is_set(GINT::IEPINT) {
            self.in_ep_irq(class);
        }
        if sts.is_set(GINT::OEPINT) {
            self.out_ep_irq(class);
        }
        if sts.is_set(GINT::RXFLVL) {
            self.rx_level(class);
        }
        // GINTSTS is write-1-to-clear, so these are acknowledged with plain
        // writes.
        if sts.is_set(GINT::ENUMDNE) {
            self.core.regs.write_fields(GINTSTS, GINT::ENUMDNE::SET);
            self.enum_done();
        }
        if sts.is_set(GINT::USBRST) {
            self.core.regs.write_fields(GINTSTS, GINT::USBRST::SET);
            self.bus_reset(class);
        }
        if sts.is_set(GINT::USBSUSP) {
            self.core.regs.write_fields(GINTSTS, GINT::USBSUSP::SET);
            info!("suspend");
            class.on_suspend(self);
        }
        if sts.is_set(GINT::WKUPINT) {
            self.core.regs.write_fields(GINTSTS, GINT::WKUPINT::SET);
            self.core.regs.modify(DCTL, DCTL::RWUSIG::CLEAR);
            info!("resume");
            class.on_wakeup(self);
        }
        let iso = GINT::ISOODRP::SET + GINT::IISOIXFR::SET + GINT::INCOMPISOOUT::SET;
        let pending = sts.get() & iso.value;
        if pending != 0 {
            self.core.regs.write(GINTSTS, pending);
            debug!("isochronous transfer incomplete: {:#x}", pending);
        }
    }

    fn bus_reset(&mut self, class: &mut C) {
        info!("bus reset");
        let r = &self.core.regs;
        r.modify(DCTL, DCTL::RWUSIG::CLEAR);
        self.core.fifo.flush_tx(r, GRSTCTL::TXFNUM::All);
        self.core.fifo.flush_rx(r);
        for n in 0..Self::ep_count() {
            self.core.quiesce(n);
        }
        r.write(DIEPEMPMSK, 0);
        r.write_fields(DAINTMSK, DAINT::IEP.val(1) + DAINT::OEP.val(1));
        r.write_fields(DOEPMSK, DOEPINT::STUP::SET + DOEPINT::XFRC::SET);
        r.write_fields(DIEPMSK, DIEPINT::XFRC::SET + DIEPINT::TOC::SET);
        r.modify(DCFG, DCFG::DAD.val(0));
        if let Err(e) = self.core.fifo.reset(r, self.config.rx_fifo_words) {
            warn!("rx fifo: {:?}", e);
        }
        // A drain may have been pending; the flush threw the data away.
        r.modify(GINTMSK, GINT::RXFLVL::SET);
        self.core.arm_setup();
        self.core.tx_rest = [Default::default(); MAX_ENDPOINTS];
        self.core.ep0_mps = 0;
        self.core.ep0_rearm = false;

        for ep in self.in_eps.iter_mut().chain(self.out_eps.iter_mut()) {
            ep.reset();
        }
        self.ctrl.reset();
        self.ctrl_handler = None;
        self.setup = None;

        class.on_reset(self);
    }

    fn enum_done(&mut self) {
        let r = &self.core.regs;
        let speed = r.extract::<DSTS::Register>(DSTS).read(DSTS::ENUMSPD);
        info!("enumerated, speed {}", speed);
        r.modify(DCTL, DCTL::CGINAK::SET);
        if let Some(code) = ep0_mps_code(self.core.ep0_mps) {
            r.modify(diepctl(0), DEPCTL::MPSIZ.val(code));
        }
    }

    fn in_ep_irq(&mut self, class: &mut C) {
        let r = &self.core.regs;
        let daint = pending_endpoints(r).read(DAINT::IEP);
        let empmsk = r.read(DIEPEMPMSK);
        for n in 0..Self::ep_count() {
            if daint & (1 << n) == 0 {
                continue;
            }
            let r = &self.core.regs;
            let mut mask = r.extract::<DIEPINT::Register>(DIEPMSK);
            if empmsk & (1 << n) != 0 {
                mask.modify(DIEPINT::TXFE::SET);
            }
            let int: LocalRegisterCopy<u32, DIEPINT::Register> =
                LocalRegisterCopy::new(r.read(diepint(n)) & mask.get());
            // TXFE is a read-only level.
            r.write(diepint(n), int.get() & !DIEPINT::TXFE::SET.value);

            if int.is_set(DIEPINT::TOC) {
                warn!("ep{} IN timeout", n);
            }
            if int.is_set(DIEPINT::TXFE) {
                self.core.refill(n);
            }
            if int.is_set(DIEPINT::XFRC) {
                self.in_complete(class, n);
            }
        }
    }

    fn out_ep_irq(&mut self, class: &mut C) {
        let r = &self.core.regs;
        let daint = pending_endpoints(r).read(DAINT::OEP);
        for n in 0..Self::ep_count() {
            if daint & (1 << n) == 0 {
                continue;
            }
            let r = &self.core.regs;
            let int: LocalRegisterCopy<u32, DOEPINT::Register> =
                LocalRegisterCopy::new(r.read(doepint(n)) & r.read(DOEPMSK));
            r.write(doepint(n), int.get());

            if int.is_set(DOEPINT::XFRC) {
                self.out_complete(n);
            }
            if n == 0 && int.is_set(DOEPINT::STUP) {
                match self.setup.take() {
                    Some(req) => {
                        let next = self.ctrl.setup(&mut self.core, req);
                        self.ctrl_next(class, next);
                    }
                    None => warn!("STUP without a SETUP packet"),
                }
            }
        }
    }

    /// Services one receive FIFO entry.
    fn rx_level(&mut self, class: &mut C) {
        let r = &self.core.regs;
        r.modify(GINTMSK, GINT::RXFLVL::CLEAR);
        let st = r.extract::<GRXSTS::Register>(GRXSTSP);
        let n = st.read(GRXSTS::EPNUM) as usize;
        let len = st.read(GRXSTS::BCNT) as usize;
        match st.read_as_enum(GRXSTS::PKTSTS) {
            Some(GRXSTS::PKTSTS::Value::SetupData) => {
                let mut raw = [0u8; SetupPacket::LEN];
                let kept = self.core.fifo.pop(r, cells(&mut raw), len);
                self.setup = if kept == SetupPacket::LEN {
                    SetupPacket::parse(&raw)
                } else {
                    warn!("{}-byte SETUP packet", len);
                    None
                };
                r.modify(GINTMSK, GINT::RXFLVL::SET);
            }
            Some(GRXSTS::PKTSTS::Value::OutData) if n == 0 => {
                let next = self.ctrl.out_packet(&mut self.core, len);
                self.core.regs.modify(GINTMSK, GINT::RXFLVL::SET);
                self.ctrl_next(class, next);
            }
            Some(GRXSTS::PKTSTS::Value::OutData) => {
                trace!("ep{} OUT {}", n, len);
                if n >= Self::ep_count() || !self.out_eps[n].is_configured() {
                    warn!("{} bytes for unconfigured ep{} dropped", len, n);
                    self.core.fifo.pop(r, Default::default(), len);
                    r.modify(GINTMSK, GINT::RXFLVL::SET);
                    return;
                }
                let ep = &mut self.out_eps[n];
                ep.rx_packet(len);
                if len == 0 {
                    // Nothing to drain.
                    ep.rx_drained();
                    r.modify(GINTMSK, GINT::RXFLVL::SET);
                }
                // Otherwise RXFLVL stays masked until `ep_pkt_recv`.
                self.out_notify(class, n, len);
            }
            _ => {
                r.modify(GINTMSK, GINT::RXFLVL::SET);
            }
        }
    }

    fn in_complete(&mut self, class: &mut C, n: usize) {
        if n == 0 {
            let next = self.ctrl.in_complete(&mut self.core);
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

    /// XFRC on an OUT endpoint: its packet has been fully popped and the
    /// core disabled the endpoint.
    fn out_complete(&mut self, n: usize) {
        if n == 0 {
            if self.core.ep0_rearm {
                self.core.ep0_rearm = false;
                self.core.arm_out(0, self.core.ep0_mps);
            }
            return;
        }
        let ep = &self.out_eps[n];
        if ep.state == EpState::Idle && !ep.nak {
            self.core.arm_out(n, ep.mps);
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
        match step {
            TxStep::Packet { offset, len } => {
                let pkt = self.in_eps[n].packet(offset, len);
                self.core.send(n, pkt);
            }
            TxStep::Zlp => self.core.send(n, Default::default()),
            TxStep::Done => {}
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
                self.ctrl.reply(&mut self.core, result);
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
        let code = ep0_mps_code(mps).ok_or(UsbError::InvalidState)?;
        let r = &self.core.regs;
        self.core.fifo.alloc_tx(r, 0, mps)?;
        r.modify(diepctl(0), DEPCTL::MPSIZ.val(code) + DEPCTL::SNAK::SET);
        r.set_bits(DAINTMSK, (DAINT::IEP.val(1) + DAINT::OEP.val(1)).value);
        self.core.ep0_mps = mps;
        self.ctrl.configure(mps, buf);
        self.ctrl_handler = Some(f);
        debug!("ep0 mps {}", mps);
        Ok(EpAddr::EP0_OUT)
    }
}

/// Endpoints with an interrupt pending, masked by DAINTMSK.
fn pending_endpoints<R: Regs>(r: &R) -> LocalRegisterCopy<u32, DAINT::Register> {
    LocalRegisterCopy::new(r.read(DAINT) & r.read(DAINTMSK))
}

/// DIEPCTL0.MPSIZ encoding of EP0's max packet size.
fn ep0_mps_code(mps: usize) -> Option<u32> {
    match mps {
        64 => Some(0),
        32 => Some(1),
        16 => Some(2),
        8 => Some(3),
        _ => None,
    }
}

impl<'a, R: Regs, P: OtgPeripheral, C: Class<'a>> UsbDev<'a, C> for OtgDev<'a, R, P, C> {
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
        if n >= Self::ep_count() {
            return Err(UsbError::InvalidEndpoint);
        }
        if n == 0 {
            return self.init_ep0(ty, mps, handler, buf);
        }
        if ty == TransferType::Control {
            return Err(UsbError::InvalidEndpoint);
        }
        if mps == 0 || matches!(handler, EpHandler::Setup(_)) {
            return Err(UsbError::InvalidState);
        }

        let mut ctl = DEPCTL::MPSIZ.val(mps as u32)
            + DEPCTL::EPTYP.val(ty as u32)
            + DEPCTL::USBAEP::SET
            + DEPCTL::SNAK::SET;
        if ty != TransferType::Isochronous {
            ctl += DEPCTL::SD0PID::SET;
        }
        let r = &self.core.regs;
        if addr.is_in() {
            self.core.fifo.alloc_tx(r, n, mps)?;
            self.core.fifo.flush_tx(r, GRSTCTL::TXFNUM.val(n as u32));
            r.write_fields(diepctl(n), ctl + DEPCTL::TXFNUM.val(n as u32));
            r.set_bits(DAINTMSK, DAINT::IEP.val(1 << n).value);
            self.core.tx_rest[n] = Default::default();
            self.in_eps[n].configure(addr, ty, mps, handler, buf);
        } else {
            // Reconfiguring an endpoint that is still armed keeps it armed;
            // `arm_out` then leaves the transfer size alone.
            if r.extract(doepctl(n)).is_set(DEPCTL::EPENA) {
                ctl += DEPCTL::EPENA::SET;
            }
            r.write_fields(doepctl(n), ctl);
            r.set_bits(DAINTMSK, DAINT::OEP.val(1 << n).value);
            self.out_eps[n].configure(addr, ty, mps, handler, buf);
            self.core.arm_out(n, mps);
        }
        debug!("ep {:02x} {:?} mps {}", addr.0, ty, mps);
        Ok(addr)
    }

    fn ep_ctl(&mut self, ep: EpAddr, op: EpCtl) -> Result<()> {
        let n = ep.number();
        if n >= Self::ep_count() {
            return Err(UsbError::InvalidEndpoint);
        }
        if n == 0 {
            return match op {
                EpCtl::StallSet => {
                    self.core.ep0_stall();
                    Ok(())
                }
                EpCtl::StallClr => {
                    self.core.regs.modify(diepctl(0), DEPCTL::STALL::CLEAR);
                    self.core.regs.modify(doepctl(0), DEPCTL::STALL::CLEAR);
                    Ok(())
                }
                _ => Err(UsbError::InvalidEndpoint),
            };
        }

        let is_in = ep.is_in();
        let ctl = if is_in { diepctl(n) } else { doepctl(n) };
        let e = if is_in {
            &mut self.in_eps[n]
        } else {
            &mut self.out_eps[n]
        };
        if !e.is_configured() {
            return Err(UsbError::InvalidEndpoint);
        }
        debug!("ep {:02x} {:?}", ep.0, op);
        let r = &self.core.regs;
        match op {
            EpCtl::RecvOk => {
                if is_in {
                    return Err(UsbError::InvalidState);
                }
                if e.state != EpState::Idle {
                    return Err(UsbError::WouldBlock);
                }
                e.nak = false;
                self.core.arm_out(n, e.mps);
            }
            EpCtl::NakSet => {
                e.nak = true;
                r.modify(ctl, DEPCTL::SNAK::SET);
            }
            EpCtl::NakClr => {
                e.nak = false;
                if is_in || e.state != EpState::Idle {
                    r.modify(ctl, DEPCTL::CNAK::SET);
                } else {
                    self.core.arm_out(n, e.mps);
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
                let mut v = r.extract::<DEPCTL::Register>(ctl);
                if is_in && v.is_set(DEPCTL::EPENA) {
                    v.modify(DEPCTL::EPDIS::SET);
                }
                v.modify(DEPCTL::STALL::SET);
                r.write(ctl, v.get());
                if is_in {
                    self.core.tx_rest[n] = Default::default();
                    self.core.fifo.flush_tx(r, GRSTCTL::TXFNUM.val(n as u32));
                }
            }
            EpCtl::StallClr => {
                e.unstall();
                let mut w = DEPCTL::STALL::CLEAR + DEPCTL::EPENA::CLEAR;
                if e.ty != TransferType::Isochronous {
                    w += DEPCTL::SD0PID::SET;
                }
                r.modify(ctl, w);
                if !is_in && !e.nak {
                    self.core.arm_out(n, e.mps);
                }
            }
            EpCtl::Disable => {
                let mut v = r.extract::<DEPCTL::Register>(ctl);
                let was_enabled = v.is_set(DEPCTL::EPENA);
                v.modify(DEPCTL::USBAEP::CLEAR + DEPCTL::EPENA::CLEAR + DEPCTL::SNAK::SET);
                if was_enabled {
                    v.modify(DEPCTL::EPDIS::SET);
                }
                r.write(ctl, v.get());
                let bit = if is_in {
                    DAINT::IEP.val(1 << n)
                } else {
                    DAINT::OEP.val(1 << n)
                };
                r.clear_bits(DAINTMSK, bit.value);
                if is_in {
                    self.core.tx_rest[n] = Default::default();
                    r.clear_bits(DIEPEMPMSK, 1 << n);
                    self.core.fifo.flush_tx(r, GRSTCTL::TXFNUM.val(n as u32));
                } else if e.has_rx_pending() {
                    // Throw away what the class never drained.
                    let len = e.rx_pending;
                    self.core.fifo.pop(r, Default::default(), len);
                    r.modify(GINTMSK, GINT::RXFLVL::SET);
                }
                e.reset();
            }
        }
        Ok(())
    }

    fn ep_pkt_xmit(&mut self, ep: EpAddr, data: &[u8]) -> Result<usize> {
        let n = ep.number();
        if n == 0 || n >= Self::ep_count() {
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
        if n == 0 || n >= Self::ep_count() {
            return Err(UsbError::InvalidEndpoint);
        }
        if ep.is_in() {
            return Err(UsbError::InvalidState);
        }
        let e = &mut self.out_eps[n];
        if !e.is_configured() {
            return Err(UsbError::InvalidEndpoint);
        }
        if !e.has_rx_pending() {
            return Ok(0);
        }
        let kept = self.core.fifo.pop(&self.core.regs, cells(buf), e.rx_pending);
        e.rx_drained();
        // The endpoint is re-armed on XFRC, once the core has moved past
        // this packet.
        self.core.regs.modify(GINTMSK, GINT::RXFLVL::SET);
        Ok(kept)
    }

    fn ep_state(&self, ep: EpAddr) -> Option<EpState> {
        let n = ep.number();
        if n >= Self::ep_count() {
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
        self.core.regs.modify(DCTL, DCTL::SDIS::CLEAR);
    }

    fn disconnect(&mut self) {
        self.core.regs.modify(DCTL, DCTL::SDIS::SET);
    }

    fn remote_wakeup(&mut self) {
        let r = &self.core.regs;
        if !r.extract(DSTS).is_set(DSTS::SUSPSTS) {
            debug!("remote wakeup while not suspended");
            return;
        }
        r.modify(DCTL, DCTL::RWUSIG::SET);
        delay(REMOTE_WAKEUP_CYCLES);
        r.modify(DCTL, DCTL::RWUSIG::CLEAR);
    }
}
