// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared pieces of the driver tests: simulated silicon for both controller
//! families, and a loopback class driver to put on top of them.
//!
//! The class is the classic low-level USB loopback device: EP1 OUT receives
//! data, EP2 IN sends it back. It answers just enough standard requests to
//! be enumerated, plus two vendor requests for exercising control writes and
//! reads.

#![allow(dead_code)]

pub mod fs_sim;
pub mod otg_sim;

use std::cell::Cell;

use stm32_usbdev::class::copy_to_cells;
use stm32_usbdev::descriptor::{
    ConfigurationDescriptor, DescriptorType, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
use stm32_usbdev::setup::{Request, RequestKind};
use stm32_usbdev::{
    cells, Class, EpAddr, EpHandler, SetupPacket, Stall, TransferType, UsbDev, UsbError,
};
use zerocopy::{AsBytes, U16};

/// What the host got back for a transaction.
#[derive(Debug, PartialEq, Eq)]
pub enum Handshake {
    Ack(Vec<u8>),
    Nak,
    Stall,
}

impl Handshake {
    #[track_caller]
    pub fn data(self) -> Vec<u8> {
        match self {
            Handshake::Ack(d) => d,
            other => panic!("expected data, got {:?}", other),
        }
    }
}

pub const EP_OUT: EpAddr = EpAddr(0x01);
pub const EP_IN: EpAddr = EpAddr(0x82);

/// Vendor control write: the data stage is kept in `control_data`.
pub const VENDOR_WRITE: u8 = 0x01;
/// Vendor control read: answered from `vendor_reply`.
pub const VENDOR_READ: u8 = 0x02;

pub fn leak(len: usize) -> &'static [Cell<u8>] {
    cells(Box::leak(vec![0u8; len].into_boxed_slice()))
}

pub struct Loopback {
    pub ep0_buf: &'static [Cell<u8>],
    pub in_buf: &'static [Cell<u8>],
    pub ep0_mps: u16,
    pub data_ty: TransferType,
    pub data_mps: u16,
    /// Drain OUT packets from inside `on_out`.
    pub drain: bool,
    /// Size of the buffer handed to `ep_pkt_recv`.
    pub rx_len: usize,
    /// Send every drained OUT packet straight back on EP_IN.
    pub echo: bool,
    pub vendor_reply: Vec<u8>,

    pub resets: usize,
    pub suspends: usize,
    pub wakeups: usize,
    pub in_done: usize,
    pub out_lens: Vec<usize>,
    pub received: Vec<u8>,
    pub setups: Vec<SetupPacket>,
    /// Length of the data slice each SETUP handler call was given.
    pub setup_data_lens: Vec<usize>,
    pub statuses: Vec<SetupPacket>,
    pub control_data: Vec<u8>,
    pub errors: Vec<UsbError>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            ep0_buf: leak(256),
            in_buf: leak(1024),
            ep0_mps: 64,
            data_ty: TransferType::Bulk,
            data_mps: 64,
            drain: true,
            rx_len: 1024,
            echo: false,
            vendor_reply: Vec::new(),
            resets: 0,
            suspends: 0,
            wakeups: 0,
            in_done: 0,
            out_lens: Vec::new(),
            received: Vec::new(),
            setups: Vec::new(),
            setup_data_lens: Vec::new(),
            statuses: Vec::new(),
            control_data: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn device_descriptor(&self) -> Vec<u8> {
        DeviceDescriptor {
            length: 18,
            descriptor_type: DescriptorType::Device,
            bcd_usb: U16::new(0x0200),
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: self.ep0_mps as u8,
            vendor: U16::new(0x1209),
            product: U16::new(0x0001),
            bcd_device: U16::new(0x0100),
            manufacturer_s: 0,
            product_s: 0,
            serial_s: 0,
            num_configurations: 1,
        }
        .as_bytes()
        .to_vec()
    }

    pub fn config_descriptor(&self) -> Vec<u8> {
        let out = EndpointDescriptor::new(EP_OUT, self.data_ty, self.data_mps, 0);
        let inn = EndpointDescriptor::new(EP_IN, self.data_ty, self.data_mps, 0);
        let iface = InterfaceDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Interface,
            interface_number: 0,
            alternate_setting: 0,
            num_endpoints: 2,
            interface_class: 0xFF,
            interface_subclass: 0,
            interface_protocol: 0,
            interface_s: 0,
        };
        let total = 9 + 9 + 7 + 7;
        let config = ConfigurationDescriptor {
            length: 9,
            descriptor_type: DescriptorType::Config,
            total_length: U16::new(total),
            num_interfaces: 1,
            configuration_value: 1,
            configuration_s: 0,
            attributes: 0xC0,
            max_power: 50,
        };
        let mut v = Vec::new();
        v.extend_from_slice(config.as_bytes());
        v.extend_from_slice(iface.as_bytes());
        v.extend_from_slice(out.as_bytes());
        v.extend_from_slice(inn.as_bytes());
        v
    }

    fn configure(&mut self, dev: &mut dyn UsbDev<'static, Loopback>) {
        let out = EndpointDescriptor::new(EP_OUT, self.data_ty, self.data_mps, 0);
        let inn = EndpointDescriptor::new(EP_IN, self.data_ty, self.data_mps, 0);
        if let Err(e) = dev.ep_init(&out, EpHandler::Out(on_out), Default::default()) {
            self.errors.push(e);
        }
        if let Err(e) = dev.ep_init(&inn, EpHandler::In(on_in), self.in_buf) {
            self.errors.push(e);
        }
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Class<'static> for Loopback {
    fn on_reset(&mut self, dev: &mut dyn UsbDev<'static, Self>) {
        self.resets += 1;
        let ep0 = EndpointDescriptor::new(EpAddr::EP0_OUT, TransferType::Control, self.ep0_mps, 0);
        if let Err(e) = dev.ep_init(&ep0, EpHandler::Setup(on_setup), self.ep0_buf) {
            self.errors.push(e);
        }
    }

    fn on_suspend(&mut self, _dev: &mut dyn UsbDev<'static, Self>) {
        self.suspends += 1;
    }

    fn on_wakeup(&mut self, _dev: &mut dyn UsbDev<'static, Self>) {
        self.wakeups += 1;
    }

    fn on_status(&mut self, _dev: &mut dyn UsbDev<'static, Self>, req: &SetupPacket) {
        self.statuses.push(*req);
    }
}

fn on_setup(
    c: &mut Loopback,
    dev: &mut dyn UsbDev<'static, Loopback>,
    req: &SetupPacket,
    data: &'static [Cell<u8>],
) -> Result<usize, Stall> {
    c.setups.push(*req);
    c.setup_data_lens.push(data.len());
    match req.kind() {
        Some(RequestKind::Standard) => {}
        Some(RequestKind::Vendor) => {
            return match req.request {
                VENDOR_WRITE => {
                    c.control_data = data.iter().map(Cell::get).collect();
                    Ok(0)
                }
                VENDOR_READ => Ok(copy_to_cells(data, &c.vendor_reply)),
                _ => Err(Stall),
            };
        }
        _ => return Err(Stall),
    }
    match req.standard_request() {
        Some(Request::GetDescriptor) => {
            let bytes = match (req.value.get() >> 8) as u8 {
                t if t == DescriptorType::Device as u8 => c.device_descriptor(),
                t if t == DescriptorType::Config as u8 => c.config_descriptor(),
                _ => return Err(Stall),
            };
            Ok(copy_to_cells(data, &bytes))
        }
        Some(Request::SetAddress) => Ok(0),
        Some(Request::SetConfiguration) => {
            c.configure(dev);
            Ok(0)
        }
        _ => Err(Stall),
    }
}

fn on_in(c: &mut Loopback, _dev: &mut dyn UsbDev<'static, Loopback>, _ep: EpAddr) {
    c.in_done += 1;
}

fn on_out(c: &mut Loopback, dev: &mut dyn UsbDev<'static, Loopback>, ep: EpAddr, len: usize) {
    c.out_lens.push(len);
    if !c.drain {
        return;
    }
    let mut buf = vec![0u8; c.rx_len];
    match dev.ep_pkt_recv(ep, &mut buf) {
        Ok(n) => {
            buf.truncate(n);
            if c.echo {
                if let Err(e) = dev.ep_pkt_xmit(EP_IN, &buf) {
                    c.errors.push(e);
                }
            }
            c.received.extend(buf);
        }
        Err(e) => c.errors.push(e),
    }
}

/// A SETUP packet as it goes on the wire.
pub fn request(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> [u8; 8] {
    let mut b = [0u8; 8];
    b.copy_from_slice(SetupPacket::new(request_type, request, value, index, length).as_bytes());
    b
}

pub fn get_descriptor(ty: DescriptorType, length: u16) -> [u8; 8] {
    request(0x80, Request::GetDescriptor as u8, (ty as u16) << 8, 0, length)
}

pub fn set_address(addr: u16) -> [u8; 8] {
    request(0x00, Request::SetAddress as u8, addr, 0, 0)
}

pub fn set_configuration(value: u16) -> [u8; 8] {
    request(0x00, Request::SetConfiguration as u8, value, 0, 0)
}

pub fn vendor_write(length: u16) -> [u8; 8] {
    request(0x40, VENDOR_WRITE, 0, 0, length)
}

pub fn vendor_read(length: u16) -> [u8; 8] {
    request(0xC0, VENDOR_READ, 0, 0, length)
}
