// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB structure and constant definitions shared by every controller: the
//! SETUP packet, standard request codes, directions and endpoint addresses.

use byteorder::LittleEndian;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, LayoutVerified, Unaligned, U16};

/// USB deals in two different transfer directions, called OUT (host-to-device)
/// and IN (device-to-host). In the vast majority of cases, OUT is represented
/// by a 0 byte, and IN by an `0x80` byte.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Direction {
    Out = 0,
    In = 0x80,
}

impl Direction {
    pub const fn endpoint(self, num: u8) -> EpAddr {
        EpAddr(num & 0x0F | self as u8)
    }

    pub const fn of_endpoint_addr(addr: u8) -> Self {
        if addr & Self::In as u8 != 0 {
            Self::In
        } else {
            Self::Out
        }
    }
}

/// An endpoint address: bottom 4 bits are the endpoint number, the top bit
/// is the direction. This doubles as the endpoint id handed out by
/// `ep_init`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EpAddr(pub u8);

impl EpAddr {
    pub const EP0_OUT: EpAddr = Direction::Out.endpoint(0);
    pub const EP0_IN: EpAddr = Direction::In.endpoint(0);

    pub const fn number(self) -> usize {
        (self.0 & 0x0F) as usize
    }

    pub const fn direction(self) -> Direction {
        Direction::of_endpoint_addr(self.0)
    }

    pub const fn is_in(self) -> bool {
        self.0 & Direction::In as u8 != 0
    }
}

impl From<u8> for EpAddr {
    fn from(v: u8) -> Self {
        EpAddr(v)
    }
}

/// Layout of an 8-byte USB SETUP packet.
#[repr(C)]
#[derive(Copy, Clone, Debug, AsBytes, FromBytes, Unaligned)]
pub struct SetupPacket {
    /// Request type: direction in bit 7, kind (standard/class/vendor) in bits
    /// 6:5, recipient in bits 4:0.
    pub request_type: u8,
    /// Request. Standard setup requests are in the `Request` enum.
    pub request: u8,
    /// A simple argument of up to 16 bits, specific to the request.
    pub value: U16<LittleEndian>,
    /// Usually an interface or endpoint number.
    pub index: U16<LittleEndian>,
    /// If data will be transferred after this request (in the direction given
    /// by `request_type`), this gives the number of bytes (OUT) or maximum
    /// number of bytes (IN).
    pub length: U16<LittleEndian>,
}

impl SetupPacket {
    pub const LEN: usize = 8;

    /// Reinterprets 8 bytes received from the wire. Returns `None` if the
    /// slice isn't exactly 8 bytes long.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        LayoutVerified::<_, SetupPacket>::new_unaligned(bytes).map(|lv| *lv.into_ref())
    }

    pub fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        Self {
            request_type,
            request,
            value: U16::new(value),
            index: U16::new(index),
            length: U16::new(length),
        }
    }

    pub fn direction(&self) -> Direction {
        Direction::of_endpoint_addr(self.request_type)
    }

    pub fn kind(&self) -> Option<RequestKind> {
        RequestKind::from_u8((self.request_type >> 5) & 0b11)
    }

    pub fn recipient(&self) -> Option<Recipient> {
        Recipient::from_u8(self.request_type & 0x1F)
    }

    /// Decodes the request code, if this is a standard request we know.
    pub fn standard_request(&self) -> Option<Request> {
        match self.kind() {
            Some(RequestKind::Standard) => Request::from_u8(self.request),
            _ => None,
        }
    }

    pub fn length(&self) -> usize {
        usize::from(self.length.get())
    }
}

impl PartialEq for SetupPacket {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SetupPacket {}

/// Bits 6:5 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum RequestKind {
    Standard = 0,
    Class = 1,
    Vendor = 2,
}

/// Bits 4:0 of `request_type`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Recipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
}

/// Standard device requests (USB 2.0 table 9-4).
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    /// Notifies the device that it's being moved to a different address on the
    /// bus. Always an OUT with no data stage.
    SetAddress = 0x05,
    /// Asks the device to send a certain descriptor back to the host. Always
    /// used on an IN request.
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    /// Configures a device by choosing one of the options listed in its
    /// descriptors. Always an OUT.
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Feature selectors for `SetFeature`/`ClearFeature`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Feature {
    EndpointHalt = 0,
    DeviceRemoteWakeup = 1,
    TestMode = 2,
}

/// Types of transfer that can be indicated by the `attributes` field on
/// `EndpointDescriptor`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, AsBytes)]
#[repr(u8)]
pub enum TransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferType {
    /// Decodes the bottom 2 bits of an endpoint descriptor's attributes.
    pub fn from_attributes(attr: u8) -> Self {
        match attr & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }
}
