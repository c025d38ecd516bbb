// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! OTG_FS / OTG_HS register map, device mode only. Offsets are from the
//! peripheral base.

use tock_registers::register_bitfields;

// Core global registers.
pub const GAHBCFG: usize = 0x008;
pub const GUSBCFG: usize = 0x00C;
pub const GRSTCTL: usize = 0x010;
pub const GINTSTS: usize = 0x014;
pub const GINTMSK: usize = 0x018;
pub const GRXSTSP: usize = 0x020;
pub const GRXFSIZ: usize = 0x024;
pub const DIEPTXF0: usize = 0x028;
pub const GCCFG: usize = 0x038;
pub const CID: usize = 0x03C;

// Device registers.
pub const DCFG: usize = 0x800;
pub const DCTL: usize = 0x804;
pub const DSTS: usize = 0x808;
pub const DIEPMSK: usize = 0x810;
pub const DOEPMSK: usize = 0x814;
pub const DAINT: usize = 0x818;
pub const DAINTMSK: usize = 0x81C;
pub const DIEPEMPMSK: usize = 0x834;

pub const PCGCCTL: usize = 0xE00;

/// Transmit FIFO size register for IN endpoint `n`. EP0's lives among the
/// global registers.
pub const fn dieptxf(n: usize) -> usize {
    if n == 0 {
        DIEPTXF0
    } else {
        0x104 + (n - 1) * 4
    }
}

pub const fn diepctl(n: usize) -> usize {
    0x900 + n * 0x20
}

pub const fn diepint(n: usize) -> usize {
    0x908 + n * 0x20
}

pub const fn dieptsiz(n: usize) -> usize {
    0x910 + n * 0x20
}

pub const fn dtxfsts(n: usize) -> usize {
    0x918 + n * 0x20
}

pub const fn doepctl(n: usize) -> usize {
    0xB00 + n * 0x20
}

pub const fn doepint(n: usize) -> usize {
    0xB08 + n * 0x20
}

pub const fn doeptsiz(n: usize) -> usize {
    0xB10 + n * 0x20
}

/// Push (IN endpoint `n`) / pop (any) window for the data FIFOs.
pub const fn fifo(n: usize) -> usize {
    0x1000 * (n + 1)
}

register_bitfields![u32,
    pub GAHBCFG [
        GINT OFFSET(0) NUMBITS(1) [],
        /// TXFE fires when the IN FIFO is completely empty rather than half.
        TXFELVL OFFSET(7) NUMBITS(1) []
    ],
    pub GUSBCFG [
        TOCAL OFFSET(0) NUMBITS(3) [],
        PHYSEL OFFSET(6) NUMBITS(1) [],
        TRDT OFFSET(10) NUMBITS(4) [],
        FHMOD OFFSET(29) NUMBITS(1) [],
        FDMOD OFFSET(30) NUMBITS(1) []
    ],
    pub GRSTCTL [
        CSRST OFFSET(0) NUMBITS(1) [],
        RXFFLSH OFFSET(4) NUMBITS(1) [],
        TXFFLSH OFFSET(5) NUMBITS(1) [],
        TXFNUM OFFSET(6) NUMBITS(5) [
            All = 0x10
        ],
        AHBIDL OFFSET(31) NUMBITS(1) []
    ],
    /// Bits shared by GINTSTS and GINTMSK.
    pub GINT [
        RXFLVL OFFSET(4) NUMBITS(1) [],
        USBSUSP OFFSET(11) NUMBITS(1) [],
        USBRST OFFSET(12) NUMBITS(1) [],
        ENUMDNE OFFSET(13) NUMBITS(1) [],
        ISOODRP OFFSET(14) NUMBITS(1) [],
        IEPINT OFFSET(18) NUMBITS(1) [],
        OEPINT OFFSET(19) NUMBITS(1) [],
        IISOIXFR OFFSET(20) NUMBITS(1) [],
        INCOMPISOOUT OFFSET(21) NUMBITS(1) [],
        WKUPINT OFFSET(31) NUMBITS(1) []
    ],
    pub GRXSTS [
        EPNUM OFFSET(0) NUMBITS(4) [],
        BCNT OFFSET(4) NUMBITS(11) [],
        PKTSTS OFFSET(17) NUMBITS(4) [
            GlobalNak = 1,
            OutData = 2,
            OutComplete = 3,
            SetupComplete = 4,
            SetupData = 6
        ]
    ],
    pub GCCFG [
        PWRDWN OFFSET(16) NUMBITS(1) [],
        VBUSBSEN OFFSET(19) NUMBITS(1) [],
        NOVBUSSENS OFFSET(21) NUMBITS(1) []
    ],
    pub DCFG [
        DSPD OFFSET(0) NUMBITS(2) [
            /// Full speed using the on-chip PHY.
            FullSpeed = 3
        ],
        DAD OFFSET(4) NUMBITS(7) []
    ],
    pub DCTL [
        RWUSIG OFFSET(0) NUMBITS(1) [],
        SDIS OFFSET(1) NUMBITS(1) [],
        CGINAK OFFSET(8) NUMBITS(1) []
    ],
    pub DSTS [
        SUSPSTS OFFSET(0) NUMBITS(1) [],
        ENUMSPD OFFSET(1) NUMBITS(2) []
    ],
    /// DAINT and DAINTMSK: one bit per endpoint and direction.
    pub DAINT [
        IEP OFFSET(0) NUMBITS(16) [],
        OEP OFFSET(16) NUMBITS(16) []
    ],
    /// Bits shared by DIEPCTLx and DOEPCTLx.
    pub DEPCTL [
        /// A byte count, except on EP0 where it's the 2-bit code from
        /// `ep0_mps_code`.
        MPSIZ OFFSET(0) NUMBITS(11) [],
        USBAEP OFFSET(15) NUMBITS(1) [],
        NAKSTS OFFSET(17) NUMBITS(1) [],
        EPTYP OFFSET(18) NUMBITS(2) [],
        STALL OFFSET(21) NUMBITS(1) [],
        TXFNUM OFFSET(22) NUMBITS(4) [],
        CNAK OFFSET(26) NUMBITS(1) [],
        SNAK OFFSET(27) NUMBITS(1) [],
        SD0PID OFFSET(28) NUMBITS(1) [],
        SODDFRM OFFSET(29) NUMBITS(1) [],
        EPDIS OFFSET(30) NUMBITS(1) [],
        EPENA OFFSET(31) NUMBITS(1) []
    ],
    pub DIEPINT [
        XFRC OFFSET(0) NUMBITS(1) [],
        EPDISD OFFSET(1) NUMBITS(1) [],
        TOC OFFSET(3) NUMBITS(1) [],
        INEPNE OFFSET(6) NUMBITS(1) [],
        /// Read-only level: the endpoint's FIFO is empty.
        TXFE OFFSET(7) NUMBITS(1) []
    ],
    pub DOEPINT [
        XFRC OFFSET(0) NUMBITS(1) [],
        EPDISD OFFSET(1) NUMBITS(1) [],
        STUP OFFSET(3) NUMBITS(1) []
    ],
    /// Bits shared by DIEPTSIZx and DOEPTSIZx. EP0 implements only the low
    /// bits of each count, which is all a single packet needs.
    pub DEPTSIZ [
        XFRSIZ OFFSET(0) NUMBITS(19) [],
        PKTCNT OFFSET(19) NUMBITS(10) [],
        /// OUT EP0 only: back-to-back SETUP packets the core may accept.
        STUPCNT OFFSET(29) NUMBITS(2) []
    ],
    pub DTXFSTS [
        /// Free space in the IN FIFO, in words.
        INEPTFSAV OFFSET(0) NUMBITS(16) []
    ],
    pub DIEPTXF [
        START OFFSET(0) NUMBITS(16) [],
        DEPTH OFFSET(16) NUMBITS(16) []
    ]
];

/// Interrupts acknowledged on every IN endpoint at bus reset: everything
/// but the read-only TXFE and INEPNE.
pub const DIEPINT_ALL: u32 = 0xFB7F & !(DIEPINT::TXFE::SET.value | DIEPINT::INEPNE::SET.value);
pub const DOEPINT_ALL: u32 = 0xFB7F;
