// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! USB device controller drivers for STM32, written directly against the
//! registers.
//!
//! Two controller families are covered:
//!
//! - [`otg`]: the Synopsys OTG core (OTG_FS, and OTG_HS on its internal
//!   full-speed PHY) found on F2/F4/F7 parts. Packets move through push/pop
//!   FIFO windows.
//! - [`usb_fs`]: the simpler device-only block on F1/F3/F0/L0 parts. Packets
//!   live in a dedicated packet memory, optionally double-buffered.
//!
//! Both drivers share the parts that have nothing to do with registers: the
//! per-endpoint transfer state machine in [`endpoint`] (packet splitting, ZLP
//! rules, backpressure) and the EP0 control-transfer sequencer in
//! [`control`]. Each driver only has to say how to load a packet, arm a
//! receive, read a packet and stall.
//!
//! # Using a driver
//!
//! The board code owns the driver and a class, and calls `isr` from the USB
//! interrupt:
//!
//! ```ignore
//! let mut usb = unsafe { OtgDev::<_, OtgFs, MyClass>::steal(OtgConfig::DEFAULT) };
//! usb.dev_init()?;
//! // ...in the interrupt handler:
//! usb.isr(&mut class);
//! ```
//!
//! Everything the class does happens in callbacks made from inside `isr`. On
//! every bus reset the class gets [`Class::on_reset`] and must configure EP0
//! with [`UsbDev::ep_init`], handing over a SETUP handler and a buffer for
//! control data. It then answers control requests from that handler, and
//! configures the rest of its endpoints when the host sets a configuration.
//!
//! Nothing here answers standard requests on the class's behalf: descriptor
//! requests, `SET_CONFIGURATION` and friends all reach the class's SETUP
//! handler. [`setup`] and [`descriptor`] have the wire formats it needs.
//! The only request the drivers act on themselves is `SET_ADDRESS`, because
//! its timing is a hardware matter.
//!
//! # Logging
//!
//! The drivers log through the [`log`] facade: per-packet detail at `trace`,
//! control requests and endpoint changes at `debug`, bus events at `info`, and
//! anything that loses data or looks wrong at `warn` or above. Nothing is
//! emitted until the application installs a logger.

#![cfg_attr(not(test), no_std)]

pub mod class;
pub mod control;
pub mod descriptor;
pub mod endpoint;
pub mod error;
pub mod otg;
pub mod reg;
pub mod setup;
pub mod usb_fs;

pub use class::{cells, Class, EpCtl, EpEvent, EpHandler, UsbDev};
pub use endpoint::EpState;
pub use error::{Result, Stall, UsbError};
pub use otg::{OtgConfig, OtgDev, OtgFs, OtgHs, OtgPeripheral};
pub use reg::{Mmio, Regs};
pub use setup::{Direction, EpAddr, SetupPacket, TransferType};
pub use usb_fs::pma::PmaLayout;
pub use usb_fs::{UsbFsConfig, UsbFsDev};
