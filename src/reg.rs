// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Register access layer.
//!
//! Every peripheral in this crate is reached through the [`Regs`] trait, which
//! deals in plain `u32` values at byte offsets from a base address. On silicon
//! that's [`Mmio`]; in tests it's a simulated register file. Bit fields are
//! declared with `tock_registers::register_bitfields!` in each driver's
//! register map, and values pass between the two as `LocalRegisterCopy` and
//! `FieldValue`.

use tock_registers::fields::FieldValue;
use tock_registers::{LocalRegisterCopy, RegisterLongName};

/// Access to a block of 32-bit registers.
///
/// Methods take `&self` because registers are shared, externally mutable
/// state, just like the PAC register blocks they replace.
pub trait Regs {
    /// Reads the register at byte offset `off`.
    fn read(&self, off: usize) -> u32;

    /// Writes `value` to the register at byte offset `off`.
    fn write(&self, off: usize, value: u32);

    /// Reads the halfword at byte offset `off`, which must be 2-aligned.
    /// Packet memory on some parts only decodes 16-bit accesses, so `Mmio`
    /// overrides this with a real halfword load.
    fn read16(&self, off: usize) -> u16 {
        let word = self.read(off & !3);
        (word >> ((off & 2) * 8)) as u16
    }

    /// Writes the halfword at byte offset `off`, which must be 2-aligned.
    fn write16(&self, off: usize, value: u16) {
        let shift = (off & 2) * 8;
        let word = self.read(off & !3) & !(0xFFFF << shift);
        self.write(off & !3, word | (u32::from(value) << shift));
    }

    /// Reads the register at `off` as a typed copy, for field access.
    #[inline]
    fn extract<F: RegisterLongName>(&self, off: usize) -> LocalRegisterCopy<u32, F>
    where
        Self: Sized,
    {
        LocalRegisterCopy::new(self.read(off))
    }

    /// Writes `fields`, with every bit they don't name written as zero.
    #[inline]
    fn write_fields<F: RegisterLongName>(&self, off: usize, fields: FieldValue<u32, F>)
    where
        Self: Sized,
    {
        self.write(off, fields.value);
    }

    /// Read-modify-write of the fields named in `fields`. Note that this is
    /// _not_ safe to use on registers with write-1-to-clear or toggle bits.
    #[inline]
    fn modify<F: RegisterLongName>(&self, off: usize, fields: FieldValue<u32, F>)
    where
        Self: Sized,
    {
        let v = self.read(off);
        self.write(off, fields.modify(v));
    }

    /// Sets the bits in `mask`, leaving the rest alone. For the per-endpoint
    /// bitmap registers, where a field write would clobber the neighbours.
    #[inline]
    fn set_bits(&self, off: usize, mask: u32)
    where
        Self: Sized,
    {
        let v = self.read(off);
        self.write(off, v | mask);
    }

    /// Clears the bits in `mask`, leaving the rest alone.
    #[inline]
    fn clear_bits(&self, off: usize, mask: u32)
    where
        Self: Sized,
    {
        let v = self.read(off);
        self.write(off, v & !mask);
    }
}

impl<R: Regs> Regs for &R {
    #[inline]
    fn read(&self, off: usize) -> u32 {
        (**self).read(off)
    }

    #[inline]
    fn write(&self, off: usize, value: u32) {
        (**self).write(off, value)
    }

    #[inline]
    fn read16(&self, off: usize) -> u16 {
        (**self).read16(off)
    }

    #[inline]
    fn write16(&self, off: usize, value: u16) {
        (**self).write16(off, value)
    }
}

/// Memory-mapped register block at a fixed physical address.
#[derive(Copy, Clone, Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Wraps the register block at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the address of a peripheral register block that stays
    /// mapped for the life of the program, and nothing else may be driving
    /// that peripheral.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub const fn base(&self) -> usize {
        self.base
    }
}

impl Regs for Mmio {
    #[inline]
    fn read(&self, off: usize) -> u32 {
        // Safety: `new` requires the block to be mapped, and offsets come
        // from this crate's register maps.
        unsafe { core::ptr::read_volatile((self.base + off) as *const u32) }
    }

    #[inline]
    fn write(&self, off: usize, value: u32) {
        // Safety: as for `read`.
        unsafe { core::ptr::write_volatile((self.base + off) as *mut u32, value) }
    }

    #[inline]
    fn read16(&self, off: usize) -> u16 {
        // Safety: as for `read`.
        unsafe { core::ptr::read_volatile((self.base + off) as *const u16) }
    }

    #[inline]
    fn write16(&self, off: usize, value: u16) {
        // Safety: as for `read`.
        unsafe { core::ptr::write_volatile((self.base + off) as *mut u16, value) }
    }
}

/// Spin for roughly `cycles` CPU cycles. Used for the handful of settling
/// delays the reference manuals ask for.
#[inline]
pub(crate) fn delay(cycles: u32) {
    cfg_if::cfg_if! {
        if #[cfg(all(target_arch = "arm", target_os = "none"))] {
            cortex_m::asm::delay(cycles);
        } else {
            for _ in 0..cycles.min(64) {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tock_registers::register_bitfields;

    register_bitfields![u32,
        CTL [
            EN OFFSET(0) NUMBITS(1) [],
            MODE OFFSET(4) NUMBITS(3) [
                Idle = 0,
                Run = 5
            ],
            BUSY OFFSET(31) NUMBITS(1) []
        ]
    ];

    struct Word(core::cell::Cell<u32>);

    impl Regs for Word {
        fn read(&self, _off: usize) -> u32 {
            self.0.get()
        }

        fn write(&self, _off: usize, value: u32) {
            self.0.set(value)
        }
    }

    #[test]
    fn halfword_access_on_word_registers() {
        let w = Word(core::cell::Cell::new(0x1122_3344));
        assert_eq!(w.read16(0), 0x3344);
        assert_eq!(w.read16(2), 0x1122);
        w.write16(2, 0xABCD);
        assert_eq!(w.0.get(), 0xABCD_3344);
    }

    #[test]
    fn modify_touches_only_named_fields() {
        let w = Word(core::cell::Cell::new(0xFFFF_FF0F));
        w.modify(0, CTL::MODE::Run + CTL::EN::CLEAR);
        assert_eq!(w.0.get(), 0xFFFF_FF5E);
        assert_eq!(w.extract::<CTL::Register>(0).read(CTL::MODE), 5);
        assert!(w.extract::<CTL::Register>(0).is_set(CTL::BUSY));
    }

    #[test]
    fn write_fields_zeroes_the_rest() {
        let w = Word(core::cell::Cell::new(u32::MAX));
        w.write_fields(0, CTL::EN::SET + CTL::MODE::Idle);
        assert_eq!(w.0.get(), 1);
        let v = w.extract::<CTL::Register>(0);
        assert!(!v.is_set(CTL::BUSY));
        assert_eq!(v.read_as_enum(CTL::MODE), Some(CTL::MODE::Value::Idle));
    }

    #[test]
    fn bitmap_helpers() {
        let w = Word(core::cell::Cell::new(0x10));
        w.set_bits(0, 1 << 3 | 1 << 20);
        w.clear_bits(0, 0x10);
        assert_eq!(w.0.get(), 1 << 3 | 1 << 20);
    }
}
