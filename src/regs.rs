//! Register facade shared by the memory-mapped backends.
//!
//! EFM32 Series 0/1 parts only offer plain read/write registers, so bit updates need a
//! read-modify-write. Series 2 parts mirror every peripheral at `+0x1000` (set) and `+0x2000`
//! (clear), which makes single-bit updates atomic without masking interrupts. Backends are generic
//! over [`Generation`] so the choice is made at compile time.

use core::ptr;

/// A single 32-bit memory-mapped register.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Reg(*mut u32);

unsafe impl Send for Reg {}
unsafe impl Sync for Reg {}

impl Reg {
    /// # Safety
    ///
    /// `addr` must point at a 32-bit register (or word-aligned RAM) valid for the lifetime of all
    /// copies of the returned value.
    pub const unsafe fn new(addr: usize) -> Self {
        Self(addr as *mut u32)
    }

    pub fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub fn read(self) -> u32 {
        unsafe { ptr::read_volatile(self.0) }
    }

    #[inline]
    pub fn write(self, value: u32) {
        unsafe { ptr::write_volatile(self.0, value) }
    }

    /// Read-modify-write inside a critical section.
    pub fn modify(self, f: impl FnOnce(u32) -> u32) {
        critical_section::with(|_| self.write(f(self.read())))
    }

    /// Register at a byte offset from this one.
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.addr().wrapping_add(bytes) as *mut u32)
    }
}

/// Base address of a peripheral register block.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Block(usize);

impl Block {
    /// # Safety
    ///
    /// `base` must be the start of the peripheral's register block.
    pub const unsafe fn new(base: usize) -> Self {
        Self(base)
    }

    pub fn base(self) -> usize {
        self.0
    }

    #[inline]
    pub fn reg(self, offset: usize) -> Reg {
        unsafe { Reg::new(self.0 + offset) }
    }
}

/// Bit update strategy of a hardware generation.
pub trait Generation: 'static {
    fn set_bits(reg: Reg, mask: u32);
    fn clear_bits(reg: Reg, mask: u32);

    fn write_bits(reg: Reg, mask: u32, on: bool) {
        if on {
            Self::set_bits(reg, mask)
        } else {
            Self::clear_bits(reg, mask)
        }
    }
}

/// Series 0 and Series 1 parts.
pub enum Classic {}

/// Series 2 parts with SET/CLR alias regions.
pub enum Series2 {}

pub(crate) const SET_ALIAS: usize = 0x1000;
pub(crate) const CLR_ALIAS: usize = 0x2000;

impl Generation for Classic {
    fn set_bits(reg: Reg, mask: u32) {
        reg.modify(|v| v | mask)
    }

    fn clear_bits(reg: Reg, mask: u32) {
        reg.modify(|v| v & !mask)
    }
}

impl Generation for Series2 {
    fn set_bits(reg: Reg, mask: u32) {
        reg.offset(SET_ALIAS).write(mask)
    }

    fn clear_bits(reg: Reg, mask: u32) {
        reg.offset(CLR_ALIAS).write(mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classic_updates_in_place() {
        let mut word = 0b1001u32;
        let reg = unsafe { Reg::new(&mut word as *mut u32 as usize) };
        Classic::set_bits(reg, 0b0110);
        assert_eq!(reg.read(), 0b1111);
        Classic::clear_bits(reg, 0b1010);
        assert_eq!(reg.read(), 0b0101);
    }

    #[test]
    fn series2_writes_alias_registers() {
        let mut block = vec![0u32; (CLR_ALIAS + 0x100) / 4];
        let base = block.as_mut_ptr() as usize;
        let reg = unsafe { Block::new(base) }.reg(0x08);

        Series2::write_bits(reg, 0x30, true);
        Series2::write_bits(reg, 0x01, false);

        assert_eq!(block[0x08 / 4], 0);
        assert_eq!(block[(SET_ALIAS + 0x08) / 4], 0x30);
        assert_eq!(block[(CLR_ALIAS + 0x08) / 4], 0x01);
    }
}
