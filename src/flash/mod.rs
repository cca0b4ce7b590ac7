//! Flash memory controller (MSC)
//!
//! Word programming with read-back verification, page erase, and a low-latency page erase that
//! runs from the idle loop right before the core would sleep anyway. A page erase stalls every
//! flash fetch for tens of milliseconds, so deferring it into an idle window keeps interrupt
//! latency intact for the rest of the firmware.
use embedded_storage::nor_flash::{NorFlashError, NorFlashErrorKind};

mod msc;
pub use msc::*;

/// Read size (always 1)
pub const READ_SIZE: usize = 1;
/// Programming granularity of the controller.
pub const WRITE_SIZE: usize = 4;

/// Flash error
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The range overlaps the bootloader.
    Protected,
    Size,
    Unaligned,
    /// A word did not read back as written.
    Prog,
    /// A page did not read back erased.
    Erase,
    Timeout,
}

impl NorFlashError for Error {
    fn kind(&self) -> NorFlashErrorKind {
        match self {
            Self::Size => NorFlashErrorKind::OutOfBounds,
            Self::Unaligned => NorFlashErrorKind::NotAligned,
            _ => NorFlashErrorKind::Other,
        }
    }
}

/// Flash layout.
#[non_exhaustive]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Absolute address of the first flash byte.
    pub base: u32,
    /// First address past the bootloader. Nothing below it is ever written or erased.
    pub boot_end: u32,
    /// Flash size in bytes.
    pub flash_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base: 0,
            boot_end: 0,
            flash_size: 256 * 1024,
        }
    }
}

/// MSC register access.
///
/// Commands act on the address most recently latched with [`load_address`](MscRegs::load_address).
pub trait MscRegs {
    /// Erase page size in bytes, a power of two.
    const PAGE_SIZE: u32;

    /// Unlock the controller and enable writes.
    fn unlock(&self);
    /// Disable writes and lock the controller.
    fn lock(&self);
    /// Latch the target address (`ADDRB` + `LADDRIM`).
    fn load_address(&self, address: u32);
    /// Program one word at the latched address (`WDATA` + `WRITEONCE`).
    fn write_once(&self, word: u32);
    /// Start erasing the latched page.
    fn erase_page(&self);
    /// Abort a running erase.
    fn erase_abort(&self);
    fn is_busy(&self) -> bool;
    /// Enable or disable the erase-complete interrupt as a wake source, clearing its flag.
    fn set_erase_wake(&self, enabled: bool);
    /// Sleep until any interrupt is pending.
    ///
    /// The erase command and this wait must execute from RAM, otherwise the core stalls on the
    /// first flash fetch and the erase can no longer be aborted.
    fn wait_for_interrupt(&self);
    fn read_word(&self, address: u32) -> u32;
}

impl<T: MscRegs> MscRegs for &T {
    const PAGE_SIZE: u32 = T::PAGE_SIZE;

    fn unlock(&self) {
        T::unlock(self)
    }
    fn lock(&self) {
        T::lock(self)
    }
    fn load_address(&self, address: u32) {
        T::load_address(self, address)
    }
    fn write_once(&self, word: u32) {
        T::write_once(self, word)
    }
    fn erase_page(&self) {
        T::erase_page(self)
    }
    fn erase_abort(&self) {
        T::erase_abort(self)
    }
    fn is_busy(&self) -> bool {
        T::is_busy(self)
    }
    fn set_erase_wake(&self, enabled: bool) {
        T::set_erase_wake(self, enabled)
    }
    fn wait_for_interrupt(&self) {
        T::wait_for_interrupt(self)
    }
    fn read_word(&self, address: u32) -> u32 {
        T::read_word(self, address)
    }
}

/// Bits of a word that a write of `len` bytes at byte `offset` leaves untouched.
///
/// Flash programming can only clear bits, so untouched bytes are written as `0xFF`.
pub(crate) const fn fill_mask(offset: usize, len: usize) -> u32 {
    let mut mask = 0u32;
    let mut i = 0;
    while i < 4 {
        if i < offset || i >= offset + len {
            mask |= 0xFF << (i * 8);
        }
        i += 1;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_cover_untouched_bytes() {
        assert_eq!(fill_mask(0, 4), 0);
        assert_eq!(fill_mask(1, 3), 0x0000_00FF);
        assert_eq!(fill_mask(3, 1), 0x00FF_FFFF);
        assert_eq!(fill_mask(0, 1), 0xFFFF_FF00);
        assert_eq!(fill_mask(1, 2), 0xFF00_00FF);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::Size.kind(), NorFlashErrorKind::OutOfBounds);
        assert_eq!(Error::Unaligned.kind(), NorFlashErrorKind::NotAligned);
        assert_eq!(Error::Prog.kind(), NorFlashErrorKind::Other);
    }
}
