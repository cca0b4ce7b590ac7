//! Reset cause (RMU)
//!
//! `RSTCAUSE` accumulates until cleared, so the board crate reads it once at startup, hands the
//! value to [`latch`] and clears the register. Everything else asks [`cause`].
use core::cell::Cell;
use core::ops::{BitAnd, BitOr};

use critical_section::Mutex;

/// Reset cause flags, laid out like the Series 1 `RSTCAUSE` register.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cause(pub u32);

impl Cause {
    pub const NONE: Self = Self(0);
    pub const POWER_ON: Self = Self(1 << 0);
    /// Any of the AVDD, DVDD and DEC brownout detectors.
    pub const BROWNOUT: Self = Self(0b111 << 2);
    pub const EXTERNAL: Self = Self(1 << 8);
    pub const LOCKUP: Self = Self(1 << 9);
    pub const SYSTEM: Self = Self(1 << 10);
    pub const WATCHDOG: Self = Self(1 << 11);
    pub const BACKUP: Self = Self(1 << 15);
    pub const EM4_WAKEUP: Self = Self(1 << 16);

    const KNOWN: u32 = Self::POWER_ON.0
        | Self::BROWNOUT.0
        | Self::EXTERNAL.0
        | Self::LOCKUP.0
        | Self::SYSTEM.0
        | Self::WATCHDOG.0
        | Self::BACKUP.0
        | Self::EM4_WAKEUP.0;

    /// Decode a raw `RSTCAUSE` value, dropping reserved bits.
    pub const fn from_bits(raw: u32) -> Self {
        Self(raw & Self::KNOWN)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether any flag of `other` is set.
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_power_on(self) -> bool {
        self.intersects(Self::POWER_ON)
    }

    pub fn is_brownout(self) -> bool {
        self.intersects(Self::BROWNOUT)
    }

    pub fn is_watchdog(self) -> bool {
        self.intersects(Self::WATCHDOG)
    }

    pub fn is_em4_wakeup(self) -> bool {
        self.intersects(Self::EM4_WAKEUP)
    }
}

impl BitOr for Cause {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for Cause {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

static CAUSE: Mutex<Cell<Option<Cause>>> = Mutex::new(Cell::new(None));

/// Record the reset cause. Only the first call after reset has an effect.
pub fn latch(cause: Cause) -> bool {
    critical_section::with(|cs| {
        let slot = CAUSE.borrow(cs);
        if slot.get().is_some() {
            return false;
        }
        debug!("reset cause {:#x}", cause.bits());
        slot.set(Some(cause));
        true
    })
}

/// The latched reset cause, [`Cause::NONE`] before [`latch`].
pub fn cause() -> Cause {
    critical_section::with(|cs| CAUSE.borrow(cs).get()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_bits_are_filtered() {
        let c = Cause::from_bits(0x0001_0901 | 1 << 31);
        assert!(c.is_power_on());
        assert!(c.is_em4_wakeup());
        assert!(c.intersects(Cause::EXTERNAL));
        assert!(!c.is_brownout());
        assert_eq!(c.bits() & 1 << 31, 0);
        assert!(Cause::from_bits(1 << 3).is_brownout());
    }

    #[test]
    fn first_latch_wins() {
        latch(Cause::WATCHDOG | Cause::SYSTEM);
        assert!(!latch(Cause::POWER_ON));
        assert!(cause().is_watchdog());
        assert!(!cause().is_power_on());
    }
}
