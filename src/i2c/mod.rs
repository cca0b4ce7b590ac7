//! Inter-Integrated-Circuit (I2C)
//!
//! Interrupt driven master and slave transaction engine for the EFM32/EFR32 I2C block.
//!
//! A transaction is a sequence of [`I2c::read`]/[`I2c::write`] calls. The first call passes
//! `start = true`, which takes the per-instance lock and blocks deep sleep. Calls with
//! `start = false` either send a repeated start with a new address byte or, through
//! [`I2c::read_continue`]/[`I2c::write_continue`], keep streaming bytes without addressing. The
//! lock is released after a call with `stop = true`, or as soon as any call fails.
//!
//! All operations report the number of bytes transferred. A count below the requested length means
//! the transaction was ended, either by the device (NACK) or by a fault. Faults are logged, NACKs
//! are not.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::Duration;

use crate::internal::Counter;
use crate::time::Hertz;

mod master;
pub mod mmio;
mod slave;

pub use master::I2c;
pub use slave::SlaveRequest;

/// Interrupt handler body.
///
/// Masks the peripheral interrupt and wakes the task waiting on the instance. The task re-arms the
/// interrupt sources it is interested in while it stays pending.
pub fn on_interrupt<R: Instance>(regs: &R, state: &State) {
    regs.set_interrupts(0);
    state.waker.wake();
}

/// I2C error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Misplaced start or stop condition (BUSERR)
    Bus,
    /// Arbitration lost (ARBLOST)
    Arbitration,
    /// ACK not received (either to the address or to a data byte) (NACK)
    Nack,
    /// Timeout
    Timeout,
    /// Transmit buffer overflow (TXOF)
    Overrun,
    /// Receive buffer underflow (RXUF)
    Underflow,
    /// Master stop condition observed mid-transfer (MSTOP)
    MasterStop,
    /// SCL held low by another device (CLTO)
    ClockLowTimeout,
    /// Bus idle timeout (BITO)
    BusIdleTimeout,
    /// Clock line fault (CLERR)
    ClockError,
    /// Bus not in the state the operation expects
    InvalidState,
}

/// SCL high/low ratio.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ClockRatio {
    /// 4:4, standard mode
    Standard,
    /// 6:3
    Asymmetric,
    /// 11:6, fast mode
    Fast,
}

impl ClockRatio {
    /// Number of clock periods per SCL cycle (`Nlow + Nhigh`).
    pub const fn periods(self) -> u32 {
        match self {
            Self::Standard => 8,
            Self::Asymmetric => 9,
            Self::Fast => 17,
        }
    }

    pub(crate) const fn bits(self) -> u32 {
        match self {
            Self::Standard => 0,
            Self::Asymmetric => 1,
            Self::Fast => 2,
        }
    }
}

/// I2C config
#[non_exhaustive]
#[derive(Copy, Clone)]
pub struct Config {
    /// Bound for every wait on the bus.
    pub timeout: Duration,
    /// SCL frequency.
    pub frequency: Hertz,
    pub clock_ratio: ClockRatio,
    /// Let the hardware send a stop condition when a NACK is received.
    pub auto_stop_on_nack: bool,
    /// 7-bit slave address. `None` leaves slave mode disabled.
    pub slave_address: Option<u8>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            frequency: Hertz::khz(100),
            clock_ratio: ClockRatio::Standard,
            auto_stop_on_nack: false,
            slave_address: None,
        }
    }
}

/// Bus state, from `STATE.STATE`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusState {
    #[default]
    Idle,
    Wait,
    Start,
    Addr,
    AddrAck,
    Data,
    DataAck,
}

impl BusState {
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => Self::Idle,
            1 => Self::Wait,
            2 => Self::Start,
            3 => Self::Addr,
            4 => Self::AddrAck,
            5 => Self::Data,
            _ => Self::DataAck,
        }
    }

    pub const fn bits(self) -> u32 {
        self as u32
    }
}

/// Snapshot of the `STATE` register.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Status(pub u32);

impl Status {
    pub const BUSY: u32 = 1 << 0;
    pub const MASTER: u32 = 1 << 1;
    pub const TRANSMITTER: u32 = 1 << 2;
    pub const NACKED: u32 = 1 << 3;
    pub const BUSHOLD: u32 = 1 << 4;
    pub const STATE_SHIFT: u32 = 5;

    pub const fn new(state: BusState, flags: u32) -> Self {
        Self(state.bits() << Self::STATE_SHIFT | flags)
    }

    pub const fn state(self) -> BusState {
        BusState::from_bits(self.0 >> Self::STATE_SHIFT)
    }

    pub const fn busy(self) -> bool {
        self.0 & Self::BUSY != 0
    }

    pub const fn master(self) -> bool {
        self.0 & Self::MASTER != 0
    }

    pub const fn transmitter(self) -> bool {
        self.0 & Self::TRANSMITTER != 0
    }

    pub const fn bus_held(self) -> bool {
        self.0 & Self::BUSHOLD != 0
    }

    /// Addressed as a slave and the transfer has not ended.
    pub const fn slave_active(self) -> bool {
        self.busy() && !self.master()
    }
}

/// Interrupt flag snapshot (`IF`).
///
/// Sampled and cleared in one step, then inspected as an immutable value.
#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct StateFlags(pub u32);

impl StateFlags {
    pub const START: u32 = 1 << 0;
    pub const RSTART: u32 = 1 << 1;
    pub const ADDR: u32 = 1 << 2;
    pub const TXC: u32 = 1 << 3;
    pub const TXBL: u32 = 1 << 4;
    pub const RXDATAV: u32 = 1 << 5;
    pub const ACK: u32 = 1 << 6;
    pub const NACK: u32 = 1 << 7;
    pub const MSTOP: u32 = 1 << 8;
    pub const ARBLOST: u32 = 1 << 9;
    pub const BUSERR: u32 = 1 << 10;
    pub const BUSHOLD: u32 = 1 << 11;
    pub const TXOF: u32 = 1 << 12;
    pub const RXUF: u32 = 1 << 13;
    pub const BITO: u32 = 1 << 14;
    pub const CLTO: u32 = 1 << 15;
    pub const SSTOP: u32 = 1 << 16;
    pub const RXFULL: u32 = 1 << 17;
    pub const CLERR: u32 = 1 << 18;

    /// Conditions that end a master receive step.
    pub const AWAIT_NO_ACK: u32 = Self::BUSERR | Self::ARBLOST | Self::RXDATAV | Self::MSTOP;
    /// Conditions that end a master address or transmit step.
    pub const AWAIT: u32 = Self::AWAIT_NO_ACK | Self::ACK | Self::NACK;
    /// Conditions that end a slave wait.
    pub const AWAIT_SLAVE_ADDRESS: u32 = Self::ADDR | Self::ARBLOST;
    /// Conditions that end a slave transmit step.
    pub const AWAIT_SLAVE_WRITE: u32 = Self::BUSERR | Self::ARBLOST | Self::ACK | Self::NACK | Self::SSTOP;
    /// Conditions that end a slave receive step.
    pub const AWAIT_SLAVE_READ: u32 = Self::BUSERR | Self::ARBLOST | Self::RXDATAV | Self::SSTOP;

    pub const fn any(self, mask: u32) -> bool {
        self.0 & mask != 0
    }

    pub const fn start(self) -> bool {
        self.any(Self::START)
    }
    pub const fn repeated_start(self) -> bool {
        self.any(Self::RSTART)
    }
    pub const fn address(self) -> bool {
        self.any(Self::ADDR)
    }
    pub const fn complete(self) -> bool {
        self.any(Self::TXC)
    }
    pub const fn buffer_level(self) -> bool {
        self.any(Self::TXBL)
    }
    pub const fn data_valid(self) -> bool {
        self.any(Self::RXDATAV)
    }
    pub const fn ack(self) -> bool {
        self.any(Self::ACK)
    }
    pub const fn nack(self) -> bool {
        self.any(Self::NACK)
    }
    pub const fn master_stop(self) -> bool {
        self.any(Self::MSTOP)
    }
    pub const fn arbitration_lost(self) -> bool {
        self.any(Self::ARBLOST)
    }
    pub const fn bus_error(self) -> bool {
        self.any(Self::BUSERR)
    }
    pub const fn bus_held(self) -> bool {
        self.any(Self::BUSHOLD)
    }
    pub const fn tx_overflow(self) -> bool {
        self.any(Self::TXOF)
    }
    pub const fn rx_underflow(self) -> bool {
        self.any(Self::RXUF)
    }
    pub const fn bus_idle_timeout(self) -> bool {
        self.any(Self::BITO)
    }
    pub const fn clock_low_timeout(self) -> bool {
        self.any(Self::CLTO)
    }
    pub const fn slave_stop(self) -> bool {
        self.any(Self::SSTOP)
    }
    pub const fn rx_full(self) -> bool {
        self.any(Self::RXFULL)
    }
    pub const fn clock_error(self) -> bool {
        self.any(Self::CLERR)
    }
}

impl core::fmt::Debug for StateFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "StateFlags({:#x})", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for StateFlags {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "StateFlags({=u32:#x})", self.0)
    }
}

/// A single engine step, packed into one word.
///
/// Layout: `address << 25 | read << 24 | no_address << 18 | stop << 17 | start << 16 | length`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Operation(u32);

impl Operation {
    const LENGTH_MASK: u32 = 0xFFFF;
    const START: u32 = 1 << 16;
    const STOP: u32 = 1 << 17;
    const NO_ADDRESS: u32 = 1 << 18;
    const READ: u32 = 1 << 24;
    const ADDRESS_SHIFT: u32 = 25;

    /// Addressed step. `start` takes the lock, otherwise a repeated start is generated.
    pub const fn addressed(address: u8, read: bool, length: usize, start: bool, stop: bool) -> Self {
        let mut v = ((address as u32 & 0x7F) << Self::ADDRESS_SHIFT) | (length as u32 & Self::LENGTH_MASK);
        if read {
            v |= Self::READ;
        }
        if start {
            v |= Self::START;
        }
        if stop {
            v |= Self::STOP;
        }
        Self(v)
    }

    /// Continuation of the current transfer, without a new address byte.
    pub const fn continuation(read: bool, length: usize, stop: bool) -> Self {
        let mut v = Self::NO_ADDRESS | (length as u32 & Self::LENGTH_MASK);
        if read {
            v |= Self::READ;
        }
        if stop {
            v |= Self::STOP;
        }
        Self(v)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn address(self) -> u8 {
        (self.0 >> Self::ADDRESS_SHIFT) as u8
    }

    pub const fn read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub const fn start(self) -> bool {
        self.0 & Self::START != 0
    }

    pub const fn stop(self) -> bool {
        self.0 & Self::STOP != 0
    }

    pub const fn no_address(self) -> bool {
        self.0 & Self::NO_ADDRESS != 0
    }

    pub const fn length(self) -> usize {
        (self.0 & Self::LENGTH_MASK) as usize
    }

    /// Address byte on the wire: 7-bit address followed by the R/W bit.
    pub const fn full_address(self) -> u8 {
        self.address() << 1 | self.read() as u8
    }
}

/// Diagnostic counters of one instance.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Diagnostics {
    pub bus_resets: u32,
    pub timeouts: u32,
    pub unhandled: u32,
}

/// Per-instance shared state.
///
/// Every driver handle of one peripheral instance must use the same `State`.
pub struct State {
    pub(crate) waker: AtomicWaker,
    pub(crate) lock: Mutex<CriticalSectionRawMutex, ()>,
    pub(crate) bus_resets: Counter,
    pub(crate) timeouts: Counter,
    pub(crate) unhandled: Counter,
}

impl State {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            lock: Mutex::new(()),
            bus_resets: Counter::new(),
            timeouts: Counter::new(),
            unhandled: Counter::new(),
        }
    }

    /// Whether a transaction currently owns the instance.
    pub fn is_locked(&self) -> bool {
        match self.lock.try_lock() {
            Ok(_) => false,
            Err(_) => true,
        }
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            bus_resets: self.bus_resets.get(),
            timeouts: self.timeouts.get(),
            unhandled: self.unhandled.get(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Hardware access used by the engine.
///
/// Implemented by [`mmio::Registers`] for the real peripheral and by simulators in tests.
pub trait Instance {
    /// Write `CMD`.
    fn command(&self, cmd: u32);
    /// Read `STATE`.
    fn status(&self) -> Status;
    /// Read `STATUS` (`PSTART`, `PSTOP`, buffer levels).
    fn bus_status(&self) -> u32;
    /// Read `IF` without clearing it.
    fn flags(&self) -> StateFlags;
    /// Read and clear `IF`.
    fn take_flags(&self) -> StateFlags;
    /// Write `IEN`.
    fn set_interrupts(&self, mask: u32);
    fn interrupts(&self) -> u32;
    /// Load `TXDATA`.
    fn send(&self, byte: u8);
    /// Read `RXDATA`.
    fn receive(&self) -> u8;
    fn set_enabled(&self, enabled: bool);
    /// Set or clear `CTRL` bits.
    fn set_control(&self, mask: u32, on: bool);
    /// Input clock of the peripheral.
    fn clock(&self) -> Hertz;
    fn set_clock_divider(&self, div: u32);
    /// Write `SADDR` (7-bit address, match all bits).
    fn set_slave_address(&self, address: u8);
    /// NVIC line of the instance.
    fn set_irq_enabled(&self, enabled: bool);
}

impl<T: Instance + ?Sized> Instance for &T {
    fn command(&self, cmd: u32) {
        T::command(self, cmd)
    }
    fn status(&self) -> Status {
        T::status(self)
    }
    fn bus_status(&self) -> u32 {
        T::bus_status(self)
    }
    fn flags(&self) -> StateFlags {
        T::flags(self)
    }
    fn take_flags(&self) -> StateFlags {
        T::take_flags(self)
    }
    fn set_interrupts(&self, mask: u32) {
        T::set_interrupts(self, mask)
    }
    fn interrupts(&self) -> u32 {
        T::interrupts(self)
    }
    fn send(&self, byte: u8) {
        T::send(self, byte)
    }
    fn receive(&self) -> u8 {
        T::receive(self)
    }
    fn set_enabled(&self, enabled: bool) {
        T::set_enabled(self, enabled)
    }
    fn set_control(&self, mask: u32, on: bool) {
        T::set_control(self, mask, on)
    }
    fn clock(&self) -> Hertz {
        T::clock(self)
    }
    fn set_clock_divider(&self, div: u32) {
        T::set_clock_divider(self, div)
    }
    fn set_slave_address(&self, address: u8) {
        T::set_slave_address(self, address)
    }
    fn set_irq_enabled(&self, enabled: bool) {
        T::set_irq_enabled(self, enabled)
    }
}

/// `CMD` bits.
pub mod cmd {
    pub const START: u32 = 1 << 0;
    pub const STOP: u32 = 1 << 1;
    pub const ACK: u32 = 1 << 2;
    pub const NACK: u32 = 1 << 3;
    pub const CONT: u32 = 1 << 4;
    pub const ABORT: u32 = 1 << 5;
    pub const CLEARTX: u32 = 1 << 6;
    pub const CLEARPC: u32 = 1 << 7;
}

/// `CTRL` bits.
pub mod ctrl {
    pub const SLAVE: u32 = 1 << 1;
    pub const AUTOACK: u32 = 1 << 2;
    pub const AUTOSE: u32 = 1 << 3;
    pub const AUTOSN: u32 = 1 << 4;
    pub const ARBDIS: u32 = 1 << 5;
    pub const CLHR_SHIFT: u32 = 8;
}

/// `STATUS` bits.
pub mod status {
    pub const PSTART: u32 = 1 << 0;
    pub const PSTOP: u32 = 1 << 1;
    pub const TXC: u32 = 1 << 6;
    pub const TXBL: u32 = 1 << 7;
    pub const RXDATAV: u32 = 1 << 8;
    pub const RXFULL: u32 = 1 << 9;
}

impl embedded_hal::i2c::Error for Error {
    fn kind(&self) -> embedded_hal::i2c::ErrorKind {
        match *self {
            Self::Bus => embedded_hal::i2c::ErrorKind::Bus,
            Self::Arbitration => embedded_hal::i2c::ErrorKind::ArbitrationLoss,
            Self::Nack => embedded_hal::i2c::ErrorKind::NoAcknowledge(embedded_hal::i2c::NoAcknowledgeSource::Unknown),
            Self::Overrun => embedded_hal::i2c::ErrorKind::Overrun,
            Self::MasterStop | Self::ClockLowTimeout | Self::ClockError => embedded_hal::i2c::ErrorKind::Bus,
            Self::Timeout | Self::Underflow | Self::BusIdleTimeout | Self::InvalidState => {
                embedded_hal::i2c::ErrorKind::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_packing() {
        let op = Operation::addressed(0x50, false, 2, true, true);
        assert_eq!(op.bits(), 0x50 << 25 | 1 << 17 | 1 << 16 | 2);
        assert_eq!(op.full_address(), 0xA0);
        assert!(op.start() && op.stop() && !op.no_address() && !op.read());

        let op = Operation::addressed(0x50, true, 3, false, false);
        assert_eq!(op.full_address(), 0xA1);
        assert_eq!(op.length(), 3);
        assert!(!op.start());
    }

    #[test]
    fn continuation_never_starts() {
        let op = Operation::continuation(true, 7, true);
        assert!(op.no_address());
        assert!(!op.start());
        assert!(op.stop());
        assert_eq!(op.length(), 7);
        assert_eq!(op.address(), 0);
    }

    #[test]
    fn status_decodes_state_field() {
        let s = Status::new(BusState::DataAck, Status::BUSY | Status::MASTER | Status::BUSHOLD);
        assert_eq!(s.state(), BusState::DataAck);
        assert!(s.bus_held());
        assert!(!s.slave_active());

        let s = Status::new(BusState::Addr, Status::BUSY);
        assert!(s.slave_active());
    }

    #[test]
    fn flag_masks_cover_terminal_conditions() {
        let f = StateFlags(StateFlags::AWAIT);
        assert!(f.ack() && f.nack() && f.data_valid() && f.master_stop());
        assert!(!StateFlags(StateFlags::AWAIT_NO_ACK).ack());
        assert!(StateFlags(StateFlags::AWAIT_SLAVE_WRITE).slave_stop());
    }
}
