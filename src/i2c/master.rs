use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::MutexGuard;
use embassy_time::{with_timeout, Duration};
use embedded_hal::i2c::Operation as HalOperation;

use super::{cmd, ctrl, status, BusState, Config, Error, Instance, Operation, State, StateFlags};
use crate::sleep::DeepSleepGuard;

/// Start+stop pulses issued while unjamming the bus.
const RESET_PULSES: usize = 10;

/// Everything a transaction holds while it owns the instance.
///
/// Dropping it releases the instance lock and the deep sleep block.
pub(super) struct Transaction<'d> {
    _lock: MutexGuard<'d, CriticalSectionRawMutex, ()>,
    sleep: Option<DeepSleepGuard>,
}

impl<'d> Transaction<'d> {
    pub(super) fn new(lock: MutexGuard<'d, CriticalSectionRawMutex, ()>, sleep: Option<DeepSleepGuard>) -> Self {
        Self { _lock: lock, sleep }
    }

    pub(super) fn block_deep_sleep(&mut self) {
        if self.sleep.is_none() {
            self.sleep = Some(DeepSleepGuard::new());
        }
    }
}

/// Outcome of one engine step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct Transfer {
    pub count: usize,
    pub error: Option<Error>,
}

/// I2C driver.
///
/// Several handles may share one peripheral instance as long as they share its [`State`]; the
/// instance lock serializes their transactions.
pub struct I2c<'d, R: Instance> {
    pub(super) regs: R,
    pub(super) state: &'d State,
    pub(super) timeout: Duration,
    pub(super) txn: Option<Transaction<'d>>,
}

impl<'d, R: Instance> I2c<'d, R> {
    /// Create a new I2C driver and configure the peripheral.
    pub fn new(regs: R, state: &'d State, config: Config) -> Self {
        let this = Self::new_shared(regs, state, config);
        this.init(config);
        this
    }

    /// Create another handle for an instance that is already configured.
    pub fn new_shared(regs: R, state: &'d State, config: Config) -> Self {
        Self {
            regs,
            state,
            timeout: config.timeout,
            txn: None,
        }
    }

    fn init(&self, config: Config) {
        let regs = &self.regs;

        regs.set_enabled(false);
        regs.set_interrupts(0);
        regs.take_flags();

        regs.set_control(
            ctrl::SLAVE | ctrl::AUTOACK | ctrl::AUTOSE | ctrl::AUTOSN | ctrl::ARBDIS | 0x3 << ctrl::CLHR_SHIFT,
            false,
        );
        regs.set_control(config.clock_ratio.bits() << ctrl::CLHR_SHIFT, true);
        if config.auto_stop_on_nack {
            regs.set_control(ctrl::AUTOSN, true);
        }
        if let Some(address) = config.slave_address {
            regs.set_slave_address(address);
            regs.set_control(ctrl::SLAVE, true);
        }

        // f_SCL = f_clk / ((DIV + 1) * (Nlow + Nhigh))
        let periods = config.clock_ratio.periods();
        let freq = config.frequency.0.max(1);
        let div = (regs.clock().0 / freq + 1).saturating_sub(periods) / periods;
        regs.set_clock_divider(div);

        regs.set_enabled(true);
    }

    /// Whether this handle currently owns the instance.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Read `buffer.len()` bytes from `address`.
    ///
    /// `start` opens a new transaction, otherwise a repeated start is generated inside the current
    /// one. The last byte is NACKed. Returns the number of bytes received.
    pub async fn read(&mut self, address: u8, buffer: &mut [u8], start: bool, stop: bool) -> usize {
        let op = Operation::addressed(address, true, buffer.len(), start, stop);
        self.read_op(op, buffer, true).await.count
    }

    /// Keep reading in the current transfer without a new address byte.
    pub async fn read_continue(&mut self, buffer: &mut [u8], stop: bool) -> usize {
        let op = Operation::continuation(true, buffer.len(), stop);
        self.read_op(op, buffer, true).await.count
    }

    /// Write `data` to `address`.
    ///
    /// A NACKed byte ends the write early; it is not counted. Returns the number of bytes the
    /// device acknowledged.
    pub async fn write(&mut self, address: u8, data: &[u8], start: bool, stop: bool) -> usize {
        let op = Operation::addressed(address, false, data.len(), start, stop);
        self.write_op(op, data).await.count
    }

    /// Keep writing in the current transfer without a new address byte.
    pub async fn write_continue(&mut self, data: &[u8], stop: bool) -> usize {
        let op = Operation::continuation(false, data.len(), stop);
        self.write_op(op, data).await.count
    }

    /// Recover a hung bus.
    ///
    /// Does nothing but clear the flags when the bus is idle or parked after an ACK. Otherwise the
    /// peripheral is restarted with arbitration disabled and a series of start+stop pulses is
    /// clocked out to release slaves stuck mid-byte. Success only shows in later transactions.
    ///
    /// Outside a transaction this waits for the instance like a transfer would, so other handles
    /// sharing the state are never cut off mid-frame.
    pub async fn reset(&mut self) {
        if self.txn.is_some() {
            return self.reset_bus().await;
        }
        let _lock = self.state.lock.lock().await;
        self.regs.set_irq_enabled(true);
        self.reset_bus().await;
        self.regs.set_interrupts(0);
        self.regs.set_irq_enabled(false);
    }

    pub(super) async fn read_op(&mut self, op: Operation, buffer: &mut [u8], nack_last: bool) -> Transfer {
        let (count, error) = match self.address(op).await {
            Ok(()) => self.read_bytes(buffer, nack_last).await,
            Err(e) => (0, Some(e)),
        };
        self.end_step(op, count, buffer.len(), error)
    }

    pub(super) async fn write_op(&mut self, op: Operation, data: &[u8]) -> Transfer {
        let (count, error) = match self.address(op).await {
            Ok(()) => self.write_bytes(data).await,
            Err(e) => (0, Some(e)),
        };
        self.end_step(op, count, data.len(), error)
    }

    fn end_step(&mut self, op: Operation, count: usize, len: usize, error: Option<Error>) -> Transfer {
        debug_assert!(count <= len);
        if error.is_some() || count != len || op.stop() {
            if self.regs.status().bus_held() {
                self.regs.command(cmd::STOP);
            }
            self.finish();
        }
        Transfer { count, error }
    }

    async fn begin(&mut self) {
        if self.txn.is_some() {
            warn!("start requested inside an open transaction");
            return;
        }
        let state = self.state;
        let lock = state.lock.lock().await;
        debug_assert!(self.regs.interrupts() == 0);
        self.regs.take_flags();
        self.regs.set_irq_enabled(true);
        self.txn = Some(Transaction::new(lock, Some(DeepSleepGuard::new())));
    }

    /// Close the transaction, releasing the instance.
    pub(super) fn finish(&mut self) {
        if let Some(txn) = self.txn.take() {
            self.regs.set_interrupts(0);
            self.regs.set_irq_enabled(false);
            drop(txn);
        }
    }

    /// Wait for `cond`, re-arming `ien` while pending.
    pub(super) async fn wait_until_within(&self, timeout: Duration, ien: u32, mut cond: impl FnMut(&R) -> bool) -> bool {
        let regs = &self.regs;
        let state = self.state;

        let res = with_timeout(
            timeout,
            poll_fn(|cx| {
                state.waker.register(cx.waker());

                if cond(regs) {
                    Poll::Ready(())
                } else {
                    // When pending, (re-)enable interrupts to wake us up.
                    regs.set_interrupts(ien);
                    Poll::Pending
                }
            }),
        )
        .await;

        if res.is_err() {
            self.state.timeouts.increment();
        }
        res.is_ok()
    }

    pub(super) async fn wait_until(&self, ien: u32, cond: impl FnMut(&R) -> bool) -> bool {
        self.wait_until_within(self.timeout, ien, cond).await
    }

    /// Wait for any flag in `mask`, then sample and clear all flags.
    ///
    /// Flags are cleared on timeout as well, which then returns `None`.
    pub(super) async fn wait_flags(&self, mask: u32) -> Option<StateFlags> {
        let ok = self.wait_until(mask, |r| r.flags().any(mask)).await;
        let flags = self.regs.take_flags();
        ok.then_some(flags)
    }

    /// Classify fault flags. `None` if no fault is flagged.
    pub(super) fn handle_error(&self, flags: StateFlags) -> Option<Error> {
        if flags.arbitration_lost() {
            debug!("arbitration lost");
            Some(Error::Arbitration)
        } else if flags.bus_error() {
            debug!("bus error");
            Some(Error::Bus)
        } else if flags.master_stop() && !flags.nack() {
            // with AUTOSN a NACK is followed by our own stop
            Some(Error::MasterStop)
        } else if flags.tx_overflow() {
            error!("TX overflow");
            Some(Error::Overrun)
        } else if flags.rx_underflow() {
            error!("RX underflow");
            Some(Error::Underflow)
        } else if flags.clock_low_timeout() {
            error!("SCL held low, aborting");
            self.regs.command(cmd::ABORT);
            Some(Error::ClockLowTimeout)
        } else if flags.bus_idle_timeout() {
            info!("bus idle timeout");
            Some(Error::BusIdleTimeout)
        } else if flags.clock_error() {
            error!("clock error");
            Some(Error::ClockError)
        } else {
            None
        }
    }

    /// Flags that match no branch of the state machine.
    pub(super) async fn on_unhandled_error(&self, flags: StateFlags) {
        error!("unhandled flags {} in bus state {}", flags, self.regs.status().state());
        self.state.unhandled.increment();
        self.reset_bus().await;
    }

    pub(super) async fn reset_bus(&self) {
        let regs = &self.regs;

        let state = regs.status().state();
        if matches!(state, BusState::Idle | BusState::DataAck) {
            regs.take_flags();
            return;
        }

        self.state.bus_resets.increment();
        error!("bus stuck in {}, resetting", state);

        regs.set_enabled(false);
        regs.set_control(ctrl::ARBDIS, true);
        regs.set_enabled(true);
        regs.command(cmd::ABORT);
        regs.take_flags();

        let pulse_done = |r: &R| r.bus_status() & (status::PSTART | status::PSTOP) == 0;
        let ien = StateFlags::START | StateFlags::MSTOP | StateFlags::BUSERR | StateFlags::ARBLOST;

        for attempt in 0..RESET_PULSES {
            regs.command(cmd::START | cmd::STOP);
            if !self.wait_until(ien, pulse_done).await {
                regs.take_flags();
                error!("reset pulse {} did not post", attempt);
                regs.command(cmd::ABORT);
                self.wait_until(ien, pulse_done).await;
            }
        }

        regs.set_control(ctrl::ARBDIS, false);
        regs.take_flags();
        info!("bus reset complete");
    }

    /// Open (or continue) a transfer: lock, address byte, wait for the acknowledge.
    pub(super) async fn address(&mut self, op: Operation) -> Result<(), Error> {
        if op.start() {
            self.begin().await;
        }

        if self.txn.is_none() {
            error!("transfer without an open transaction");
            return Err(Error::InvalidState);
        }

        let state = self.regs.status().state();
        self.regs.take_flags();

        if op.no_address() {
            // an ACKed read keeps the slave transmitting
            let receiving = op.read() && state == BusState::Data;
            if !matches!(state, BusState::AddrAck | BusState::DataAck) && !receiving {
                error!("cannot continue a transfer in bus state {}", state);
                return Err(Error::InvalidState);
            }
            return Ok(());
        }

        if op.start() {
            if !self
                .wait_until(StateFlags::AWAIT, |r| r.status().state() == BusState::Idle)
                .await
            {
                error!("bus not idle");
                self.reset_bus().await;
            }

            self.regs.command(cmd::CLEARTX);
            while self.regs.bus_status() & status::RXDATAV != 0 {
                self.regs.receive();
            }
            self.regs.command(cmd::ABORT);
            self.regs.take_flags();

            self.regs.send(op.full_address());
            self.regs.command(cmd::START);
        } else {
            if !matches!(state, BusState::Idle | BusState::DataAck) {
                error!("cannot restart in bus state {}", state);
                return Err(Error::InvalidState);
            }
            self.regs.command(cmd::START);
            self.regs.send(op.full_address());
        }

        loop {
            let Some(flags) = self.wait_flags(StateFlags::AWAIT).await else {
                error!("timeout addressing {:#x}", op.address());
                return Err(Error::Timeout);
            };

            if let Some(e) = self.handle_error(flags) {
                return Err(e);
            }
            if flags.nack() {
                trace!("address {:#x} not acknowledged", op.address());
                return Err(Error::Nack);
            }
            if flags.ack() {
                return Ok(());
            }

            self.on_unhandled_error(flags).await;
        }
    }

    async fn read_bytes(&mut self, buffer: &mut [u8], nack_last: bool) -> (usize, Option<Error>) {
        let len = buffer.len();
        let mut count = 0;

        while count < len {
            let Some(flags) = self.wait_flags(StateFlags::AWAIT_NO_ACK).await else {
                error!("timeout reading byte {} of {}", count, len);
                self.reset_bus().await;
                return (count, Some(Error::Timeout));
            };

            if let Some(e) = self.handle_error(flags) {
                return (count, Some(e));
            }

            if flags.data_valid() {
                buffer[count] = self.regs.receive();
                count += 1;
                if count == len && nack_last {
                    self.regs.command(cmd::NACK);
                } else {
                    self.regs.command(cmd::ACK);
                }
            } else {
                self.on_unhandled_error(flags).await;
            }
        }

        (count, None)
    }

    async fn write_bytes(&mut self, data: &[u8]) -> (usize, Option<Error>) {
        for (i, &byte) in data.iter().enumerate() {
            self.regs.send(byte);

            loop {
                let Some(flags) = self.wait_flags(StateFlags::AWAIT).await else {
                    error!("timeout writing byte {} of {}", i, data.len());
                    self.reset_bus().await;
                    return (i, Some(Error::Timeout));
                };

                if let Some(e) = self.handle_error(flags) {
                    return (i, Some(e));
                }
                if flags.nack() {
                    // devices NACK to refuse further data
                    trace!("write ended by NACK after {} bytes", i);
                    return (i, Some(Error::Nack));
                }
                if flags.ack() {
                    break;
                }

                self.on_unhandled_error(flags).await;
            }
        }

        (data.len(), None)
    }
}

impl<'d, R: Instance> Drop for I2c<'d, R> {
    fn drop(&mut self) {
        if self.txn.is_some() {
            if self.regs.status().bus_held() {
                self.regs.command(cmd::STOP);
            }
            self.finish();
        }
    }
}

/// Wire framing of one operation in an embedded-hal transaction.
///
/// Consecutive operations of the same kind are merged: only the first of a run gets a (repeated)
/// start and address byte, and reads ACK their last byte when the next operation continues the
/// read. The final operation ends with a stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Frame {
    start: bool,
    stop: bool,
    nack: bool,
}

impl Frame {
    fn of(operations: &[HalOperation<'_>], index: usize) -> Self {
        let same_kind = |a: &HalOperation<'_>, b: &HalOperation<'_>| {
            matches!(
                (a, b),
                (HalOperation::Read(_), HalOperation::Read(_)) | (HalOperation::Write(_), HalOperation::Write(_))
            )
        };

        let op = &operations[index];
        let next = operations.get(index + 1);
        Self {
            start: index == 0 || !same_kind(&operations[index - 1], op),
            stop: next.is_none(),
            nack: !next.is_some_and(|n| same_kind(op, n)),
        }
    }

    fn operation(self, address: u8, read: bool, len: usize, first: bool) -> Operation {
        if self.start {
            Operation::addressed(address, read, len, first, self.stop)
        } else {
            Operation::continuation(read, len, self.stop)
        }
    }
}

impl<'d, R: Instance> embedded_hal::i2c::ErrorType for I2c<'d, R> {
    type Error = Error;
}

impl<'d, R: Instance> embedded_hal_async::i2c::I2c for I2c<'d, R> {
    async fn transaction(&mut self, address: u8, operations: &mut [HalOperation<'_>]) -> Result<(), Self::Error> {
        // A read needs at least one byte to carry the final NACK.
        if operations.iter().any(|op| matches!(op, HalOperation::Read(read) if read.is_empty())) {
            return Err(Error::Overrun);
        }

        for index in 0..operations.len() {
            let frame = Frame::of(operations, index);
            let first = index == 0;

            let step = match &mut operations[index] {
                HalOperation::Read(read) => {
                    let op = frame.operation(address, true, read.len(), first);
                    self.read_op(op, read, frame.nack).await
                }
                HalOperation::Write(write) => {
                    let op = frame.operation(address, false, write.len(), first);
                    self.write_op(op, write).await
                }
            };

            if let Some(e) = step.error {
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_merge_runs_of_the_same_kind() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 2];
        let ops = [
            HalOperation::Write(&[1]),
            HalOperation::Write(&[2]),
            HalOperation::Read(&mut a),
            HalOperation::Read(&mut b),
        ];

        let frames: Vec<Frame> = (0..ops.len()).map(|i| Frame::of(&ops, i)).collect();
        assert_eq!(
            frames,
            [
                Frame { start: true, stop: false, nack: false },
                Frame { start: false, stop: false, nack: true },
                Frame { start: true, stop: false, nack: false },
                Frame { start: false, stop: true, nack: true },
            ]
        );
    }

    #[test]
    fn only_the_first_frame_opens_the_transaction() {
        let frame = Frame { start: true, stop: true, nack: true };
        assert!(frame.operation(0x50, false, 1, true).start());

        let restart = frame.operation(0x50, true, 1, false);
        assert!(!restart.start() && !restart.no_address());

        let cont = Frame { start: false, stop: false, nack: true }.operation(0x50, true, 1, false);
        assert!(cont.no_address());
    }
}
