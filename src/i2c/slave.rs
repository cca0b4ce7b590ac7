use embassy_time::{with_timeout, Duration, Instant};

use super::master::Transaction;
use super::{cmd, BusState, I2c, Instance, StateFlags};

/// Transfer direction a slave is waiting for, from the master's point of view.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveRequest {
    /// Nothing matched before the timeout.
    None,
    /// The master reads, we transmit.
    Read,
    /// The master writes, we receive.
    Write,
    /// Either direction.
    Any,
}

impl<'d, R: Instance> I2c<'d, R> {
    /// Wait to be addressed by a master.
    ///
    /// Addresses whose direction does not match `request` are NACKed. On a match the address is left
    /// un-ACKed: the following [`slave_write`](Self::slave_write) or [`slave_read`](Self::slave_read)
    /// acknowledges it. The instance stays locked until [`slave_done`](Self::slave_done).
    ///
    /// Returns [`SlaveRequest::None`] on timeout.
    pub async fn slave_wait(&mut self, request: SlaveRequest, timeout: Duration) -> SlaveRequest {
        debug_assert!(request != SlaveRequest::None);
        let deadline = Instant::now() + timeout;

        if self.txn.is_none() {
            let state = self.state;
            let Ok(lock) = with_timeout(timeout, state.lock.lock()).await else {
                return SlaveRequest::None;
            };
            self.regs.take_flags();
            self.regs.set_irq_enabled(true);
            // the address match interrupt wakes us from deep sleep
            self.txn = Some(Transaction::new(lock, None));
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = StateFlags::AWAIT_SLAVE_ADDRESS;
            if !self.wait_until_within(remaining, wait, |r| r.flags().any(wait)).await {
                break;
            }

            if self.slave_arbitration_lost(self.regs.take_flags()) {
                continue;
            }

            let status = self.regs.status();
            if status.state() == BusState::Addr && status.busy() && status.bus_held() {
                let address = self.regs.receive();
                trace!("slave addressed {:#x}", address);
                if request == SlaveRequest::Any || status.transmitter() == (request == SlaveRequest::Read) {
                    if let Some(txn) = self.txn.as_mut() {
                        txn.block_deep_sleep();
                    }
                    return if address & 1 != 0 {
                        SlaveRequest::Read
                    } else {
                        SlaveRequest::Write
                    };
                }

                self.regs.command(cmd::NACK);
            }
        }

        self.finish();
        SlaveRequest::None
    }

    /// Transmit `data` to the master reading from us.
    ///
    /// Stops when the master NACKs, which is how it ends a read, or on a fault. Returns the number
    /// of bytes the master acknowledged.
    pub async fn slave_write(&mut self, data: &[u8]) -> usize {
        if self.regs.status().state() == BusState::Addr {
            self.regs.command(cmd::ACK);
        }

        for (i, &byte) in data.iter().enumerate() {
            self.regs.send(byte);

            loop {
                let Some(flags) = self.wait_flags(StateFlags::AWAIT_SLAVE_WRITE).await else {
                    error!("timeout waiting for the master to ACK byte {}", i);
                    return i;
                };

                if self.slave_arbitration_lost(flags) {
                    return i;
                }
                if let Some(e) = self.handle_error(flags) {
                    error!("slave write failed: {}", e);
                    return i;
                }
                if flags.nack() || flags.slave_stop() {
                    trace!("master ended the read after {} bytes", i);
                    return i;
                }
                if flags.ack() {
                    break;
                }
            }
        }

        data.len()
    }

    /// Receive bytes written by the master until it stops or `buffer` is full.
    ///
    /// The last byte that fits is NACKed. Returns the number of bytes received.
    pub async fn slave_read(&mut self, buffer: &mut [u8]) -> usize {
        if self.regs.status().state() == BusState::Addr {
            self.regs.command(cmd::ACK);
        }

        let mut count = 0;
        while count < buffer.len() {
            let Some(flags) = self.wait_flags(StateFlags::AWAIT_SLAVE_READ).await else {
                error!("timeout waiting for slave data");
                break;
            };

            if self.slave_arbitration_lost(flags) {
                break;
            }
            if let Some(e) = self.handle_error(flags) {
                error!("slave read failed: {}", e);
                break;
            }

            if flags.data_valid() {
                buffer[count] = self.regs.receive();
                count += 1;
                if count == buffer.len() {
                    self.regs.command(cmd::NACK);
                } else {
                    self.regs.command(cmd::ACK);
                }
            }

            if flags.slave_stop() {
                break;
            }
        }

        count
    }

    /// End the slave transaction and release the instance.
    ///
    /// A slave cannot end a read on its own, so dummy bytes are clocked out until the master stops.
    pub async fn slave_done(&mut self) {
        loop {
            let status = self.regs.status();
            if !(status.slave_active() && status.transmitter()) {
                break;
            }

            self.regs.send(0);
            let Some(flags) = self.wait_flags(StateFlags::AWAIT_SLAVE_WRITE).await else {
                break;
            };
            self.slave_arbitration_lost(flags);
        }

        self.finish();
    }

    fn slave_arbitration_lost(&self, flags: StateFlags) -> bool {
        if flags.arbitration_lost() {
            // SCL may hang otherwise
            error!("slave arbitration lost, aborting");
            self.regs.command(cmd::ABORT);
            return true;
        }
        false
    }
}
