use std::cell::RefCell;
use std::collections::VecDeque;

use efm32_hal::i2c::{self, cmd, BusState, Config, I2c, Instance, SlaveRequest, State, StateFlags, Status};
use efm32_hal::time::Hertz;
use embassy_futures::join::join;
use embassy_futures::{block_on, yield_now};
use embassy_time::Duration;
use embedded_hal_async::i2c::I2c as _;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Wire {
    Start,
    /// Byte driven by the master.
    Byte(u8),
    /// Byte driven by the slave.
    Read(u8),
    MasterAck,
    MasterNack,
    Stop,
}

#[derive(Default)]
struct Inner {
    state: BusState,
    busy: bool,
    transmitter: bool,
    flags: u32,
    ien: u32,
    irq: bool,
    divider: u32,
    tx: Option<u8>,
    rx: Option<u8>,
    restart: bool,
    wire: Vec<Wire>,
    commands: Vec<u32>,

    /// Address of the simulated device, `None` for an empty bus.
    device: Option<u8>,
    /// Data bytes the device acknowledges before it starts NACKing.
    accept: usize,
    written: Vec<u8>,
    to_read: VecDeque<u8>,
    /// Slave mode: address byte of a remote master, presented once the engine listens.
    incoming: Option<u8>,
    /// Slave mode: bytes the remote master reads before it NACKs.
    master_wants: usize,
}

struct Sim(RefCell<Inner>);

impl Sim {
    fn new(device: Option<u8>) -> Self {
        Self(RefCell::new(Inner {
            device,
            accept: usize::MAX,
            ..Inner::default()
        }))
    }

    fn wire(&self) -> Vec<Wire> {
        self.0.borrow().wire.clone()
    }

    fn pulses(&self) -> usize {
        let both = cmd::START | cmd::STOP;
        self.0.borrow().commands.iter().filter(|&&c| c & both == both).count()
    }
}

impl Inner {
    fn address_phase(&mut self, byte: u8) {
        self.wire.push(Wire::Start);
        self.wire.push(Wire::Byte(byte));
        self.busy = true;
        self.transmitter = byte & 1 == 0;
        if self.device == Some(byte >> 1) {
            self.state = BusState::AddrAck;
            self.flags |= StateFlags::ACK;
            if byte & 1 != 0 {
                self.next_read();
            }
        } else if self.device.is_some() {
            self.state = BusState::AddrAck;
            self.flags |= StateFlags::NACK;
        } else {
            // nobody drives the bus
            self.state = BusState::Addr;
        }
    }

    fn next_read(&mut self) {
        let byte = self.to_read.pop_front().unwrap_or(0xFF);
        self.wire.push(Wire::Read(byte));
        self.rx = Some(byte);
        self.state = BusState::Data;
        self.flags |= StateFlags::RXDATAV;
    }
}

impl Instance for Sim {
    fn command(&self, c: u32) {
        let mut s = self.0.borrow_mut();
        s.commands.push(c);
        if c & cmd::ABORT != 0 && s.busy {
            s.busy = false;
            s.restart = false;
            s.state = BusState::Idle;
        }
        if c & cmd::START != 0 {
            if s.busy {
                s.restart = true;
            } else if let Some(byte) = s.tx.take() {
                s.address_phase(byte);
            }
        }
        if c & cmd::ACK != 0 && s.busy {
            if s.state == BusState::Addr {
                s.state = BusState::Data;
            } else if !s.transmitter {
                s.wire.push(Wire::MasterAck);
                s.next_read();
            }
        }
        if c & cmd::NACK != 0 && s.busy && !s.transmitter {
            s.wire.push(Wire::MasterNack);
            s.state = BusState::DataAck;
        }
        if c & cmd::STOP != 0 && s.busy {
            s.wire.push(Wire::Stop);
            s.busy = false;
            s.state = BusState::Idle;
        }
        if c & cmd::CLEARTX != 0 {
            s.tx = None;
        }
    }

    fn status(&self) -> Status {
        let s = self.0.borrow();
        let mut flags = 0;
        if s.busy {
            flags |= Status::BUSY | Status::BUSHOLD;
            if s.master_wants == 0 {
                flags |= Status::MASTER;
            }
        }
        if s.transmitter {
            flags |= Status::TRANSMITTER;
        }
        Status::new(s.state, flags)
    }

    fn bus_status(&self) -> u32 {
        0
    }

    fn flags(&self) -> StateFlags {
        StateFlags(self.0.borrow().flags)
    }

    fn take_flags(&self) -> StateFlags {
        let mut s = self.0.borrow_mut();
        let flags = StateFlags(s.flags);
        // RXDATAV follows the receive buffer and cannot be cleared
        s.flags = if s.rx.is_some() { s.flags & StateFlags::RXDATAV } else { 0 };
        flags
    }

    fn set_interrupts(&self, mask: u32) {
        let mut s = self.0.borrow_mut();
        s.ien = mask;
        if mask & StateFlags::ADDR != 0 {
            if let Some(address) = s.incoming.take() {
                s.busy = true;
                s.transmitter = address & 1 != 0;
                s.state = BusState::Addr;
                s.rx = Some(address);
                s.flags |= StateFlags::ADDR;
            }
        }
    }

    fn interrupts(&self) -> u32 {
        self.0.borrow().ien
    }

    fn send(&self, byte: u8) {
        let mut s = self.0.borrow_mut();
        if !s.busy {
            s.tx = Some(byte);
        } else if core::mem::take(&mut s.restart) {
            s.address_phase(byte);
        } else if s.master_wants > 0 {
            // slave transmitting to a remote master
            s.wire.push(Wire::Read(byte));
            s.master_wants -= 1;
            if s.master_wants > 0 {
                s.flags |= StateFlags::ACK;
            } else {
                s.flags |= StateFlags::NACK | StateFlags::SSTOP;
                s.busy = false;
                s.transmitter = false;
                s.state = BusState::Idle;
            }
        } else {
            s.wire.push(Wire::Byte(byte));
            s.state = BusState::DataAck;
            if s.written.len() < s.accept {
                s.written.push(byte);
                s.flags |= StateFlags::ACK;
            } else {
                s.flags |= StateFlags::NACK;
            }
        }
    }

    fn receive(&self) -> u8 {
        let mut s = self.0.borrow_mut();
        s.flags &= !StateFlags::RXDATAV;
        s.rx.take().unwrap_or(0)
    }

    fn set_enabled(&self, _enabled: bool) {}

    fn set_control(&self, _mask: u32, _on: bool) {}

    fn clock(&self) -> Hertz {
        Hertz::mhz(14)
    }

    fn set_clock_divider(&self, div: u32) {
        self.0.borrow_mut().divider = div;
    }

    fn set_slave_address(&self, _address: u8) {}

    fn set_irq_enabled(&self, enabled: bool) {
        self.0.borrow_mut().irq = enabled;
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.timeout = Duration::from_millis(20);
    config
}

#[test]
fn clock_divider_follows_the_frequency() {
    let sim = Sim::new(None);
    let state = State::new();
    let _i2c = I2c::new(&sim, &state, config());
    // 14 MHz / ((16 + 1) * 8) ~ 103 kHz
    assert_eq!(sim.0.borrow().divider, 16);
}

#[test]
fn write_addresses_the_device() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let n = block_on(i2c.write(0x50, &[1, 2], true, true));
    assert_eq!(n, 2);
    assert_eq!(
        sim.wire(),
        [Wire::Start, Wire::Byte(0xA0), Wire::Byte(1), Wire::Byte(2), Wire::Stop]
    );
    assert!(!i2c.in_transaction());
    assert!(!state.is_locked());
    assert!(!sim.0.borrow().irq);
}

#[test]
fn missing_device_transfers_nothing() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let n = block_on(i2c.write(0x51, &[1, 2], true, true));
    assert_eq!(n, 0);
    assert_eq!(sim.wire(), [Wire::Start, Wire::Byte(0xA2), Wire::Stop]);
    assert!(!state.is_locked());
}

#[test]
fn nacked_data_ends_the_write_early() {
    let sim = Sim::new(Some(0x50));
    sim.0.borrow_mut().accept = 1;
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let n = block_on(i2c.write(0x50, &[7, 8, 9], true, true));
    assert_eq!(n, 1);
    assert_eq!(sim.0.borrow().written, [7]);
    assert_eq!(sim.wire().last(), Some(&Wire::Stop));
    assert!(!i2c.in_transaction());
}

#[test]
fn write_then_read_uses_a_repeated_start() {
    let sim = Sim::new(Some(0x50));
    sim.0.borrow_mut().to_read.extend([0xAB, 0xCD]);
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let mut buf = [0u8; 2];
    block_on(async {
        assert_eq!(i2c.write(0x50, &[0x10], true, false).await, 1);
        assert!(i2c.in_transaction());
        assert_eq!(i2c.read(0x50, &mut buf, false, true).await, 2);
    });

    assert_eq!(buf, [0xAB, 0xCD]);
    assert_eq!(
        sim.wire(),
        [
            Wire::Start,
            Wire::Byte(0xA0),
            Wire::Byte(0x10),
            Wire::Start,
            Wire::Byte(0xA1),
            Wire::Read(0xAB),
            Wire::MasterAck,
            Wire::Read(0xCD),
            Wire::MasterNack,
            Wire::Stop,
        ]
    );
}

#[test]
fn continuation_outside_a_transaction_is_refused() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let mut buf = [0u8; 1];
    assert_eq!(block_on(i2c.read_continue(&mut buf, true)), 0);
    assert_eq!(block_on(i2c.write(0x50, &[1], false, true)), 0);
    assert!(sim.wire().is_empty());
}

#[test]
fn silent_bus_times_out() {
    let sim = Sim::new(None);
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    assert_eq!(block_on(i2c.write(0x50, &[1], true, true)), 0);
    assert_eq!(state.diagnostics().timeouts, 1);
    assert!(!state.is_locked());
}

#[test]
fn reset_leaves_an_idle_bus_alone() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    block_on(i2c.reset());
    block_on(i2c.reset());
    assert!(sim.wire().is_empty());
    assert_eq!(sim.pulses(), 0);
    assert_eq!(state.diagnostics().bus_resets, 0);
    assert!(!state.is_locked());
    assert!(!sim.0.borrow().irq);
}

#[test]
fn reset_releases_a_held_bus() {
    let sim = Sim::new(Some(0x50));
    {
        let mut s = sim.0.borrow_mut();
        s.busy = true;
        s.state = BusState::Data;
    }
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    block_on(i2c.reset());
    assert_eq!(state.diagnostics().bus_resets, 1);
    assert!(sim.0.borrow().commands.contains(&cmd::ABORT));
    assert_eq!(sim.pulses(), 10);
    assert_eq!(sim.0.borrow().state, BusState::Idle);
    assert!(!state.is_locked());

    // the bus is usable again
    assert_eq!(block_on(i2c.write(0x50, &[1], true, true)), 1);
    assert_eq!(sim.wire(), [Wire::Start, Wire::Byte(0xA0), Wire::Byte(1), Wire::Stop]);
}

#[test]
fn shared_handles_do_not_interleave() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut a = I2c::new(&sim, &state, config());
    let mut b = I2c::new_shared(&sim, &state, config());

    block_on(join(
        async {
            assert_eq!(a.write(0x50, &[1], true, false).await, 1);
            yield_now().await;
            assert_eq!(a.write_continue(&[2], true).await, 1);
        },
        async {
            assert_eq!(b.write(0x50, &[3], true, true).await, 1);
        },
    ));

    assert_eq!(
        sim.wire(),
        [
            Wire::Start,
            Wire::Byte(0xA0),
            Wire::Byte(1),
            Wire::Byte(2),
            Wire::Stop,
            Wire::Start,
            Wire::Byte(0xA0),
            Wire::Byte(3),
            Wire::Stop,
        ]
    );
    assert!(!state.is_locked());
}

#[test]
fn reset_waits_for_the_open_transaction() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut a = I2c::new(&sim, &state, config());
    let mut b = I2c::new_shared(&sim, &state, config());

    block_on(join(
        async {
            assert_eq!(a.write(0x50, &[1], true, false).await, 1);
            yield_now().await;
            // held by the transfer, not stuck
            sim.0.borrow_mut().state = BusState::Data;
            yield_now().await;
            sim.0.borrow_mut().state = BusState::DataAck;
            assert_eq!(a.write_continue(&[2], true).await, 1);
        },
        async {
            b.reset().await;
        },
    ));

    assert_eq!(state.diagnostics().bus_resets, 0);
    assert_eq!(sim.pulses(), 0);
    assert_eq!(sim.wire().last(), Some(&Wire::Stop));
    assert!(!state.is_locked());
}

#[test]
fn hal_transaction_merges_reads() {
    let sim = Sim::new(Some(0x50));
    sim.0.borrow_mut().to_read.extend([1, 2, 3]);
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let mut a = [0u8; 1];
    let mut b = [0u8; 2];
    block_on(async {
        let mut ops = [
            embedded_hal::i2c::Operation::Read(&mut a),
            embedded_hal::i2c::Operation::Read(&mut b),
        ];
        i2c.transaction(0x50, &mut ops).await
    })
    .unwrap();

    assert_eq!((a, b), ([1], [2, 3]));
    assert_eq!(
        sim.wire(),
        [
            Wire::Start,
            Wire::Byte(0xA1),
            Wire::Read(1),
            Wire::MasterAck,
            Wire::Read(2),
            Wire::MasterAck,
            Wire::Read(3),
            Wire::MasterNack,
            Wire::Stop,
        ]
    );
}

#[test]
fn hal_errors_map_to_kinds() {
    let sim = Sim::new(Some(0x50));
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let err = block_on(embedded_hal_async::i2c::I2c::write(&mut i2c, 0x20, &[1])).unwrap_err();
    assert_eq!(err, i2c::Error::Nack);
    assert!(matches!(
        embedded_hal::i2c::Error::kind(&err),
        embedded_hal::i2c::ErrorKind::NoAcknowledge(_)
    ));
}

#[test]
fn slave_serves_a_read() {
    let sim = Sim::new(None);
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    {
        let mut s = sim.0.borrow_mut();
        s.incoming = Some(0xA1);
        s.master_wants = 2;
    }

    block_on(async {
        let request = i2c.slave_wait(SlaveRequest::Any, Duration::from_millis(20)).await;
        assert_eq!(request, SlaveRequest::Read);
        // the master NACKs the second byte to end its read
        assert_eq!(i2c.slave_write(&[0x11, 0x22, 0x33]).await, 1);
        i2c.slave_done().await;
    });

    assert_eq!(sim.wire(), [Wire::Read(0x11), Wire::Read(0x22)]);
    assert!(!state.is_locked());
}

#[test]
fn slave_wait_times_out() {
    let sim = Sim::new(None);
    let state = State::new();
    let mut i2c = I2c::new(&sim, &state, config());

    let request = block_on(i2c.slave_wait(SlaveRequest::Write, Duration::from_millis(5)));
    assert_eq!(request, SlaveRequest::None);
    assert!(!i2c.in_transaction());
}
