//! Memory-mapped I2C backend.

use core::marker::PhantomData;

use super::{Instance, StateFlags, Status};
use crate::regs::{Block, Classic, Generation, Reg, Series2, CLR_ALIAS};
use crate::time::Hertz;

/// Register offsets and quirks of one hardware generation.
pub trait Layout: Generation {
    /// Separate enable register, `None` when enable is `CTRL.EN`.
    const EN: Option<usize>;
    const CTRL: usize;
    const CMD: usize;
    const STATE: usize;
    const STATUS: usize;
    const CLKDIV: usize;
    const SADDR: usize;
    const SADDRMASK: usize;
    const RXDATA: usize;
    const TXDATA: usize;
    const IF: usize;
    const IEN: usize;

    /// Clear the given `IF` bits.
    fn clear_flags(block: Block, mask: u32);
}

const CTRL_EN: u32 = 1 << 0;

impl Layout for Classic {
    const EN: Option<usize> = None;
    const CTRL: usize = 0x00;
    const CMD: usize = 0x04;
    const STATE: usize = 0x08;
    const STATUS: usize = 0x0C;
    const CLKDIV: usize = 0x10;
    const SADDR: usize = 0x14;
    const SADDRMASK: usize = 0x18;
    const RXDATA: usize = 0x1C;
    const TXDATA: usize = 0x2C;
    const IF: usize = 0x34;
    const IEN: usize = 0x40;

    fn clear_flags(block: Block, mask: u32) {
        // IFC
        block.reg(0x3C).write(mask)
    }
}

impl Layout for Series2 {
    const EN: Option<usize> = Some(0x004);
    const CTRL: usize = 0x008;
    const CMD: usize = 0x00C;
    const STATE: usize = 0x010;
    const STATUS: usize = 0x014;
    const CLKDIV: usize = 0x018;
    const SADDR: usize = 0x01C;
    const SADDRMASK: usize = 0x020;
    const RXDATA: usize = 0x024;
    const TXDATA: usize = 0x034;
    const IF: usize = 0x03C;
    const IEN: usize = 0x040;

    fn clear_flags(block: Block, mask: u32) {
        block.reg(Self::IF + CLR_ALIAS).write(mask)
    }
}

/// An I2C instance accessed through its registers.
pub struct Registers<G: Layout> {
    block: Block,
    clock: Hertz,
    irq: fn(bool),
    _generation: PhantomData<G>,
}

impl<G: Layout> Registers<G> {
    /// # Safety
    ///
    /// `block` must be the base of an I2C instance of generation `G`, owned by this driver.
    /// `clock` is the frequency of the peripheral clock feeding it. `irq` enables or disables the
    /// instance's NVIC line.
    pub const unsafe fn new(block: Block, clock: Hertz, irq: fn(bool)) -> Self {
        Self {
            block,
            clock,
            irq,
            _generation: PhantomData,
        }
    }

    fn reg(&self, offset: usize) -> Reg {
        self.block.reg(offset)
    }
}

impl<G: Layout> Instance for Registers<G> {
    fn command(&self, cmd: u32) {
        self.reg(G::CMD).write(cmd)
    }

    fn status(&self) -> Status {
        Status(self.reg(G::STATE).read())
    }

    fn bus_status(&self) -> u32 {
        self.reg(G::STATUS).read()
    }

    fn flags(&self) -> StateFlags {
        StateFlags(self.reg(G::IF).read())
    }

    fn take_flags(&self) -> StateFlags {
        let flags = self.reg(G::IF).read();
        G::clear_flags(self.block, flags);
        StateFlags(flags)
    }

    fn set_interrupts(&self, mask: u32) {
        self.reg(G::IEN).write(mask)
    }

    fn interrupts(&self) -> u32 {
        self.reg(G::IEN).read()
    }

    fn send(&self, byte: u8) {
        self.reg(G::TXDATA).write(byte as u32)
    }

    fn receive(&self) -> u8 {
        self.reg(G::RXDATA).read() as u8
    }

    fn set_enabled(&self, enabled: bool) {
        match G::EN {
            Some(en) => G::write_bits(self.reg(en), 1, enabled),
            None => G::write_bits(self.reg(G::CTRL), CTRL_EN, enabled),
        }
    }

    fn set_control(&self, mask: u32, on: bool) {
        G::write_bits(self.reg(G::CTRL), mask, on)
    }

    fn clock(&self) -> Hertz {
        self.clock
    }

    fn set_clock_divider(&self, div: u32) {
        self.reg(G::CLKDIV).write(div & 0x1FF)
    }

    fn set_slave_address(&self, address: u8) {
        self.reg(G::SADDR).write(((address & 0x7F) as u32) << 1);
        self.reg(G::SADDRMASK).write(0x7F << 1);
    }

    fn set_irq_enabled(&self, enabled: bool) {
        (self.irq)(enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::i2c::{cmd, BusState};

    fn noop_irq(_: bool) {}

    /// Plain RAM stands in for the register block; large enough for the Series 2 aliases.
    fn ram() -> Vec<u32> {
        vec![0u32; (CLR_ALIAS + 0x100) / 4]
    }

    #[test]
    fn classic_layout_accesses() {
        let mut mem = ram();
        let base = mem.as_mut_ptr() as usize;
        let regs = unsafe { Registers::<Classic>::new(Block::new(base), Hertz::mhz(14), noop_irq) };

        regs.set_enabled(true);
        regs.set_control(crate::i2c::ctrl::AUTOSN, true);
        regs.command(cmd::START);
        regs.send(0xA0);
        regs.set_slave_address(0x42);

        assert_eq!(mem[0x00 / 4], CTRL_EN | crate::i2c::ctrl::AUTOSN);
        assert_eq!(mem[0x04 / 4], cmd::START);
        assert_eq!(mem[0x2C / 4], 0xA0);
        assert_eq!(mem[0x14 / 4], 0x84);

        mem[0x08 / 4] = Status::new(BusState::AddrAck, Status::BUSY).0;
        mem[0x34 / 4] = StateFlags::ACK;
        assert_eq!(regs.status().state(), BusState::AddrAck);
        assert!(regs.take_flags().ack());
        assert_eq!(mem[0x3C / 4], StateFlags::ACK);
    }

    #[test]
    fn series2_uses_enable_register_and_clear_alias() {
        let mut mem = ram();
        let base = mem.as_mut_ptr() as usize;
        mem[0x03C / 4] = StateFlags::NACK | StateFlags::MSTOP;

        let regs = unsafe { Registers::<Series2>::new(Block::new(base), Hertz::mhz(39), noop_irq) };
        regs.set_enabled(true);
        let flags = regs.take_flags();

        assert!(flags.nack() && flags.master_stop());
        assert_eq!(mem[(crate::regs::SET_ALIAS + 0x004) / 4], 1);
        assert_eq!(mem[(CLR_ALIAS + 0x03C) / 4], StateFlags::NACK | StateFlags::MSTOP);
    }
}
