//! Linked DMA controller (LDMA)
//!
//! Channels are handed out by [`Ldma::acquire`] according to their request selector and stay with
//! one owner until [`Ldma::release`]. Every channel has its root descriptor in the controller's
//! registers; further descriptors are linked from memory, see [`DescriptorPool`].

use core::future::poll_fn;
use core::task::Poll;

use embassy_sync::waitqueue::AtomicWaker;

mod descriptor;
mod pool;

pub use descriptor::{Descriptor, Flags, Link, MAX_TRANSFER};
pub use pool::{DescriptorPool, POOL_SIZE};

/// Upper bound on channels of any supported part.
pub const MAX_CHANNELS: usize = 8;

/// `REQSEL` value for a peripheral source and signal.
pub const fn request(source: u32, signal: u32) -> u32 {
    source << 16 | signal
}

/// Request selector of a software triggered channel.
pub const REQUEST_NONE: u32 = 0;

/// Index of an acquired channel.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelHandle(u8);

impl ChannelHandle {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    fn mask(self) -> u32 {
        1 << self.0
    }
}

/// Register access of the LDMA block.
///
/// Channel sets take a bit mask, as in the `CHEN`/`CHDONE`/`IEN` registers.
pub trait Controller {
    /// Channels implemented by the part.
    fn channels(&self) -> usize;

    fn request_select(&self, ch: usize) -> u32;
    fn set_request_select(&self, ch: usize, value: u32);

    /// Set or clear `CHEN` bits.
    fn set_enabled(&self, mask: u32, on: bool);
    fn enabled(&self) -> u32;
    fn busy(&self) -> u32;

    /// Set or clear `CHDONE` bits, together with the matching `IF` bits.
    fn set_done(&self, mask: u32, on: bool);
    fn done(&self) -> u32;

    fn set_interrupts(&self, mask: u32, on: bool);
    fn interrupts(&self) -> u32;

    /// Read the channel's descriptor registers.
    fn root(&self, ch: usize) -> Descriptor;
    /// Write the channel's descriptor registers.
    fn set_root(&self, ch: usize, desc: &Descriptor);
    fn set_root_link(&self, ch: usize, link: Link);
    fn set_root_dst(&self, ch: usize, dst: usize);

    /// Load the descriptor pointed to by the root `LINK` (`LINKLOAD`).
    fn link_load(&self, mask: u32);

    /// NVIC line of the controller.
    fn set_irq_enabled(&self, enabled: bool);
}

impl<T: Controller + ?Sized> Controller for &T {
    fn channels(&self) -> usize {
        T::channels(self)
    }
    fn request_select(&self, ch: usize) -> u32 {
        T::request_select(self, ch)
    }
    fn set_request_select(&self, ch: usize, value: u32) {
        T::set_request_select(self, ch, value)
    }
    fn set_enabled(&self, mask: u32, on: bool) {
        T::set_enabled(self, mask, on)
    }
    fn enabled(&self) -> u32 {
        T::enabled(self)
    }
    fn busy(&self) -> u32 {
        T::busy(self)
    }
    fn set_done(&self, mask: u32, on: bool) {
        T::set_done(self, mask, on)
    }
    fn done(&self) -> u32 {
        T::done(self)
    }
    fn set_interrupts(&self, mask: u32, on: bool) {
        T::set_interrupts(self, mask, on)
    }
    fn interrupts(&self) -> u32 {
        T::interrupts(self)
    }
    fn root(&self, ch: usize) -> Descriptor {
        T::root(self, ch)
    }
    fn set_root(&self, ch: usize, desc: &Descriptor) {
        T::set_root(self, ch, desc)
    }
    fn set_root_link(&self, ch: usize, link: Link) {
        T::set_root_link(self, ch, link)
    }
    fn set_root_dst(&self, ch: usize, dst: usize) {
        T::set_root_dst(self, ch, dst)
    }
    fn link_load(&self, mask: u32) {
        T::link_load(self, mask)
    }
    fn set_irq_enabled(&self, enabled: bool) {
        T::set_irq_enabled(self, enabled)
    }
}

const NEW_AW: AtomicWaker = AtomicWaker::new();

/// LDMA driver.
pub struct Ldma<C: Controller> {
    regs: C,
    wakers: [AtomicWaker; MAX_CHANNELS],
}

impl<C: Controller> Ldma<C> {
    pub const fn new(regs: C) -> Self {
        Self {
            regs,
            wakers: [NEW_AW; MAX_CHANNELS],
        }
    }

    pub fn regs(&self) -> &C {
        &self.regs
    }

    fn channels(&self) -> usize {
        self.regs.channels().min(MAX_CHANNELS)
    }

    /// Allocate a channel for the `request` selector.
    ///
    /// With `reuse`, a channel already configured for the same selector is returned. Otherwise
    /// the first channel without a selector is claimed. `None` when all channels are in use.
    pub fn acquire(&self, request: u32, reuse: bool) -> Option<ChannelHandle> {
        critical_section::with(|_| {
            let n = self.channels();
            if reuse && request != REQUEST_NONE {
                if let Some(ch) = (0..n).find(|&ch| self.regs.request_select(ch) == request) {
                    return Some(ChannelHandle(ch as u8));
                }
            }

            // a software triggered channel still needs a non-zero selector to count as taken
            let value = if request == REQUEST_NONE { 1 } else { request };
            match (0..n).find(|&ch| self.regs.request_select(ch) == 0) {
                Some(ch) => {
                    self.regs.set_request_select(ch, value);
                    Some(ChannelHandle(ch as u8))
                }
                None => {
                    error!("no free DMA channel for request {:#x}", request);
                    None
                }
            }
        })
    }

    /// Detach the channel from its source, making it available again.
    pub fn release(&self, ch: ChannelHandle) {
        debug_assert!(!self.is_enabled(ch));
        self.regs.set_interrupts(ch.mask(), false);
        self.regs.set_request_select(ch.index(), 0);
    }

    /// Channels that can still be acquired.
    pub fn free_channels(&self) -> usize {
        (0..self.channels())
            .filter(|&ch| self.regs.request_select(ch) == 0)
            .count()
    }

    pub fn enable(&self, ch: ChannelHandle) {
        self.regs.set_enabled(ch.mask(), true)
    }

    pub fn disable(&self, ch: ChannelHandle) {
        self.regs.set_enabled(ch.mask(), false)
    }

    pub fn is_enabled(&self, ch: ChannelHandle) -> bool {
        self.regs.enabled() & ch.mask() != 0
    }

    /// Whether the channel is in the middle of a transfer.
    pub fn is_busy(&self, ch: ChannelHandle) -> bool {
        self.regs.busy() & ch.mask() != 0
    }

    /// Disable the channel and spin until it has let go of its descriptor.
    pub fn halt(&self, ch: ChannelHandle) {
        self.disable(ch);
        while self.is_busy(ch) {}
    }

    /// Raise the done flag from software, waking a [`wait_done`](Self::wait_done).
    pub fn set_done(&self, ch: ChannelHandle) {
        self.regs.set_done(ch.mask(), true);
        self.wakers[ch.index()].wake();
    }

    pub fn clear_done(&self, ch: ChannelHandle) {
        self.regs.set_done(ch.mask(), false)
    }

    pub fn is_done(&self, ch: ChannelHandle) -> bool {
        self.regs.done() & ch.mask() != 0
    }

    /// Load `desc` into the root registers. The channel must be halted.
    pub fn load(&self, ch: ChannelHandle, desc: &Descriptor) {
        debug_assert!(!self.is_enabled(ch) && !self.is_busy(ch));
        self.regs.set_root(ch.index(), desc)
    }

    pub fn root(&self, ch: ChannelHandle) -> Descriptor {
        self.regs.root(ch.index())
    }

    pub fn set_root_link(&self, ch: ChannelHandle, link: Link) {
        self.regs.set_root_link(ch.index(), link)
    }

    pub fn set_root_dst(&self, ch: ChannelHandle, dst: usize) {
        self.regs.set_root_dst(ch.index(), dst)
    }

    /// Descriptor the root links to next, null at the end of the chain.
    pub fn linked(&self, ch: ChannelHandle) -> *mut Descriptor {
        Link(self.root(ch).link).decode(0)
    }

    /// Point the root link at `desc` and load it.
    pub fn link_load(&self, ch: ChannelHandle, desc: *const Descriptor) {
        self.regs.set_root_link(ch.index(), Link::to(desc));
        self.regs.link_load(ch.mask());
    }

    /// Wait for the channel's done flag, then clear it.
    ///
    /// Only descriptors with [`Flags::SET_DONE`] raise the flag.
    pub async fn wait_done(&self, ch: ChannelHandle) {
        self.regs.set_irq_enabled(true);
        poll_fn(|cx| {
            self.wakers[ch.index()].register(cx.waker());

            if self.is_done(ch) {
                self.regs.set_interrupts(ch.mask(), false);
                Poll::Ready(())
            } else {
                self.regs.set_interrupts(ch.mask(), true);
                Poll::Pending
            }
        })
        .await;
        self.clear_done(ch);
    }

    /// Interrupt handler body.
    pub fn on_interrupt(&self) {
        let pending = self.regs.done() & self.regs.interrupts();
        if pending == 0 {
            return;
        }
        self.regs.set_interrupts(pending, false);
        for ch in 0..self.channels() {
            if pending & 1 << ch != 0 {
                self.wakers[ch].wake();
            }
        }
    }
}
