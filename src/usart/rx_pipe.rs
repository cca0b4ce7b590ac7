use core::cell::Cell;
use core::future::poll_fn;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

use critical_section::Mutex;
use embassy_futures::join::join;
use embassy_futures::select::{select, Either};
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{with_timeout, Duration};

use super::{RxConfig, Usart, UsartSignal};
use crate::dma::{ChannelHandle, Controller, Descriptor, DescriptorPool, Flags, Ldma, Link, MAX_TRANSFER};
use crate::internal::drop::OnDrop;
use crate::pipe::Pipe;
use crate::sleep::DeepSleepGuard;

/// Streams received bytes into a pipe.
///
/// A DMA task hands free pipe space to the controller segment by segment. A monitor follows the
/// destination pointer of the active descriptor and publishes bytes as soon as they land, so the
/// reader does not have to wait for a segment to fill up.
///
/// With a [`DescriptorPool`] further segments are chained behind the running one and the receiver
/// never waits for software. Without one, the root descriptor is reused and a new segment is only
/// started once the previous one completed.
pub struct RxPipe<'d, C: Controller, U: Usart, const N: usize> {
    ldma: &'d Ldma<C>,
    usart: U,
    pipe: &'d Pipe<N>,
    pool: Option<&'d DescriptorPool>,
    config: RxConfig,

    channel: Mutex<Cell<Option<ChannelHandle>>>,
    /// Pool descriptors handed to the controller, oldest first, as an address.
    alloc_list: Mutex<Cell<usize>>,
    armed: AtomicBool,
    finished: AtomicBool,
    monitor_waker: AtomicWaker,
    stop_waker: AtomicWaker,
}

impl<'d, C: Controller, U: Usart, const N: usize> RxPipe<'d, C, U, N> {
    pub fn new(
        ldma: &'d Ldma<C>,
        usart: U,
        pipe: &'d Pipe<N>,
        pool: Option<&'d DescriptorPool>,
        mut config: RxConfig,
    ) -> Self {
        // an empty segment would never complete
        config.block_size = config.block_size.clamp(1, MAX_TRANSFER);
        Self {
            ldma,
            usart,
            pipe,
            pool,
            config,
            channel: Mutex::new(Cell::new(None)),
            alloc_list: Mutex::new(Cell::new(0)),
            armed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            monitor_waker: AtomicWaker::new(),
            stop_waker: AtomicWaker::new(),
        }
    }

    /// Channel in use while running.
    pub fn channel(&self) -> Option<ChannelHandle> {
        critical_section::with(|cs| self.channel.borrow(cs).get())
    }

    fn set_channel(&self, ch: Option<ChannelHandle>) {
        critical_section::with(|cs| self.channel.borrow(cs).set(ch));
        self.stop_waker.wake();
    }

    pub fn is_running(&self) -> bool {
        self.channel().is_some()
    }

    /// Receive until the pipe is closed or [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        if self.is_running() {
            warn!("receive pipe already running");
            return;
        }

        let request = self.usart.dma_request(UsartSignal::RxDataValid);
        let Some(ch) = self.ldma.acquire(request, true) else {
            return;
        };
        self.set_channel(Some(ch));
        self.armed.store(false, Ordering::Relaxed);
        self.finished.store(false, Ordering::Relaxed);
        debug!("receive pipe starting on channel {}", ch.index());

        let teardown = OnDrop::new(|| {
            self.usart.rx_disable();
            self.usart.set_rx_interrupt(false);
            self.ldma.halt(ch);
            self.ldma.set_root_dst(ch, 0);
            self.free_descriptors(core::ptr::null());
            self.ldma.release(ch);
            self.set_channel(None);
        });

        join(self.dma_task(ch), self.monitor(ch)).await;

        drop(teardown);
        debug!("receive pipe finished");
    }

    /// Close the pipe and wait for the DMA to let go of it.
    ///
    /// Returns `false` if the channel did not stop within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.pipe.close();
        let Some(ch) = self.channel() else {
            return true;
        };

        debug!("stopping receive pipe");
        self.ldma.disable(ch);
        self.ldma.set_done(ch);
        self.monitor_waker.wake();

        let stopped = poll_fn(|cx| {
            self.stop_waker.register(cx.waker());
            if self.is_running() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        });

        if with_timeout(timeout, stopped).await.is_err() {
            error!("receive pipe failed to stop");
            return false;
        }
        true
    }

    /// Receive data interrupt body.
    pub fn on_interrupt(&self) {
        self.usart.set_rx_interrupt(false);
        self.monitor_waker.wake();
    }

    fn descriptor_flags(&self) -> Flags {
        let flags = Flags::P2M | Flags::UNIT_BYTE;
        match self.pool {
            Some(_) => flags,
            None => flags | Flags::SET_DONE,
        }
    }

    async fn dma_task(&self, ch: ChannelHandle) {
        let _sleep = DeepSleepGuard::new();
        let ldma = self.ldma;
        let pipe = self.pipe;
        let mut dmapos = pipe.position();

        loop {
            if pipe.is_closed() {
                break;
            }
            if pipe.free_after(dmapos) == 0 && !pipe.wait_free_after(dmapos).await {
                break;
            }

            if self.pool.is_none() && ldma.is_enabled(ch) {
                // one segment in flight at a time
                match select(ldma.wait_done(ch), pipe.wait_closed()).await {
                    Either::First(()) => continue,
                    Either::Second(()) => break,
                }
            }

            let running = ldma.is_enabled(ch);
            if running {
                // never touch descriptors the controller may be fetching
                ldma.halt(ch);
            }

            let (ptr, len) = pipe.buffer_at(dmapos);
            let len = len.min(self.config.block_size).min(MAX_TRANSFER);
            let desc = Descriptor::transfer(
                self.usart.rx_data_addr(),
                ptr as usize,
                len,
                self.descriptor_flags(),
                Link::NONE,
            );

            if !running {
                trace!("segment {:#x}+{}", ptr as usize, len);
                ldma.clear_done(ch);
                ldma.load(ch, &desc);
            } else if let Some(pool) = self.pool {
                let generation = pool.generation();
                let Some(next) = pool.alloc() else {
                    // out of descriptors, let the chain drain a bit
                    ldma.enable(ch);
                    match select(pool.released(generation), pipe.wait_closed()).await {
                        Either::First(()) => continue,
                        Either::Second(()) => break,
                    }
                };
                trace!("linking segment {:#x}+{}", ptr as usize, len);
                unsafe { Descriptor::write(next.as_ptr(), desc) };
                self.append(ch, next);
            } else {
                // halted with nothing to chain onto, reload on the next pass
                continue;
            }

            dmapos = dmapos.add(len);
            ldma.enable(ch);
            self.usart.rx_enable();
            self.armed.store(true, Ordering::Release);
            self.monitor_waker.wake();
        }

        self.usart.rx_disable();
        ldma.halt(ch);
        // zero DST tells the monitor the channel is gone
        ldma.set_root_dst(ch, 0);
        self.finished.store(true, Ordering::Release);
        self.monitor_waker.wake();
    }

    /// Link `desc` behind the last descriptor of the running chain. The channel must be halted.
    fn append(&self, ch: ChannelHandle, desc: NonNull<Descriptor>) {
        let link = Link::to(desc.as_ptr());
        let first = self.ldma.linked(ch);

        if first.is_null() {
            // the root is the tail; keep consumed descriptors reachable for freeing
            critical_section::with(|cs| {
                let list = self.alloc_list.borrow(cs);
                match Self::last_of(list.get() as *mut Descriptor) {
                    Some(tail) => unsafe {
                        let mut d = Descriptor::read(tail);
                        d.set_link(link);
                        Descriptor::write(tail, d);
                    },
                    None => list.set(desc.as_ptr() as usize),
                }
            });
            self.ldma.set_root_link(ch, link);
        } else {
            // already chained, we must have an allocation list
            debug_assert!(critical_section::with(|cs| self.alloc_list.borrow(cs).get()) != 0);
            if let Some(tail) = Self::last_of(first) {
                unsafe {
                    let mut d = Descriptor::read(tail);
                    d.set_link(link);
                    Descriptor::write(tail, d);
                }
            }
        }
    }

    fn last_of(mut desc: *mut Descriptor) -> Option<*mut Descriptor> {
        if desc.is_null() {
            return None;
        }
        loop {
            let next = unsafe { Descriptor::read(desc) }.linked(desc as usize);
            if next.is_null() {
                return Some(desc);
            }
            desc = next;
        }
    }

    /// Free pool descriptors up to, not including, `stop`.
    fn free_descriptors(&self, stop: *const Descriptor) {
        let Some(pool) = self.pool else {
            return;
        };
        critical_section::with(|cs| {
            let list = self.alloc_list.borrow(cs);
            let mut p = list.get() as *mut Descriptor;
            while !p.is_null() && p as *const Descriptor != stop {
                let next = unsafe { Descriptor::read(p) }.linked(p as usize);
                if let Some(d) = NonNull::new(p) {
                    pool.free(d);
                }
                p = next;
            }
            list.set(p as usize);
        })
    }

    async fn monitor(&self, ch: ChannelHandle) {
        let ldma = self.ldma;
        let pipe = self.pipe;

        // nothing to watch until the first segment is armed
        poll_fn(|cx| {
            self.monitor_waker.register(cx.waker());
            if self.armed.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await;

        while !pipe.is_closed() {
            // everything before the descriptor the root links to has been consumed
            self.free_descriptors(ldma.linked(ch));

            let p_max = ldma.root(ch).dst;
            if p_max == 0 {
                break;
            }

            loop {
                let (ptr, len) = pipe.buffer();
                if len == 0 {
                    break;
                }
                // once the DMA writes elsewhere, this wraps to more than the buffer holds
                let count = p_max.wrapping_sub(ptr as usize);
                if count == 0 {
                    break;
                }
                trace!("received {}", count.min(len));
                pipe.advance(count.min(len));
                if count <= len {
                    break;
                }
            }

            poll_fn(|cx| {
                self.monitor_waker.register(cx.waker());
                if ldma.root(ch).dst != p_max || pipe.is_closed() {
                    Poll::Ready(())
                } else {
                    self.usart.set_rx_interrupt(true);
                    Poll::Pending
                }
            })
            .await;
        }

        self.usart.set_rx_interrupt(false);
    }
}
