use core::cell::RefCell;
use core::future::poll_fn;
use core::ptr::NonNull;
use core::task::Poll;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex as AsyncMutex;
use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{with_timeout, Duration, Instant};
use embassy_usb_driver::{Direction, EndpointAddress, EndpointInfo, EndpointType};

use super::Bus;

/// Bytes per buffer half for an endpoint.
pub(super) fn buffer_size(info: &EndpointInfo) -> Option<usize> {
    let mps = info.max_packet_size as usize;
    match (info.ep_type, info.addr.direction()) {
        // enough to fill a full speed frame
        (EndpointType::Bulk, Direction::In) if mps == 64 => Some(mps * 19),
        (EndpointType::Bulk, _) => Some(mps * 4),
        // one transaction per frame
        (EndpointType::Interrupt | EndpointType::Isochronous, _) => Some(mps),
        (EndpointType::Control, _) => None,
    }
}

#[derive(Default)]
struct InBuffers {
    base: Option<NonNull<u8>>,
    size: usize,
    /// Bytes handed to the hardware, per half.
    tx: [usize; 2],
    /// Bytes filled, per half.
    used: [usize; 2],
    /// Half bound to the hardware.
    bound: Option<usize>,
    /// Half the next write goes to.
    fill: usize,
    /// Completed transfers, for writers waiting on a free half.
    completions: u32,
}

impl InBuffers {
    fn half(&self, base: NonNull<u8>, half: usize) -> *mut u8 {
        base.as_ptr().wrapping_add(half * self.size)
    }
}

pub(super) struct InEndpointState {
    buffers: Mutex<RefCell<InBuffers>>,
    lock: AsyncMutex<CriticalSectionRawMutex, ()>,
    waker: AtomicWaker,
}

// Buffers are only touched in critical sections.
unsafe impl Send for InBuffers {}

impl InEndpointState {
    pub(super) const fn new() -> Self {
        Self {
            buffers: Mutex::new(RefCell::new(InBuffers {
                base: None,
                size: 0,
                tx: [0; 2],
                used: [0; 2],
                bound: None,
                fill: 0,
                completions: 0,
            })),
            lock: AsyncMutex::new(()),
            waker: AtomicWaker::new(),
        }
    }

    /// Attach `size` bytes per half at `base`, or detach with `None`.
    pub(super) fn configure(&self, base: Option<NonNull<u8>>, size: usize) {
        critical_section::with(|cs| {
            *self.buffers.borrow_ref_mut(cs) = InBuffers {
                base,
                size: if base.is_some() { size } else { 0 },
                ..Default::default()
            }
        });
        self.waker.wake();
    }

    /// The hardware dropped whatever it was sending.
    pub(super) fn reset(&self) {
        self.configure(None, 0)
    }

    /// Half currently bound to the hardware.
    pub(super) fn bound(&self) -> Option<usize> {
        critical_section::with(|cs| self.buffers.borrow_ref(cs).bound)
    }

    /// Transfer complete interrupt.
    pub(super) fn transfer_complete<B: Bus>(&self, bus: &B, addr: EndpointAddress) {
        critical_section::with(|cs| {
            let mut b = self.buffers.borrow_ref_mut(cs);
            let Some(base) = b.base else {
                return;
            };

            if let Some(half) = b.bound {
                if b.tx[half] != 0 {
                    b.used[half] = 0;
                    b.tx[half] = 0;
                    b.completions = b.completions.wrapping_add(1);
                }
            }

            // continue with the other half, if it has anything
            let next = match b.bound {
                Some(half) => half ^ 1,
                None => b.fill,
            };
            if b.used[next] != 0 {
                b.tx[next] = b.used[next];
                b.bound = Some(next);
                bus.transmit(addr.index(), b.half(base, next), b.used[next]);
            } else {
                b.bound = None;
            }
        });
        self.waker.wake();
    }
}

pub(super) struct OutEndpointState {
    buffers: Mutex<RefCell<OutBuffers>>,
    waker: AtomicWaker,
}

#[derive(Default)]
struct OutBuffers {
    base: Option<NonNull<u8>>,
    size: usize,
    /// Bytes received, per half.
    used: [usize; 2],
    /// Half receiving, `None` while both are full.
    bound: Option<usize>,
    /// Read cursor, half and offset.
    rx: (usize, usize),
}

unsafe impl Send for OutBuffers {}

impl OutBuffers {
    fn half(&self, base: NonNull<u8>, half: usize) -> *mut u8 {
        base.as_ptr().wrapping_add(half * self.size)
    }
}

impl OutEndpointState {
    pub(super) const fn new() -> Self {
        Self {
            buffers: Mutex::new(RefCell::new(OutBuffers {
                base: None,
                size: 0,
                used: [0; 2],
                bound: None,
                rx: (0, 0),
            })),
            waker: AtomicWaker::new(),
        }
    }

    /// Attach buffers and start receiving into the first half.
    pub(super) fn configure<B: Bus>(&self, bus: &B, addr: EndpointAddress, base: Option<NonNull<u8>>, size: usize) {
        critical_section::with(|cs| {
            let mut b = self.buffers.borrow_ref_mut(cs);
            *b = OutBuffers {
                base,
                size: if base.is_some() { size } else { 0 },
                ..Default::default()
            };
            if let Some(base) = base {
                b.bound = Some(0);
                bus.receive(addr.index(), b.half(base, 0), size);
            }
        });
        self.waker.wake();
    }

    pub(super) fn reset(&self) {
        critical_section::with(|cs| *self.buffers.borrow_ref_mut(cs) = OutBuffers::default());
        self.waker.wake();
    }

    /// Transfer complete interrupt.
    pub(super) fn transfer_complete<B: Bus>(&self, bus: &B, addr: EndpointAddress) {
        critical_section::with(|cs| {
            let mut b = self.buffers.borrow_ref_mut(cs);
            let (Some(base), Some(half)) = (b.base, b.bound) else {
                return;
            };

            let received = b.size.saturating_sub(bus.remaining(addr.index()));
            let mut next = half;
            if received != 0 {
                b.used[half] = received;
                next = half ^ 1;
            }

            if b.used[next] != 0 {
                // both halves full, wait for the reader
                b.bound = None;
            } else {
                b.bound = Some(next);
                bus.receive(addr.index(), b.half(base, next), b.size);
            }
        });
        self.waker.wake();
    }
}

/// Double buffered IN endpoint.
///
/// Writes are serialized. Data is copied into whichever half is not bound to the hardware and
/// transmission continues from the other half on completion.
pub struct DeviceInEndpoint<'a, B: Bus> {
    pub(super) bus: &'a B,
    pub(super) addr: EndpointAddress,
    pub(super) state: &'a InEndpointState,
}

enum Step {
    Copied(usize),
    Wait(u32),
    Inactive,
}

impl<'a, B: Bus> DeviceInEndpoint<'a, B> {
    pub fn address(&self) -> EndpointAddress {
        self.addr
    }

    pub fn is_configured(&self) -> bool {
        critical_section::with(|cs| self.state.buffers.borrow_ref(cs).base.is_some())
    }

    /// Queue `data` for transmission.
    ///
    /// Returns the number of bytes queued, short when `timeout` elapsed while both halves were
    /// busy or the endpoint is not configured.
    pub async fn write(&self, data: &[u8], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let Ok(_guard) = with_timeout(timeout, self.state.lock.lock()).await else {
            return 0;
        };

        let mut sent = 0;
        while sent < data.len() {
            match self.fill(&data[sent..]) {
                Step::Copied(n) => sent += n,
                Step::Inactive => break,
                Step::Wait(completions) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if with_timeout(left, self.completion_after(completions)).await.is_err() {
                        break;
                    }
                }
            }
        }
        sent
    }

    fn fill(&self, data: &[u8]) -> Step {
        critical_section::with(|cs| {
            let mut b = self.state.buffers.borrow_ref_mut(cs);
            let Some(base) = b.base else {
                return Step::Inactive;
            };

            let mut half = b.fill;
            let mut used = b.used[half];
            if used != 0 && b.tx[half] != 0 {
                // the fill half went out already
                if b.used[half ^ 1] != 0 {
                    return Step::Wait(b.completions);
                }
                half ^= 1;
                b.fill = half;
                used = 0;
            }
            if used == 0 {
                b.tx[half] = 0;
            }

            let free = b.size - used;
            let block = data.len().min(free);
            unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), b.half(base, half).add(used), block) };
            b.used[half] = used + block;

            if b.bound.is_none() {
                b.bound = Some(half);
                b.tx[half] = b.used[half];
                self.bus.transmit(self.addr.index(), b.half(base, half), b.used[half]);
            }
            if block == free {
                b.fill = half ^ 1;
            }
            Step::Copied(block)
        })
    }

    async fn completion_after(&self, completions: u32) {
        poll_fn(|cx| {
            self.state.waker.register(cx.waker());
            let b = critical_section::with(|cs| {
                let b = self.state.buffers.borrow_ref(cs);
                (b.completions, b.base.is_some())
            });
            match b {
                (c, true) if c == completions => Poll::Pending,
                _ => Poll::Ready(()),
            }
        })
        .await
    }
}

/// Double buffered OUT endpoint.
pub struct DeviceOutEndpoint<'a, B: Bus> {
    pub(super) bus: &'a B,
    pub(super) addr: EndpointAddress,
    pub(super) state: &'a OutEndpointState,
}

impl<'a, B: Bus> DeviceOutEndpoint<'a, B> {
    pub fn address(&self) -> EndpointAddress {
        self.addr
    }

    pub fn is_configured(&self) -> bool {
        critical_section::with(|cs| self.state.buffers.borrow_ref(cs).base.is_some())
    }

    fn has_data(&self) -> bool {
        critical_section::with(|cs| {
            let b = self.state.buffers.borrow_ref(cs);
            b.used.iter().any(|&u| u != 0)
        })
    }

    /// Copy out received data, waiting up to `timeout` for the first byte.
    pub async fn read(&self, buf: &mut [u8], timeout: Duration) -> usize {
        let ready = poll_fn(|cx| {
            self.state.waker.register(cx.waker());
            if self.has_data() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        });
        if with_timeout(timeout, ready).await.is_err() {
            return 0;
        }

        critical_section::with(|cs| {
            let mut b = self.state.buffers.borrow_ref_mut(cs);
            let Some(base) = b.base else {
                return 0;
            };

            let mut read = 0;
            while read < buf.len() {
                let (half, offset) = b.rx;
                let used = b.used[half];
                if used == 0 {
                    break;
                }
                let avail = used - offset;
                let n = avail.min(buf.len() - read);
                unsafe { core::ptr::copy_nonoverlapping(b.half(base, half).add(offset), buf[read..].as_mut_ptr(), n) };
                read += n;

                if n < avail {
                    b.rx = (half, offset + n);
                    break;
                }

                // half drained, hand it back to the hardware if it was waiting
                b.rx = (half ^ 1, 0);
                b.used[half] = 0;
                if b.bound.is_none() {
                    b.bound = Some(half);
                    self.bus.receive(self.addr.index(), b.half(base, half), b.size);
                }
            }
            read
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(ep_type: EndpointType, dir: Direction, mps: u16) -> EndpointInfo {
        EndpointInfo {
            addr: EndpointAddress::from_parts(1, dir),
            ep_type,
            max_packet_size: mps,
            interval_ms: 0,
        }
    }

    #[test]
    fn buffer_sizes_follow_the_transfer_type() {
        assert_eq!(buffer_size(&info(EndpointType::Bulk, Direction::In, 64)), Some(64 * 19));
        assert_eq!(buffer_size(&info(EndpointType::Bulk, Direction::In, 32)), Some(32 * 4));
        assert_eq!(buffer_size(&info(EndpointType::Bulk, Direction::Out, 64)), Some(256));
        assert_eq!(buffer_size(&info(EndpointType::Interrupt, Direction::In, 8)), Some(8));
        assert_eq!(buffer_size(&info(EndpointType::Isochronous, Direction::Out, 192)), Some(192));
        assert_eq!(buffer_size(&info(EndpointType::Control, Direction::Out, 64)), None);
    }
}
