//! USB device stack for the OTG core
//!
//! [`Device`] owns the control endpoint and up to [`MAX_ENDPOINTS`] double buffered endpoints per
//! direction. Interrupts are handled in [`Device::on_interrupt`]; requests that need more than a
//! register poke are handed to the control task running inside [`Device::run`].

use core::cell::{RefCell, UnsafeCell};
use core::marker::PhantomData;
use core::ops::BitOr;
use core::ptr::NonNull;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::Timer;
use embassy_usb_driver::{Direction, EndpointAddress, EndpointType};

use crate::sleep::DeepSleepGuard;

mod descriptor;
mod endpoint;
mod setup;

pub use descriptor::{config_attributes, descriptor_type, find_endpoint, walk, Descriptors};
pub use endpoint::{DeviceInEndpoint, DeviceOutEndpoint};
use endpoint::{InEndpointState, OutEndpointState};
pub use setup::{feature, request, Recipient, RequestType, SetupPacket};

/// Endpoints per direction besides the control endpoint.
pub const MAX_ENDPOINTS: usize = 6;
/// Back to back SETUP packets the control endpoint can buffer.
pub const SETUP_SLOTS: usize = 3;
/// Largest OUT data stage accepted, and largest copied IN reply.
pub const CONTROL_BUFFER: usize = 64;

const RX_FIFO_WORDS: u16 = 64;
const TX_FIFO_WORDS: u16 = 16;

/// Core interrupt sources, as in `GINTSTS`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Events(pub u32);

impl Events {
    pub const NONE: Self = Self(0);
    pub const SUSPEND: Self = Self(1 << 11);
    pub const RESET: Self = Self(1 << 12);
    pub const ENUM_DONE: Self = Self(1 << 13);
    pub const IN_ENDPOINT: Self = Self(1 << 18);
    pub const OUT_ENDPOINT: Self = Self(1 << 19);
    pub const WAKEUP: Self = Self(1 << 31);

    /// Enabled until enumeration completes.
    pub const INIT: Self = Self(Self::RESET.0 | Self::ENUM_DONE.0 | Self::SUSPEND.0);
    pub const ALL: Self = Self(Self::INIT.0 | Self::IN_ENDPOINT.0 | Self::OUT_ENDPOINT.0 | Self::WAKEUP.0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Events {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Endpoint interrupt sources, as in `DIEPINTx`/`DOEPINTx`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EpStatus(pub u32);

impl EpStatus {
    pub const TRANSFER_COMPLETE: Self = Self(1 << 0);
    /// OUT only: SETUP phase done.
    pub const SETUP: Self = Self(1 << 3);
    /// OUT only: more than one SETUP packet arrived back to back.
    pub const BACK_TO_BACK_SETUP: Self = Self(1 << 6);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for EpStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// OTG core access in device mode.
///
/// Transfers are DMA based: memory handed to [`transmit`](Bus::transmit),
/// [`receive`](Bus::receive) and [`arm_setup`](Bus::arm_setup) is accessed by the core after the
/// call returns, until the matching completion.
pub trait Bus {
    /// Endpoints implemented per direction, besides endpoint 0.
    fn endpoints(&self) -> usize;

    /// Enable the core, soft reset it and force device mode.
    fn core_enable(&self);
    /// Full speed, 80% periodic frame interval, transmit thresholding.
    fn device_setup(&self);
    /// Enable the pull-up.
    fn connect(&self);

    fn set_irq_enabled(&self, enabled: bool);
    fn set_core_interrupts(&self, mask: Events);
    /// Read and clear the enabled core interrupt flags.
    fn take_core_events(&self) -> Events;
    fn full_speed(&self) -> bool;
    fn set_address(&self, address: u8);

    /// `DAINT`: IN endpoints in bits 0..15, OUT endpoints in bits 16..31.
    fn endpoint_interrupts(&self) -> u32;
    /// Read and clear an endpoint's interrupt flags.
    fn take_endpoint_status(&self, ep: EndpointAddress) -> EpStatus;

    /// Disable all endpoints and unmask the control endpoint interrupts.
    fn reset_endpoints(&self);
    fn rx_fifo_setup(&self, words: u16);
    fn tx_fifo_setup(&self, ep: usize, start: u16, words: u16);

    /// Arm endpoint 0 OUT for `slots` SETUP packets written consecutively from `buffer`.
    fn arm_setup(&self, buffer: *mut u8, slots: usize);
    /// SETUP slots still free.
    fn setup_count(&self) -> usize;
    /// Current DMA address of an endpoint.
    fn dma_address(&self, ep: EndpointAddress) -> usize;

    fn activate(&self, ep: EndpointAddress, ep_type: EndpointType, max_packet_size: u16);
    fn deactivate(&self, ep: EndpointAddress);
    fn is_active(&self, ep: EndpointAddress) -> bool;
    fn set_stalled(&self, ep: EndpointAddress, stalled: bool);
    fn is_stalled(&self, ep: EndpointAddress) -> bool;
    fn max_packet_size(&self, ep: EndpointAddress) -> usize;

    /// Send `len` bytes from `data` on IN endpoint `ep`, split into packets by the core.
    fn transmit(&self, ep: usize, data: *const u8, len: usize);
    /// Receive up to `len` bytes into `buffer` on OUT endpoint `ep`.
    fn receive(&self, ep: usize, buffer: *mut u8, len: usize);
    /// Bytes of the last receive on `ep` left unfilled.
    fn remaining(&self, ep: usize) -> usize;
}

impl<T: Bus + ?Sized> Bus for &T {
    fn endpoints(&self) -> usize {
        T::endpoints(self)
    }
    fn core_enable(&self) {
        T::core_enable(self)
    }
    fn device_setup(&self) {
        T::device_setup(self)
    }
    fn connect(&self) {
        T::connect(self)
    }
    fn set_irq_enabled(&self, enabled: bool) {
        T::set_irq_enabled(self, enabled)
    }
    fn set_core_interrupts(&self, mask: Events) {
        T::set_core_interrupts(self, mask)
    }
    fn take_core_events(&self) -> Events {
        T::take_core_events(self)
    }
    fn full_speed(&self) -> bool {
        T::full_speed(self)
    }
    fn set_address(&self, address: u8) {
        T::set_address(self, address)
    }
    fn endpoint_interrupts(&self) -> u32 {
        T::endpoint_interrupts(self)
    }
    fn take_endpoint_status(&self, ep: EndpointAddress) -> EpStatus {
        T::take_endpoint_status(self, ep)
    }
    fn reset_endpoints(&self) {
        T::reset_endpoints(self)
    }
    fn rx_fifo_setup(&self, words: u16) {
        T::rx_fifo_setup(self, words)
    }
    fn tx_fifo_setup(&self, ep: usize, start: u16, words: u16) {
        T::tx_fifo_setup(self, ep, start, words)
    }
    fn arm_setup(&self, buffer: *mut u8, slots: usize) {
        T::arm_setup(self, buffer, slots)
    }
    fn setup_count(&self) -> usize {
        T::setup_count(self)
    }
    fn dma_address(&self, ep: EndpointAddress) -> usize {
        T::dma_address(self, ep)
    }
    fn activate(&self, ep: EndpointAddress, ep_type: EndpointType, max_packet_size: u16) {
        T::activate(self, ep, ep_type, max_packet_size)
    }
    fn deactivate(&self, ep: EndpointAddress) {
        T::deactivate(self, ep)
    }
    fn is_active(&self, ep: EndpointAddress) -> bool {
        T::is_active(self, ep)
    }
    fn set_stalled(&self, ep: EndpointAddress, stalled: bool) {
        T::set_stalled(self, ep, stalled)
    }
    fn is_stalled(&self, ep: EndpointAddress) -> bool {
        T::is_stalled(self, ep)
    }
    fn max_packet_size(&self, ep: EndpointAddress) -> usize {
        T::max_packet_size(self, ep)
    }
    fn transmit(&self, ep: usize, data: *const u8, len: usize) {
        T::transmit(self, ep, data, len)
    }
    fn receive(&self, ep: usize, buffer: *mut u8, len: usize) {
        T::receive(self, ep, buffer, len)
    }
    fn remaining(&self, ep: usize) -> usize {
        T::remaining(self, ep)
    }
}

/// Device state as seen by the host.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    None,
    Default,
    Addressed,
    Configured,
}

/// Control endpoint state.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControlState {
    Idle,
    DataRx,
    Processing,
    DataTx,
    StatusRx,
    StatusTx,
    Stall,
}

enum Reply<'d> {
    Accept,
    Buffered(usize),
    Slice(&'d [u8]),
}

/// Answer to a control request.
///
/// Dropping the reply without answering stalls the request.
pub struct ControlReply<'r, 'd> {
    outcome: &'r mut Option<Reply<'d>>,
    buffer: &'r mut [u8; CONTROL_BUFFER],
}

impl<'r, 'd> ControlReply<'r, 'd> {
    /// Complete the request without data.
    pub fn accept(self) {
        *self.outcome = Some(Reply::Accept);
    }

    /// Reply with `data`, copied. At most [`CONTROL_BUFFER`] bytes are sent.
    pub fn data(self, data: &[u8]) {
        if data.len() > CONTROL_BUFFER {
            warn!("control reply truncated to {}", CONTROL_BUFFER);
        }
        let n = data.len().min(CONTROL_BUFFER);
        self.buffer[..n].copy_from_slice(&data[..n]);
        *self.outcome = Some(Reply::Buffered(n));
    }

    /// Reply with `data` that outlives the transfer.
    pub fn data_static(self, data: &'d [u8]) {
        *self.outcome = Some(Reply::Slice(data));
    }

    /// Reject the request.
    pub fn stall(self) {
        *self.outcome = None;
    }
}

/// Class and vendor request handling.
pub trait ControlHandler {
    /// `data` holds the OUT data stage, empty for IN requests. Requests left unanswered stall.
    fn control(&mut self, setup: &SetupPacket, data: &[u8], reply: ControlReply<'_, '_>) {
        let _ = (setup, data, reply);
    }
}

impl ControlHandler for () {}

/// Remaining IN data stage.
#[derive(Copy, Clone)]
enum Payload<'d> {
    Buffered { start: usize, end: usize },
    Slice(&'d [u8]),
}

impl<'d> Payload<'d> {
    const EMPTY: Self = Self::Buffered { start: 0, end: 0 };

    fn len(&self) -> usize {
        match self {
            Self::Buffered { start, end } => end - start,
            Self::Slice(s) => s.len(),
        }
    }

    fn truncate(&mut self, len: usize) {
        match self {
            Self::Buffered { start, end } => *end = (*start + len).min(*end),
            Self::Slice(s) => *s = &s[..len.min(s.len())],
        }
    }

    /// Split off up to `n` bytes from the front.
    fn take(&mut self, n: usize, buffer: *const u8) -> (*const u8, usize) {
        let n = n.min(self.len());
        match self {
            Self::Buffered { start, .. } => {
                let p = buffer.wrapping_add(*start);
                *start += n;
                (p, n)
            }
            Self::Slice(s) => {
                let p = s.as_ptr();
                *s = &s[n..];
                (p, n)
            }
        }
    }
}

#[repr(C, align(4))]
struct ControlBuffers {
    setup: [u8; 8 * SETUP_SLOTS],
    rx: [u8; CONTROL_BUFFER],
    tx: [u8; CONTROL_BUFFER],
}

struct Inner<'d> {
    state: DeviceState,
    control: ControlState,
    setup: SetupPacket,
    tx: Payload<'d>,
    /// Terminate a short IN data stage with an empty packet.
    zlp: bool,
    config: Option<usize>,
    suspended: bool,
    remote_wakeup: bool,
    full_speed: bool,
    /// Endpoint memory handed out since the last configuration.
    allocated: usize,
}

const NEW_IN: InEndpointState = InEndpointState::new();
const NEW_OUT: OutEndpointState = OutEndpointState::new();

fn ep0_in() -> EndpointAddress {
    EndpointAddress::from_parts(0, Direction::In)
}

fn ep0_out() -> EndpointAddress {
    EndpointAddress::from_parts(0, Direction::Out)
}

/// USB device.
pub struct Device<'d, B: Bus> {
    bus: B,
    descriptors: Descriptors<'d>,
    inner: Mutex<RefCell<Inner<'d>>>,
    buffers: UnsafeCell<ControlBuffers>,
    control_pending: Signal<CriticalSectionRawMutex, ()>,
    memory: NonNull<u8>,
    memory_len: usize,
    ins: [InEndpointState; MAX_ENDPOINTS],
    outs: [OutEndpointState; MAX_ENDPOINTS],
    _memory: PhantomData<&'d mut [u8]>,
}

// Shared state lives in critical section cells, control buffers are owned by the current control
// stage.
unsafe impl<'d, B: Bus + Sync> Sync for Device<'d, B> {}

impl<'d, B: Bus> Device<'d, B> {
    /// `memory` backs the endpoint double buffers of the active configuration.
    pub fn new(bus: B, descriptors: Descriptors<'d>, memory: &'d mut [u8]) -> Self {
        let memory_len = memory.len();
        Self {
            bus,
            descriptors,
            inner: Mutex::new(RefCell::new(Inner {
                state: DeviceState::None,
                control: ControlState::Idle,
                setup: SetupPacket::default(),
                tx: Payload::EMPTY,
                zlp: false,
                config: None,
                suspended: false,
                remote_wakeup: false,
                full_speed: false,
                allocated: 0,
            })),
            buffers: UnsafeCell::new(ControlBuffers {
                setup: [0; 8 * SETUP_SLOTS],
                rx: [0; CONTROL_BUFFER],
                tx: [0; CONTROL_BUFFER],
            }),
            control_pending: Signal::new(),
            memory: NonNull::from(memory).cast(),
            memory_len,
            ins: [NEW_IN; MAX_ENDPOINTS],
            outs: [NEW_OUT; MAX_ENDPOINTS],
            _memory: PhantomData,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    fn endpoints(&self) -> usize {
        self.bus.endpoints().min(MAX_ENDPOINTS)
    }

    pub fn state(&self) -> DeviceState {
        critical_section::with(|cs| self.inner.borrow_ref(cs).state)
    }

    pub fn control_state(&self) -> ControlState {
        critical_section::with(|cs| self.inner.borrow_ref(cs).control)
    }

    pub fn is_suspended(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).suspended)
    }

    pub fn is_full_speed(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).full_speed)
    }

    pub fn remote_wakeup_enabled(&self) -> bool {
        critical_section::with(|cs| self.inner.borrow_ref(cs).remote_wakeup)
    }

    /// `bConfigurationValue` of the active configuration, 0 when unconfigured.
    pub fn configuration(&self) -> u8 {
        let config = critical_section::with(|cs| self.inner.borrow_ref(cs).config);
        config
            .and_then(|i| self.descriptors.config(i))
            .map_or(0, descriptor::config_value)
    }

    /// IN endpoint `n`, counted from 1. `None` past the endpoints of the core.
    pub fn endpoint_in(&self, n: usize) -> Option<DeviceInEndpoint<'_, B>> {
        if n == 0 || n > self.endpoints() {
            return None;
        }
        let state = self.ins.get(n - 1)?;
        Some(DeviceInEndpoint {
            bus: &self.bus,
            addr: EndpointAddress::from_parts(n, Direction::In),
            state,
        })
    }

    /// OUT endpoint `n`, counted from 1. `None` past the endpoints of the core.
    pub fn endpoint_out(&self, n: usize) -> Option<DeviceOutEndpoint<'_, B>> {
        if n == 0 || n > self.endpoints() {
            return None;
        }
        let state = self.outs.get(n - 1)?;
        Some(DeviceOutEndpoint {
            bus: &self.bus,
            addr: EndpointAddress::from_parts(n, Direction::Out),
            state,
        })
    }

    fn buffers(&self) -> *mut ControlBuffers {
        self.buffers.get()
    }

    fn setup_buffer(&self) -> *mut u8 {
        unsafe { core::ptr::addr_of_mut!((*self.buffers()).setup) as *mut u8 }
    }

    fn rx_buffer(&self) -> *mut u8 {
        unsafe { core::ptr::addr_of_mut!((*self.buffers()).rx) as *mut u8 }
    }

    fn tx_buffer(&self) -> *mut u8 {
        unsafe { core::ptr::addr_of_mut!((*self.buffers()).tx) as *mut u8 }
    }

    /// Bring up the core and serve control requests. Never returns.
    pub async fn run<H: ControlHandler>(&self, handler: &mut H) -> ! {
        let _sleep = DeepSleepGuard::new();

        self.bus.set_irq_enabled(false);
        self.bus.core_enable();
        Timer::after_millis(30).await;

        self.bus.device_setup();
        self.bus.connect();
        debug!("usb: ready for connection");

        self.bus.set_core_interrupts(Events::INIT);
        self.bus.set_irq_enabled(true);

        loop {
            self.control_pending.wait().await;
            self.handle_control(handler);
        }
    }

    /// Interrupt handler body.
    pub fn on_interrupt(&self) {
        let events = self.bus.take_core_events();

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);

            if events.intersects(Events::RESET | Events::WAKEUP | Events::IN_ENDPOINT | Events::OUT_ENDPOINT) {
                if inner.suspended {
                    debug!("usb: wakeup");
                }
                inner.suspended = false;
            } else if events.contains(Events::SUSPEND) {
                if !inner.suspended {
                    debug!("usb: suspend");
                }
                inner.suspended = true;
            }

            if events.contains(Events::RESET) {
                self.bus_reset(&mut inner);
            }

            if events.contains(Events::ENUM_DONE) {
                inner.full_speed = self.bus.full_speed();
                inner.state = DeviceState::Default;
                debug!("usb: enumerated, full speed {}", inner.full_speed);
                self.bus.set_core_interrupts(Events::ALL);
            }

            if events.contains(Events::IN_ENDPOINT) {
                self.handle_in(&mut inner);
            }

            if events.contains(Events::OUT_ENDPOINT) {
                self.handle_out(&mut inner);
            }
        });
    }

    fn bus_reset(&self, inner: &mut Inner<'d>) {
        debug!("usb: reset");
        inner.state = DeviceState::Default;
        inner.config = None;
        inner.remote_wakeup = false;
        self.bus.set_address(0);

        self.bus.reset_endpoints();
        for (i, o) in self.ins.iter().zip(self.outs.iter()) {
            i.reset();
            o.reset();
        }

        // one shared receive FIFO, one thresholded transmit FIFO per IN endpoint
        self.bus.rx_fifo_setup(RX_FIFO_WORDS);
        let mut start = RX_FIFO_WORDS;
        for ep in 0..=self.endpoints() {
            self.bus.tx_fifo_setup(ep, start, TX_FIFO_WORDS);
            start += TX_FIFO_WORDS;
        }

        self.control_setup(inner);
    }

    fn control_setup(&self, inner: &mut Inner<'d>) {
        self.bus.arm_setup(self.setup_buffer(), SETUP_SLOTS);
        inner.control = ControlState::Idle;
    }

    fn control_stall(&self, inner: &mut Inner<'d>) {
        self.bus.set_stalled(ep0_out(), true);
        self.bus.set_stalled(ep0_in(), true);
        self.control_setup(inner);
        inner.control = ControlState::Stall;
    }

    fn handle_in(&self, inner: &mut Inner<'d>) {
        let mask = self.bus.endpoint_interrupts();
        if mask & 1 != 0 {
            self.handle_in_control(inner);
        }
        for n in 1..=self.endpoints() {
            if mask & 1 << n == 0 {
                continue;
            }
            let addr = EndpointAddress::from_parts(n, Direction::In);
            let status = self.bus.take_endpoint_status(addr);
            if status.contains(EpStatus::TRANSFER_COMPLETE) {
                self.ins[n - 1].transfer_complete(&self.bus, addr);
            }
        }
    }

    fn handle_out(&self, inner: &mut Inner<'d>) {
        let mask = self.bus.endpoint_interrupts();
        if mask & 1 << 16 != 0 {
            self.handle_out_control(inner);
        }
        for n in 1..=self.endpoints() {
            if mask & 1 << (16 + n) == 0 {
                continue;
            }
            let addr = EndpointAddress::from_parts(n, Direction::Out);
            let status = self.bus.take_endpoint_status(addr);
            if status.contains(EpStatus::TRANSFER_COMPLETE) {
                self.outs[n - 1].transfer_complete(&self.bus, addr);
            }
        }
    }

    /// The packet the latest SETUP interrupt refers to.
    fn latest_setup(&self, status: EpStatus) -> SetupPacket {
        let base = self.setup_buffer() as usize;
        let slot = if status.contains(EpStatus::BACK_TO_BACK_SETUP) {
            // the DMA address points right past the last packet written
            let end = self.bus.dma_address(ep0_out());
            let offset = end.wrapping_sub(base).wrapping_sub(8);
            if offset % 8 == 0 && offset / 8 < SETUP_SLOTS {
                offset / 8
            } else {
                0
            }
        } else {
            let n = self.bus.setup_count();
            if n >= SETUP_SLOTS {
                0
            } else {
                SETUP_SLOTS - 1 - n
            }
        };

        let raw = unsafe { core::ptr::read_volatile(self.setup_buffer().add(slot * 8) as *const [u8; 8]) };
        SetupPacket::parse(&raw)
    }

    fn handle_out_control(&self, inner: &mut Inner<'d>) {
        let status = self.bus.take_endpoint_status(ep0_out());

        if status.contains(EpStatus::SETUP) {
            let setup = self.latest_setup(status);
            trace!("usb: setup {:#x} {:#x}", setup.request_type, setup.request);
            inner.setup = setup;

            if setup.has_out_data() {
                if setup.length as usize > CONTROL_BUFFER {
                    debug!("usb: control OUT too long, {}", setup.length);
                    self.control_stall(inner);
                } else {
                    self.bus.receive(0, self.rx_buffer(), CONTROL_BUFFER);
                    inner.control = ControlState::DataRx;
                }
            } else {
                inner.control = ControlState::Processing;
                self.control_pending.signal(());
            }
        } else if status.contains(EpStatus::TRANSFER_COMPLETE) {
            match inner.control {
                ControlState::DataRx => {
                    let received = CONTROL_BUFFER.saturating_sub(self.bus.remaining(0));
                    if received != inner.setup.length as usize {
                        debug!("usb: control OUT got {} of {}", received, inner.setup.length);
                        self.control_stall(inner);
                    } else {
                        inner.control = ControlState::Processing;
                        self.control_pending.signal(());
                    }
                }
                ControlState::StatusRx => {
                    let mps = self.bus.max_packet_size(ep0_out());
                    if self.bus.remaining(0) != mps {
                        debug!("usb: data in control status stage");
                    }
                    self.control_setup(inner);
                }
                _ => {}
            }
        }
    }

    fn handle_in_control(&self, inner: &mut Inner<'d>) {
        let status = self.bus.take_endpoint_status(ep0_in());
        if !status.contains(EpStatus::TRANSFER_COMPLETE) {
            return;
        }

        match inner.control {
            ControlState::StatusTx => self.control_setup(inner),
            ControlState::DataTx => {
                let mps = self.bus.max_packet_size(ep0_in());
                if inner.tx.len() != 0 {
                    let (p, n) = inner.tx.take(mps, self.tx_buffer());
                    self.bus.transmit(0, p, n);
                } else if inner.zlp {
                    inner.zlp = false;
                    self.bus.transmit(0, self.tx_buffer(), 0);
                } else {
                    self.bus.receive(0, self.rx_buffer(), mps);
                    inner.control = ControlState::StatusRx;
                }
            }
            _ => {}
        }
    }

    fn handle_control<H: ControlHandler>(&self, handler: &mut H) {
        let setup = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            (inner.control == ControlState::Processing).then_some(inner.setup)
        });
        let Some(setup) = setup else {
            return;
        };

        let mut outcome = None;
        {
            // only the control task touches these while processing
            let buffers = unsafe { &mut *self.buffers() };
            let reply = ControlReply {
                outcome: &mut outcome,
                buffer: &mut buffers.tx,
            };

            match setup.kind() {
                RequestType::Standard => self.standard_request(&setup, reply),
                _ => {
                    let data: &[u8] = if setup.has_out_data() {
                        &buffers.rx[..(setup.length as usize).min(CONTROL_BUFFER)]
                    } else {
                        &[]
                    };
                    handler.control(&setup, data, reply);
                }
            }
        }

        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.control != ControlState::Processing || inner.setup != setup {
                debug!("usb: control request superseded");
                return;
            }
            match outcome {
                Some(reply) => self.control_success(&mut inner, reply),
                None => {
                    debug!("usb: unsupported control request {:#x} {:#x}", setup.request_type, setup.request);
                    self.control_stall(&mut inner);
                }
            }
        });
    }

    fn control_success(&self, inner: &mut Inner<'d>, reply: Reply<'d>) {
        let setup = inner.setup;
        if !setup.is_in() {
            if !matches!(reply, Reply::Accept) {
                debug!("usb: data for an OUT request dropped");
            }
            inner.control = ControlState::StatusTx;
            self.bus.transmit(0, self.tx_buffer(), 0);
            return;
        }

        let mut payload = match reply {
            Reply::Accept => Payload::EMPTY,
            Reply::Buffered(n) => Payload::Buffered { start: 0, end: n },
            Reply::Slice(s) => Payload::Slice(s),
        };
        payload.truncate(setup.length as usize);

        let mps = self.bus.max_packet_size(ep0_in()).max(1);
        let total = payload.len();
        inner.zlp = total != 0 && total < setup.length as usize && total % mps == 0;

        let (p, n) = payload.take(mps, self.tx_buffer());
        inner.tx = payload;
        inner.control = ControlState::DataTx;
        trace!("usb: control reply {}", total);
        self.bus.transmit(0, p, n);
    }

    fn standard_request(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        match setup.request {
            request::GET_STATUS => self.get_status(setup, reply),
            request::CLEAR_FEATURE => self.feature(setup, false, reply),
            request::SET_FEATURE => self.feature(setup, true, reply),
            request::SET_ADDRESS => self.set_address(setup, reply),
            request::GET_DESCRIPTOR => self.get_descriptor(setup, reply),
            request::GET_CONFIGURATION => self.get_configuration(setup, reply),
            request::SET_CONFIGURATION => self.set_configuration(setup, reply),
            _ => {}
        }
    }

    fn endpoint_from_index(&self, index: u16) -> Option<EndpointAddress> {
        let addr = EndpointAddress::from(index as u8);
        (index & 0xFF70 == 0 && addr.index() <= self.endpoints()).then_some(addr)
    }

    fn get_status(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        if !setup.is_in() || setup.value != 0 || setup.length != 2 {
            debug!("usb: GET_STATUS malformed");
            return;
        }

        let (state, config, remote_wakeup) = critical_section::with(|cs| {
            let inner = self.inner.borrow_ref(cs);
            (inner.state, inner.config, inner.remote_wakeup)
        });

        match setup.recipient() {
            Recipient::Device if setup.index == 0 => {
                let attributes = config
                    .and_then(|i| self.descriptors.config(i))
                    .map_or(0, descriptor::config_attributes);
                let mut status = 0u16;
                if attributes & config_attributes::SELF_POWERED != 0 {
                    status |= 1 << 0;
                }
                if remote_wakeup {
                    status |= 1 << 1;
                }
                reply.data(&status.to_le_bytes());
            }
            Recipient::Interface if state == DeviceState::Configured => reply.data(&[0, 0]),
            Recipient::Endpoint => {
                if let Some(ep) = self.endpoint_from_index(setup.index) {
                    let halted = self.bus.is_stalled(ep) as u8;
                    reply.data(&[halted, 0]);
                }
            }
            _ => {}
        }
    }

    fn feature(&self, setup: &SetupPacket, set: bool, reply: ControlReply<'_, 'd>) {
        if setup.length != 0 {
            debug!("usb: FEATURE malformed");
            return;
        }

        match setup.recipient() {
            Recipient::Device if setup.index == 0 => {
                critical_section::with(|cs| {
                    let mut inner = self.inner.borrow_ref_mut(cs);
                    let Some(config) = inner.config.and_then(|i| self.descriptors.config(i)) else {
                        return;
                    };
                    if inner.state != DeviceState::Configured || setup.value != feature::DEVICE_REMOTE_WAKEUP {
                        return;
                    }
                    if descriptor::config_attributes(config) & config_attributes::REMOTE_WAKEUP != 0 {
                        trace!("usb: remote wakeup {}", set);
                        inner.remote_wakeup = set;
                        reply.accept();
                    }
                });
            }
            Recipient::Endpoint => {
                let Some(ep) = self.endpoint_from_index(setup.index) else {
                    return;
                };
                if ep.index() == 0 || setup.value != feature::ENDPOINT_HALT {
                    return;
                }
                trace!("usb: endpoint {:#x} halt {}", setup.index, set);
                self.bus.set_stalled(ep, set);
                reply.accept();
            }
            _ => {}
        }
    }

    fn set_address(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        if setup.recipient() != Recipient::Device
            || setup.is_in()
            || setup.index != 0
            || setup.length != 0
            || setup.value > 127
        {
            debug!("usb: SET_ADDRESS malformed");
            return;
        }

        trace!("usb: address {}", setup.value);
        self.bus.set_address(setup.value as u8);
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.state = match (inner.state, setup.value) {
                (DeviceState::Default, 1..) => DeviceState::Addressed,
                (DeviceState::Addressed, 0) => DeviceState::Default,
                (state, _) => state,
            };
        });
        reply.accept();
    }

    fn get_descriptor(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        if setup.recipient() != Recipient::Device || !setup.is_in() {
            debug!("usb: GET_DESCRIPTOR malformed");
            return;
        }

        let index = setup.descriptor_index() as usize;
        let data = match setup.descriptor_type() {
            descriptor_type::DEVICE if index == 0 => Some(self.descriptors.device),
            descriptor_type::CONFIGURATION => self.descriptors.config(index),
            descriptor_type::STRING => self.descriptors.string(index),
            _ => None,
        };

        match data {
            Some(data) => reply.data_static(data),
            None => debug!("usb: no descriptor {:#x}", setup.value),
        }
    }

    fn get_configuration(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        if setup.recipient() != Recipient::Device
            || !setup.is_in()
            || setup.index != 0
            || setup.value != 0
            || setup.length != 1
        {
            debug!("usb: GET_CONFIGURATION malformed");
            return;
        }
        reply.data(&[self.configuration()]);
    }

    fn set_configuration(&self, setup: &SetupPacket, reply: ControlReply<'_, 'd>) {
        if setup.recipient() != Recipient::Device || setup.index != 0 || setup.length != 0 || setup.value > 255 {
            debug!("usb: SET_CONFIGURATION malformed");
            return;
        }

        let value = setup.value as u8;
        let config = critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            match inner.state {
                DeviceState::Addressed | DeviceState::Configured if value != 0 => {
                    let index = self.descriptors.find_config(value)?;
                    let attributes = self.descriptors.config(index).map_or(0, descriptor::config_attributes);
                    inner.config = Some(index);
                    inner.remote_wakeup = attributes & config_attributes::REMOTE_WAKEUP != 0;
                    inner.state = DeviceState::Configured;
                }
                DeviceState::Configured => {
                    inner.config = None;
                    inner.state = DeviceState::Addressed;
                }
                _ => {}
            }
            Some(inner.config)
        });

        let Some(config) = config else {
            debug!("usb: unknown configuration {}", value);
            return;
        };

        self.configure_endpoints(config);
        reply.accept();
    }

    fn configure_endpoints(&self, config: Option<usize>) {
        let config = config.and_then(|i| self.descriptors.config(i));
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).allocated = 0);

        for n in 1..=self.endpoints() {
            let addr = EndpointAddress::from_parts(n, Direction::In);
            if self.bus.is_active(addr) {
                self.bus.deactivate(addr);
            }
            let info = config.and_then(|c| find_endpoint(c, addr));
            let buffers = info.and_then(|info| {
                let size = endpoint::buffer_size(&info)?;
                let base = self.allocate(size * 2)?;
                self.bus.activate(addr, info.ep_type, info.max_packet_size);
                debug!("usb: IN {} max packet {} buffers {}", n, info.max_packet_size, size);
                Some((base, size))
            });
            match buffers {
                Some((base, size)) => self.ins[n - 1].configure(Some(base), size),
                None => self.ins[n - 1].configure(None, 0),
            }
        }

        for n in 1..=self.endpoints() {
            let addr = EndpointAddress::from_parts(n, Direction::Out);
            if self.bus.is_active(addr) {
                self.bus.deactivate(addr);
            }
            let info = config.and_then(|c| find_endpoint(c, addr));
            let buffers = info.and_then(|info| {
                let size = endpoint::buffer_size(&info)?;
                let base = self.allocate(size * 2)?;
                self.bus.activate(addr, info.ep_type, info.max_packet_size);
                debug!("usb: OUT {} max packet {} buffers {}", n, info.max_packet_size, size);
                Some((base, size))
            });
            match buffers {
                Some((base, size)) => self.outs[n - 1].configure(&self.bus, addr, Some(base), size),
                None => self.outs[n - 1].configure(&self.bus, addr, None, 0),
            }
        }
    }

    /// Word aligned chunk of endpoint memory.
    fn allocate(&self, len: usize) -> Option<NonNull<u8>> {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            let base = self.memory.as_ptr() as usize;
            let start = ((base + inner.allocated + 3) & !3) - base;
            if start + len > self.memory_len {
                error!("usb: out of endpoint memory, {} more needed", start + len - self.memory_len);
                return None;
            }
            inner.allocated = start + len;
            NonNull::new(self.memory.as_ptr().wrapping_add(start))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_splits_into_packets() {
        let data = [7u8; 100];
        let mut p = Payload::Slice(&data);
        p.truncate(90);
        let (_, n) = p.take(64, core::ptr::null());
        assert_eq!(n, 64);
        assert_eq!(p.len(), 26);

        let buf = [0u8; 8];
        let mut p = Payload::Buffered { start: 0, end: 5 };
        let (ptr, n) = p.take(4, buf.as_ptr());
        assert_eq!((ptr, n), (buf.as_ptr(), 4));
        let (ptr, n) = p.take(4, buf.as_ptr());
        assert_eq!((ptr as usize - buf.as_ptr() as usize, n), (4, 1));
        assert_eq!(p.len(), 0);
    }

    #[test]
    fn events_masks() {
        assert!(Events::ALL.contains(Events::INIT));
        assert!(!Events::INIT.intersects(Events::IN_ENDPOINT));
        assert!((Events::RESET | Events::SUSPEND).intersects(Events::INIT));
    }
}
