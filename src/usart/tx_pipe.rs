use core::future::poll_fn;
use core::sync::atomic::{AtomicBool, Ordering};
use core::task::Poll;

use embassy_sync::waitqueue::AtomicWaker;
use embassy_time::{with_timeout, Duration};

use super::{Usart, UsartSignal};
use crate::dma::{ChannelHandle, Controller, Descriptor, Flags, Ldma, Link, MAX_TRANSFER};
use crate::internal::drop::OnDrop;
use crate::pipe::Pipe;
use crate::sleep::DeepSleepGuard;

/// Drains a pipe into the transmitter.
///
/// Each contiguous span of the pipe goes out as one descriptor. The span is consumed once the
/// controller reports the descriptor done.
pub struct TxPipe<'d, C: Controller, U: Usart, const N: usize> {
    ldma: &'d Ldma<C>,
    usart: U,
    pipe: &'d Pipe<N>,
    running: AtomicBool,
    stop_waker: AtomicWaker,
}

impl<'d, C: Controller, U: Usart, const N: usize> TxPipe<'d, C, U, N> {
    pub fn new(ldma: &'d Ldma<C>, usart: U, pipe: &'d Pipe<N>) -> Self {
        Self {
            ldma,
            usart,
            pipe,
            running: AtomicBool::new(false),
            stop_waker: AtomicWaker::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Transmit until the pipe is closed and drained.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("transmit pipe already running");
            return;
        }

        let request = self.usart.dma_request(UsartSignal::TxFree);
        let Some(ch) = self.ldma.acquire(request, true) else {
            self.running.store(false, Ordering::Release);
            return;
        };
        debug!("transmit pipe starting on channel {}", ch.index());

        let _teardown = OnDrop::new(|| {
            self.ldma.halt(ch);
            self.usart.tx_disable();
            self.ldma.release(ch);
            self.running.store(false, Ordering::Release);
            self.stop_waker.wake();
        });

        while self.pipe.require().await {
            let _sleep = DeepSleepGuard::new();
            let sent = self.send_span(ch).await;
            self.pipe.consume(sent);
        }

        debug!("transmit pipe finished");
    }

    async fn send_span(&self, ch: ChannelHandle) -> usize {
        let span = self.pipe.span();
        let len = span.len().min(MAX_TRANSFER);
        trace!("sending {}", len);

        let desc = Descriptor::transfer(
            span.as_ptr() as usize,
            self.usart.tx_data_addr(),
            len,
            Flags::M2P | Flags::UNIT_BYTE | Flags::SET_DONE,
            Link::NONE,
        );
        self.ldma.clear_done(ch);
        self.ldma.link_load(ch, &desc);
        self.usart.tx_enable();
        self.ldma.wait_done(ch).await;
        len
    }

    /// Close the pipe and wait until the remaining data went out.
    ///
    /// Returns `false` if transmission did not finish within `timeout`.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.pipe.close();

        let stopped = poll_fn(|cx| {
            self.stop_waker.register(cx.waker());
            if self.is_running() {
                Poll::Pending
            } else {
                Poll::Ready(())
            }
        });

        if with_timeout(timeout, stopped).await.is_err() {
            error!("transmit pipe failed to stop");
            return false;
        }
        true
    }
}
