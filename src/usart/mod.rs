//! USART - Universal Synchronous Asynchronous Receiver Transmitter
//!
//! DMA driven streaming. [`RxPipe`] keeps the receiver feeding a [`Pipe`](crate::pipe::Pipe) with
//! descriptors queued ahead of the controller, [`TxPipe`] drains a pipe into the transmitter one
//! contiguous span at a time.

mod rx_pipe;
mod tx_pipe;

pub use rx_pipe::RxPipe;
pub use tx_pipe::TxPipe;

/// LDMA request signals of a USART.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsartSignal {
    /// Receive data available.
    RxDataValid,
    /// Transmit buffer has room.
    TxFree,
    /// Transmitter completely idle.
    TxEmpty,
}

/// Hardware access used by the pipes.
pub trait Usart {
    fn rx_enable(&self);
    fn rx_disable(&self);
    fn tx_enable(&self);
    fn tx_disable(&self);

    /// Address of `RXDATA`, the source of receive transfers.
    fn rx_data_addr(&self) -> usize;
    /// Address of `TXDATA`, the destination of transmit transfers.
    fn tx_data_addr(&self) -> usize;

    /// `REQSEL` value routing `signal` of this instance to a DMA channel.
    fn dma_request(&self, signal: UsartSignal) -> u32;

    /// Receive data valid interrupt, used to notice DMA progress.
    fn set_rx_interrupt(&self, enabled: bool);
}

impl<T: Usart + ?Sized> Usart for &T {
    fn rx_enable(&self) {
        T::rx_enable(self)
    }
    fn rx_disable(&self) {
        T::rx_disable(self)
    }
    fn tx_enable(&self) {
        T::tx_enable(self)
    }
    fn tx_disable(&self) {
        T::tx_disable(self)
    }
    fn rx_data_addr(&self) -> usize {
        T::rx_data_addr(self)
    }
    fn tx_data_addr(&self) -> usize {
        T::tx_data_addr(self)
    }
    fn dma_request(&self, signal: UsartSignal) -> u32 {
        T::dma_request(self, signal)
    }
    fn set_rx_interrupt(&self, enabled: bool) {
        T::set_rx_interrupt(self, enabled)
    }
}

/// Receive pipe config
#[non_exhaustive]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct RxConfig {
    /// Largest segment handed to one descriptor.
    pub block_size: usize,
}

impl Default for RxConfig {
    fn default() -> Self {
        Self { block_size: 256 }
    }
}
