//! Single-producer single-consumer byte pipe.
//!
//! The streaming engines move data through a [`Pipe`] without copying: the writer side hands out
//! raw free space for DMA to fill and publishes it with [`Pipe::advance`], the reader side exposes
//! contiguous spans for DMA to drain and releases them with [`Pipe::consume`].
//!
//! Both cursors are free-running [`Position`]s. Comparisons between them use wrapping arithmetic,
//! so a pipe may stream indefinitely.

use core::cell::UnsafeCell;
use core::future::poll_fn;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use core::task::Poll;

use embassy_sync::waitqueue::AtomicWaker;

/// `a >= b` for free-running counters.
pub const fn ovf_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// Monotonic cursor into a pipe's byte stream.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Position(pub u32);

impl Position {
    pub const fn add(self, n: usize) -> Self {
        Self(self.0.wrapping_add(n as u32))
    }

    /// Bytes from `earlier` to `self`, zero if `earlier` is actually later.
    pub const fn since(self, earlier: Position) -> usize {
        if ovf_ge(self.0, earlier.0) {
            self.0.wrapping_sub(earlier.0) as usize
        } else {
            0
        }
    }

    pub const fn is_at_or_after(self, other: Position) -> bool {
        ovf_ge(self.0, other.0)
    }
}

/// Byte pipe with `N` bytes of storage. `N` must be a power of two.
pub struct Pipe<const N: usize> {
    buf: UnsafeCell<[u8; N]>,
    write: AtomicU32,
    read: AtomicU32,
    closed: AtomicBool,
    reader: AtomicWaker,
    writer: AtomicWaker,
}

// One writer and one reader, each only touching the region its cursor owns.
unsafe impl<const N: usize> Sync for Pipe<N> {}

impl<const N: usize> Pipe<N> {
    const SIZE_OK: () = core::assert!(N.is_power_of_two() && N <= 1 << 31);

    pub const fn new() -> Self {
        let _ = Self::SIZE_OK;
        Self {
            buf: UnsafeCell::new([0; N]),
            write: AtomicU32::new(0),
            read: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            reader: AtomicWaker::new(),
            writer: AtomicWaker::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    fn base(&self) -> *mut u8 {
        self.buf.get() as *mut u8
    }

    fn offset(pos: Position) -> usize {
        pos.0 as usize & (N - 1)
    }

    fn read_position(&self) -> Position {
        Position(self.read.load(Ordering::Acquire))
    }

    // Writer side

    /// Position the next published byte goes to.
    pub fn position(&self) -> Position {
        Position(self.write.load(Ordering::Acquire))
    }

    /// Free bytes from `pos` on.
    ///
    /// `pos` may run ahead of [`position`](Self::position) when space was handed out but not yet
    /// published.
    pub fn free_after(&self, pos: Position) -> usize {
        self.read_position().add(N).since(pos)
    }

    /// Free bytes after the published position.
    pub fn free(&self) -> usize {
        self.free_after(self.position())
    }

    /// Contiguous free space starting at `pos`.
    pub fn buffer_at(&self, pos: Position) -> (*mut u8, usize) {
        let offset = Self::offset(pos);
        let len = self.free_after(pos).min(N - offset);
        (self.base().wrapping_add(offset), len)
    }

    /// Contiguous free space at the published position.
    pub fn buffer(&self) -> (*mut u8, usize) {
        self.buffer_at(self.position())
    }

    /// Publish `n` bytes written at the current position.
    pub fn advance(&self, n: usize) {
        debug_assert!(n <= self.free());
        let pos = self.position().add(n);
        self.write.store(pos.0, Ordering::Release);
        self.reader.wake();
    }

    /// Wait for free space after `pos`. Returns `false` once the pipe is closed.
    pub async fn wait_free_after(&self, pos: Position) -> bool {
        poll_fn(|cx| {
            self.writer.register(cx.waker());
            if self.is_closed() {
                Poll::Ready(false)
            } else if self.free_after(pos) > 0 {
                Poll::Ready(true)
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Copy `data` into the pipe, waiting for space as needed.
    ///
    /// Returns the number of bytes written, short only when the pipe was closed.
    pub async fn write(&self, data: &[u8]) -> usize {
        let mut done = 0;
        while done < data.len() {
            if !self.wait_free_after(self.position()).await {
                break;
            }
            let (ptr, len) = self.buffer();
            let n = len.min(data.len() - done);
            unsafe { core::ptr::copy_nonoverlapping(data[done..].as_ptr(), ptr, n) };
            self.advance(n);
            done += n;
        }
        done
    }

    /// End the stream. Both sides are woken.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.reader.wake();
        self.writer.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wait until the pipe is closed.
    pub async fn wait_closed(&self) {
        poll_fn(|cx| {
            self.writer.register(cx.waker());
            if self.is_closed() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    // Reader side

    /// Bytes published and not yet consumed.
    pub fn available(&self) -> usize {
        self.position().since(self.read_position())
    }

    /// Wait for data. Returns `false` once the pipe is closed and drained.
    pub async fn require(&self) -> bool {
        poll_fn(|cx| {
            self.reader.register(cx.waker());
            if self.available() > 0 {
                Poll::Ready(true)
            } else if self.is_closed() {
                Poll::Ready(false)
            } else {
                Poll::Pending
            }
        })
        .await
    }

    /// Contiguous readable data at the read position.
    pub fn span(&self) -> &[u8] {
        let pos = self.read_position();
        let offset = Self::offset(pos);
        let len = self.available().min(N - offset);
        unsafe { core::slice::from_raw_parts(self.base().add(offset), len) }
    }

    /// Release `n` bytes at the read position.
    pub fn consume(&self, n: usize) {
        debug_assert!(n <= self.available());
        let pos = self.read_position().add(n);
        self.read.store(pos.0, Ordering::Release);
        self.writer.wake();
    }

    /// Copy out as much as fits, waiting for at least one byte.
    ///
    /// Returns zero once the pipe is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        let mut done = 0;
        if buf.is_empty() || !self.require().await {
            return 0;
        }
        while done < buf.len() {
            let span = self.span();
            if span.is_empty() {
                break;
            }
            let n = span.len().min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&span[..n]);
            self.consume(n);
            done += n;
        }
        done
    }
}

impl<const N: usize> Default for Pipe<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_comparison() {
        assert!(ovf_ge(5, 5));
        assert!(ovf_ge(0x0000_0002, 0xFFFF_FFF0));
        assert!(!ovf_ge(0xFFFF_FFF0, 0x0000_0002));
        assert_eq!(Position(3).since(Position(0xFFFF_FFFE)), 5);
        assert_eq!(Position(1).since(Position(2)), 0);
    }

    #[test]
    fn buffer_stops_at_the_end_of_storage() {
        let pipe = Pipe::<16>::new();
        let (_, len) = pipe.buffer();
        assert_eq!(len, 16);

        pipe.advance(12);
        pipe.consume(12);
        let (ptr, len) = pipe.buffer();
        assert_eq!(len, 4);
        assert_eq!(ptr as usize - pipe.base() as usize, 12);

        // space handed out ahead of the published position
        let (ptr, len) = pipe.buffer_at(pipe.position().add(4));
        assert_eq!(len, 12);
        assert_eq!(ptr, pipe.base());
    }

    #[test]
    fn write_then_read_across_the_wrap() {
        let pipe = Pipe::<8>::new();
        embassy_futures::block_on(async {
            assert_eq!(pipe.write(&[1, 2, 3, 4, 5, 6]).await, 6);
            let mut out = [0; 4];
            assert_eq!(pipe.read(&mut out).await, 4);
            assert_eq!(out, [1, 2, 3, 4]);

            assert_eq!(pipe.write(&[7, 8, 9, 10, 11]).await, 5);
            assert_eq!(pipe.available(), 7);
            assert_eq!(pipe.span(), &[5, 6, 7, 8]);

            let mut out = [0; 8];
            assert_eq!(pipe.read(&mut out).await, 7);
            assert_eq!(&out[..7], &[5, 6, 7, 8, 9, 10, 11]);
        });
    }

    #[test]
    fn close_ends_both_sides() {
        let pipe = Pipe::<4>::new();
        embassy_futures::block_on(async {
            pipe.write(&[1, 2, 3, 4]).await;
            pipe.close();
            assert_eq!(pipe.write(&[5]).await, 0);
            assert!(!pipe.wait_free_after(pipe.position()).await);

            // buffered data is still delivered
            assert!(pipe.require().await);
            pipe.consume(4);
            assert!(!pipe.require().await);
        });
    }
}
