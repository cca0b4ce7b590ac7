//! Crate-private helpers shared by the peripheral drivers.

pub(crate) mod drop;

use core::cell::Cell;

use critical_section::Mutex;

/// Event counter that is safe to bump from interrupt context.
///
/// Cortex-M0+ parts lack atomic read-modify-write, so the increment runs in a critical section.
pub struct Counter(Mutex<Cell<u32>>);

impl Counter {
    pub const fn new() -> Self {
        Self(Mutex::new(Cell::new(0)))
    }

    pub fn increment(&self) {
        critical_section::with(|cs| {
            let c = self.0.borrow(cs);
            c.set(c.get().wrapping_add(1));
        })
    }

    pub fn get(&self) -> u32 {
        critical_section::with(|cs| self.0.borrow(cs).get())
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
