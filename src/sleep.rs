//! Deep-sleep (EM2) arbitration.
//!
//! Drivers with bus activity in flight block deep sleep, because entering EM2 stops the high
//! frequency clocks feeding I2C, USART, LDMA and USB. The idle loop checks [`deep_sleep_allowed`]
//! before executing `WFI` with `SLEEPDEEP` set, and gives registered [`PreSleep`] hooks a chance
//! to do opportunistic work first.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use embassy_time::Duration;

static BLOCKERS: Mutex<Cell<u32>> = Mutex::new(Cell::new(0));

/// Block deep sleep until a matching [`deep_sleep_enable`].
pub fn deep_sleep_disable() {
    critical_section::with(|cs| {
        let n = BLOCKERS.borrow(cs);
        n.set(n.get() + 1);
    })
}

/// Drop one deep sleep block.
pub fn deep_sleep_enable() {
    critical_section::with(|cs| {
        let n = BLOCKERS.borrow(cs);
        debug_assert!(n.get() > 0);
        n.set(n.get().saturating_sub(1));
    })
}

/// Whether no driver currently blocks deep sleep.
pub fn deep_sleep_allowed() -> bool {
    critical_section::with(|cs| BLOCKERS.borrow(cs).get() == 0)
}

/// Number of outstanding deep sleep blocks.
pub fn deep_sleep_blockers() -> u32 {
    critical_section::with(|cs| BLOCKERS.borrow(cs).get())
}

/// Blocks deep sleep for as long as it lives.
#[must_use = "deep sleep is re-enabled as soon as the guard is dropped"]
pub struct DeepSleepGuard {
    _private: (),
}

impl DeepSleepGuard {
    pub fn new() -> Self {
        deep_sleep_disable();
        Self { _private: () }
    }
}

impl Default for DeepSleepGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeepSleepGuard {
    fn drop(&mut self) {
        deep_sleep_enable();
    }
}

/// Work to run right before the core goes to sleep.
pub trait PreSleep: Sync {
    /// `budget` is the time until the next scheduled wakeup.
    ///
    /// Returns `true` once the hook is done, which removes it from the registry.
    fn pre_sleep(&self, budget: Duration) -> bool;
}

const MAX_HOOKS: usize = 4;

static HOOKS: Mutex<RefCell<[Option<&'static dyn PreSleep>; MAX_HOOKS]>> = Mutex::new(RefCell::new([None; MAX_HOOKS]));

fn same_hook(a: &'static dyn PreSleep, b: &'static dyn PreSleep) -> bool {
    core::ptr::eq(a as *const dyn PreSleep as *const (), b as *const dyn PreSleep as *const ())
}

/// Register a hook. Returns `false` when all slots are taken.
pub fn add_pre_sleep(hook: &'static dyn PreSleep) -> bool {
    critical_section::with(|cs| {
        let mut hooks = HOOKS.borrow_ref_mut(cs);
        if hooks.iter().flatten().any(|h| same_hook(*h, hook)) {
            return true;
        }
        match hooks.iter_mut().find(|h| h.is_none()) {
            Some(slot) => {
                *slot = Some(hook);
                true
            }
            None => {
                warn!("no free pre-sleep slot");
                false
            }
        }
    })
}

/// Unregister a hook. Returns whether it was registered.
pub fn remove_pre_sleep(hook: &'static dyn PreSleep) -> bool {
    critical_section::with(|cs| {
        let mut hooks = HOOKS.borrow_ref_mut(cs);
        for slot in hooks.iter_mut() {
            if (*slot).is_some_and(|h| same_hook(h, hook)) {
                *slot = None;
                return true;
            }
        }
        false
    })
}

/// Run all registered hooks with the given sleep budget.
///
/// Hooks run outside the critical section. Returns `true` if any hook completed, in which case the
/// caller should re-evaluate its wakeup time before sleeping.
pub fn run_pre_sleep(budget: Duration) -> bool {
    let hooks = critical_section::with(|cs| *HOOKS.borrow_ref(cs));
    let mut worked = false;
    for hook in hooks.into_iter().flatten() {
        if hook.pre_sleep(budget) {
            remove_pre_sleep(hook);
            worked = true;
        }
    }
    worked
}
