use core::mem;
use core::mem::MaybeUninit;

/// Runs a closure on drop, unless defused.
///
/// Used as a sentinel to put hardware back into a known state when a future is cancelled halfway.
#[must_use = "to delay the drop handler invokation to the end of the scope"]
pub struct OnDrop<F: FnOnce()> {
    f: MaybeUninit<F>,
}

impl<F: FnOnce()> OnDrop<F> {
    pub fn new(f: F) -> Self {
        Self { f: MaybeUninit::new(f) }
    }

    /// Forget the closure without running it.
    pub fn defuse(self) {
        mem::forget(self)
    }
}

impl<F: FnOnce()> Drop for OnDrop<F> {
    fn drop(&mut self) {
        unsafe { self.f.as_ptr().read()() }
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;

    #[test]
    fn runs_on_scope_exit() {
        let hit = Cell::new(false);
        {
            let _guard = OnDrop::new(|| hit.set(true));
        }
        assert!(hit.get());
    }

    #[test]
    fn defused_guard_does_nothing() {
        let hit = Cell::new(false);
        OnDrop::new(|| hit.set(true)).defuse();
        assert!(!hit.get());
    }
}
