use core::cell::{RefCell, UnsafeCell};
use core::future::poll_fn;
use core::ptr::NonNull;
use core::task::Poll;

use bitmaps::Bitmap;
use critical_section::Mutex;
use embassy_sync::waitqueue::MultiWakerRegistration;

use super::Descriptor;

/// Number of descriptors in a pool.
pub const POOL_SIZE: usize = 16;

struct Slots {
    used: Bitmap<POOL_SIZE>,
    /// Bumped on every free.
    generation: u32,
    waiters: MultiWakerRegistration<4>,
}

/// Fixed set of descriptors shared by the streaming engines.
///
/// A descriptor must only be freed once the controller has moved past it.
pub struct DescriptorPool {
    descriptors: [UnsafeCell<Descriptor>; POOL_SIZE],
    slots: Mutex<RefCell<Slots>>,
}

// Slots are handed out exclusively through the bitmap.
unsafe impl Sync for DescriptorPool {}

impl DescriptorPool {
    pub fn new() -> Self {
        const EMPTY: UnsafeCell<Descriptor> = UnsafeCell::new(Descriptor::EMPTY);
        Self {
            descriptors: [EMPTY; POOL_SIZE],
            slots: Mutex::new(RefCell::new(Slots {
                used: Bitmap::new(),
                generation: 0,
                waiters: MultiWakerRegistration::new(),
            })),
        }
    }

    fn index_of(&self, desc: NonNull<Descriptor>) -> Option<usize> {
        let base = self.descriptors.as_ptr() as usize;
        let offset = (desc.as_ptr() as usize).wrapping_sub(base);
        let index = offset / core::mem::size_of::<Descriptor>();
        (offset % core::mem::size_of::<Descriptor>() == 0 && index < POOL_SIZE).then_some(index)
    }

    /// Take a cleared descriptor, `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<NonNull<Descriptor>> {
        let index = critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            let index = slots.used.first_false_index()?;
            slots.used.set(index, true);
            Some(index)
        })?;

        let desc = self.descriptors[index].get();
        unsafe { Descriptor::write(desc, Descriptor::EMPTY) };
        NonNull::new(desc)
    }

    /// Return a descriptor to the pool.
    pub fn free(&self, desc: NonNull<Descriptor>) {
        let Some(index) = self.index_of(desc) else {
            error!("freeing a descriptor not owned by the pool");
            return;
        };

        critical_section::with(|cs| {
            let mut slots = self.slots.borrow_ref_mut(cs);
            debug_assert!(slots.used.get(index));
            slots.used.set(index, false);
            slots.generation = slots.generation.wrapping_add(1);
            slots.waiters.wake();
        })
    }

    /// Whether `desc` points into this pool.
    pub fn owns(&self, desc: *const Descriptor) -> bool {
        NonNull::new(desc as *mut Descriptor).is_some_and(|d| self.index_of(d).is_some())
    }

    pub fn available(&self) -> usize {
        critical_section::with(|cs| POOL_SIZE - self.slots.borrow_ref(cs).used.len())
    }

    /// Counter that changes whenever a descriptor is freed.
    pub fn generation(&self) -> u32 {
        critical_section::with(|cs| self.slots.borrow_ref(cs).generation)
    }

    /// Wait until a descriptor was freed after [`generation`](Self::generation) returned `since`.
    pub async fn released(&self, since: u32) {
        poll_fn(|cx| {
            critical_section::with(|cs| {
                let mut slots = self.slots.borrow_ref_mut(cs);
                if slots.generation != since {
                    Poll::Ready(())
                } else {
                    slots.waiters.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DescriptorPool")
            .field("available", &self.available())
            .finish()
    }
}
