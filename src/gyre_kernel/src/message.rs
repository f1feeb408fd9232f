//! Typed messages
//!
//! A zero-capacity signal paired with a typed payload slot: `send` stores
//! the payload and wakes every waiter, `wait` mirrors the event flag, and
//! the receiver reads the payload after a successful wait.
use crate::{
    activity::current_activity, klock, utils::Init, wait::WaitSet, KernelTraits, Port, Timeout,
};

/// A single-slot typed message with a set of waiters.
pub struct Message<Traits: Port, T: Send + 'static> {
    non_empty: klock::CpuLockCell<Traits, bool>,
    slot: klock::CpuLockCell<Traits, Option<T>>,
    waiters: WaitSet<Traits>,
}

impl<Traits: Port, T: Send + 'static> Message<Traits, T> {
    pub const fn new() -> Self {
        Self {
            non_empty: klock::CpuLockCell::new(false),
            slot: klock::CpuLockCell::new(None),
            waiters: WaitSet::new(),
        }
    }
}

impl<Traits: Port, T: Send + 'static> Init for Message<Traits, T> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: Port, T: Send + 'static> Default for Message<Traits, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits, T: Send + 'static> Message<Traits, T> {
    /// Wait for a message. Returns `true` once one has been sent; the
    /// caller then reads the payload with [`Self::read`] or [`Self::take`].
    /// Returns `false` when woken by the timeout (`0` = no deadline) or an
    /// external forced wake-up.
    pub fn wait(&'static self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu::<Traits>();

        if self.non_empty.get(&*lock) {
            self.non_empty.replace(&mut *lock, false);
            return true;
        }

        let cb = current_activity::<Traits>(&lock);
        cb.timeout.replace(&mut *lock, timeout);

        self.waiters.suspend(lock.borrow_mut());

        if self.waiters.is_timeouted(lock.borrow_mut()) {
            return false;
        }

        cb.timeout.replace(&mut *lock, 0);
        true
    }

    /// Store the payload, mark the message present, and wake every waiter.
    pub fn send(&self, value: T) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.slot.replace(&mut *lock, Some(value));
        self.non_empty.replace(&mut *lock, true);
        self.waiters.resume_all(lock.borrow_mut());
    }

    /// [`Self::send`] for interrupt handlers. The caller must hold an
    /// [`IsrScope`]; the context switch the wake-up may cause is deferred
    /// to the outermost interrupt exit.
    ///
    /// [`IsrScope`]: crate::IsrScope
    pub fn send_isr(&self, value: T) {
        let mut lock = klock::lock_cpu::<Traits>();
        debug_assert!(
            Traits::state().isr_nest_count.get(&*lock) > 0,
            "`send_isr` called outside an `IsrScope`"
        );
        self.slot.replace(&mut *lock, Some(value));
        self.non_empty.replace(&mut *lock, true);
        self.waiters.resume_all(lock.borrow_mut());
    }

    /// Clone the payload out of the slot, leaving it in place.
    pub fn read(&self) -> Option<T>
    where
        T: Clone,
    {
        let lock = klock::lock_cpu::<Traits>();
        self.slot.read(&*lock).clone()
    }

    /// Move the payload out of the slot.
    pub fn take(&self) -> Option<T> {
        let mut lock = klock::lock_cpu::<Traits>();
        self.slot.replace(&mut *lock, None)
    }

    /// Drop a pending message, if any.
    pub fn clear(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.non_empty.replace(&mut *lock, false);
        self.slot.replace(&mut *lock, None);
    }
}
