//! Event flags
use crate::{
    activity::current_activity, klock, utils::Init, wait::WaitSet, KernelTraits, Port, Timeout,
};

/// A single boolean signal with a set of waiters.
pub struct EventFlag<Traits: Port> {
    value: klock::CpuLockCell<Traits, bool>,
    waiters: WaitSet<Traits>,
}

impl<Traits: Port> EventFlag<Traits> {
    pub const fn new(initial: bool) -> Self {
        Self {
            value: klock::CpuLockCell::new(initial),
            waiters: WaitSet::new(),
        }
    }
}

impl<Traits: Port> Init for EventFlag<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new(false);
}

impl<Traits: KernelTraits> EventFlag<Traits> {
    /// Wait for the flag. If it is already signaled, consume it and return
    /// `true` immediately. Otherwise suspend for at most `timeout` ticks
    /// (`0` = no deadline); returns `false` when woken by the timeout or an
    /// external forced wake-up.
    pub fn wait(&'static self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu::<Traits>();

        if self.value.get(&*lock) {
            self.value.replace(&mut *lock, false);
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

    /// Signal the flag and wake every waiter.
    pub fn signal(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.value.replace(&mut *lock, true);
        self.waiters.resume_all(lock.borrow_mut());
    }

    /// [`Self::signal`] for interrupt handlers. The caller must hold an
    /// [`IsrScope`]; the context switch the wake-up may cause is deferred
    /// to the outermost interrupt exit.
    ///
    /// [`IsrScope`]: crate::IsrScope
    pub fn signal_isr(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        debug_assert!(
            Traits::state().isr_nest_count.get(&*lock) > 0,
            "`signal_isr` called outside an `IsrScope`"
        );
        self.value.replace(&mut *lock, true);
        self.waiters.resume_all(lock.borrow_mut());
    }

    /// Clear the flag.
    pub fn clear(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.value.replace(&mut *lock, false);
    }

    /// Whether the flag is currently signaled.
    pub fn is_signaled(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        self.value.get(&*lock)
    }
}
