//! Mutexes
//!
//! Ownership is recorded as the owner's priority *tag* (the single-bit value
//! `1 << p`), zero meaning unlocked. There is no priority inheritance:
//! priorities are unique by construction, and the next owner is simply the
//! most preferred waiter.
use num_traits::Zero;

use crate::{
    activity::current_activity,
    klock,
    utils::{prio_tag, Init},
    wait::WaitSet,
    KernelTraits, Port, Timeout,
};

/// A non-recursive ownership-tagged lock.
pub struct Mutex<Traits: Port> {
    /// The owner's priority tag, or zero when unlocked.
    value_tag: klock::CpuLockCell<Traits, Traits::Map>,
    waiters: WaitSet<Traits>,
}

impl<Traits: Port> Mutex<Traits> {
    pub const fn new() -> Self {
        Self {
            value_tag: klock::CpuLockCell::new(Init::INIT),
            waiters: WaitSet::new(),
        }
    }
}

impl<Traits: Port> Init for Mutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: Port> Default for Mutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Mutex<Traits> {
    /// Acquire the lock, suspending without a deadline while another
    /// activity owns it.
    pub fn lock(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>();

        while !self.value_tag.get(&*lock).is_zero() {
            self.waiters.suspend(lock.borrow_mut());
        }

        let tag = prio_tag(current_activity::<Traits>(&lock).priority());
        self.value_tag.replace(&mut *lock, tag);
    }

    /// Acquire the lock, giving up after `timeout` ticks. A zero timeout
    /// polls: it returns `false` immediately on contention. On failure the
    /// mutex is left untouched.
    pub fn try_lock(&'static self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu::<Traits>();

        if timeout == 0 {
            if !self.value_tag.get(&*lock).is_zero() {
                return false;
            }
        } else {
            while !self.value_tag.get(&*lock).is_zero() {
                let cb = current_activity::<Traits>(&lock);
                cb.timeout.replace(&mut *lock, timeout);
                self.waiters.suspend(lock.borrow_mut());
                if self.waiters.is_timeouted(lock.borrow_mut()) {
                    return false;
                }
                cb.timeout.replace(&mut *lock, 0);
            }
        }

        let tag = prio_tag(current_activity::<Traits>(&lock).priority());
        self.value_tag.replace(&mut *lock, tag);
        true
    }

    /// Release the lock and wake the most preferred waiter. Silently
    /// ignored unless the caller is the owner, which keeps unwinding paths
    /// robust.
    pub fn unlock(&self) {
        let mut lock = klock::lock_cpu::<Traits>();

        let mine = prio_tag(current_activity::<Traits>(&lock).priority());
        if self.value_tag.get(&*lock) != mine {
            return;
        }
        self.value_tag.replace(&mut *lock, Init::INIT);
        self.waiters.resume_next_ready(lock.borrow_mut());
    }

    /// Whether the mutex is currently owned.
    pub fn is_locked(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        !self.value_tag.get(&*lock).is_zero()
    }
}

/// A recursive ownership-tagged lock: the owner may re-acquire it, and it is
/// released when `unlock` has been called as many times as `lock`.
///
/// Invariant: `value_tag == 0 ⇔ nest_count == 0`.
pub struct RecursiveMutex<Traits: Port> {
    value_tag: klock::CpuLockCell<Traits, Traits::Map>,
    nest_count: klock::CpuLockCell<Traits, u16>,
    waiters: WaitSet<Traits>,
}

impl<Traits: Port> RecursiveMutex<Traits> {
    pub const fn new() -> Self {
        Self {
            value_tag: klock::CpuLockCell::new(Init::INIT),
            nest_count: klock::CpuLockCell::new(0),
            waiters: WaitSet::new(),
        }
    }
}

impl<Traits: Port> Init for RecursiveMutex<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: Port> Default for RecursiveMutex<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> RecursiveMutex<Traits> {
    /// Acquire the lock. Re-acquiring as the owner just deepens the
    /// nesting.
    pub fn lock(&'static self) {
        let mut lock = klock::lock_cpu::<Traits>();
        let mine = prio_tag::<Traits::Map>(current_activity::<Traits>(&lock).priority());

        let tag = self.value_tag.get(&*lock);
        if tag.is_zero() {
            self.value_tag.replace(&mut *lock, mine);
            self.nest_count.replace(&mut *lock, 1);
        } else if tag == mine {
            self.nest_count.replace_with(&mut *lock, |n| *n + 1);
        } else {
            while !self.value_tag.get(&*lock).is_zero() {
                self.waiters.suspend(lock.borrow_mut());
            }
            self.value_tag.replace(&mut *lock, mine);
            self.nest_count.replace(&mut *lock, 1);
        }
    }

    /// Acquire the lock, giving up after `timeout` ticks. A zero timeout
    /// polls. Re-acquiring as the owner always succeeds.
    pub fn try_lock(&'static self, timeout: Timeout) -> bool {
        let mut lock = klock::lock_cpu::<Traits>();
        let mine = prio_tag::<Traits::Map>(current_activity::<Traits>(&lock).priority());

        let tag = self.value_tag.get(&*lock);
        if tag.is_zero() {
            self.value_tag.replace(&mut *lock, mine);
            self.nest_count.replace(&mut *lock, 1);
            return true;
        }
        if tag == mine {
            self.nest_count.replace_with(&mut *lock, |n| *n + 1);
            return true;
        }
        if timeout == 0 {
            return false;
        }

        let cb = current_activity::<Traits>(&lock);
        while !self.value_tag.get(&*lock).is_zero() {
            cb.timeout.replace(&mut *lock, timeout);
            self.waiters.suspend(lock.borrow_mut());
            if self.waiters.is_timeouted(lock.borrow_mut()) {
                return false;
            }
            cb.timeout.replace(&mut *lock, 0);
        }
        self.value_tag.replace(&mut *lock, mine);
        self.nest_count.replace(&mut *lock, 1);
        true
    }

    /// Undo one `lock`. When the nesting reaches zero the mutex is released
    /// and the most preferred waiter woken. Silently ignored unless the
    /// caller is the owner.
    pub fn unlock(&self) {
        let mut lock = klock::lock_cpu::<Traits>();

        let mine = prio_tag::<Traits::Map>(current_activity::<Traits>(&lock).priority());
        if self.value_tag.get(&*lock) != mine || self.nest_count.get(&*lock) == 0 {
            return;
        }
        let nest = self.nest_count.get(&*lock) - 1;
        self.nest_count.replace(&mut *lock, nest);
        if nest == 0 {
            self.value_tag.replace(&mut *lock, Init::INIT);
            self.waiters.resume_next_ready(lock.borrow_mut());
        }
    }

    /// Unconditionally release the lock regardless of nesting depth or
    /// ownership, then wake the most preferred waiter. Intended for restart
    /// paths tearing down a crashed owner.
    #[cfg(feature = "restart")]
    pub fn force_unlock(&self) {
        let mut lock = klock::lock_cpu::<Traits>();

        if self.value_tag.get(&*lock).is_zero() {
            return;
        }
        self.nest_count.replace(&mut *lock, 0);
        self.value_tag.replace(&mut *lock, Init::INIT);
        self.waiters.resume_next_ready(lock.borrow_mut());
    }

    /// Whether the mutex is currently owned.
    pub fn is_locked(&self) -> bool {
        let lock = klock::lock_cpu::<Traits>();
        !self.value_tag.get(&*lock).is_zero()
    }

    /// The current nesting depth (zero when unlocked).
    pub fn nest_count(&self) -> u16 {
        let lock = klock::lock_cpu::<Traits>();
        self.nest_count.get(&*lock)
    }
}
