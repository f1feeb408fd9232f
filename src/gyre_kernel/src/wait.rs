//! The wait-set protocol shared by every blocking primitive.
//!
//! A primitive owns one (or, for the channel, two) [`WaitSet`]s: a process
//! bitmap in which bit `p` says that the activity at slot `p` is suspended
//! on the primitive. Together with the per-activity timeout counter these
//! four operations are the only mechanism by which activities block and
//! wake:
//!
//!  - [`WaitSet::suspend`] enrolls the caller and gives up the processor;
//!  - [`WaitSet::is_timeouted`] classifies a wake-up (tick / forced vs.
//!    granted by the primitive) after `suspend` returns;
//!  - [`WaitSet::resume_all`] wakes every enrolled activity (broadcast
//!    primitives: event flag, channel, message);
//!  - [`WaitSet::resume_next_ready`] wakes the most preferred enrolled
//!    activity (ownership primitives: mutexes).
use num_traits::Zero;

use crate::{
    activity::current_activity,
    klock, sched,
    utils::{clear_tag, highest_prio_tag, prio_tag, set_tag, BinUInteger, Init},
    KernelTraits, Port,
};

/// The set of activities suspended on one blocking primitive.
pub struct WaitSet<Traits: Port> {
    pub(crate) waiters: klock::CpuLockCell<Traits, Traits::Map>,
}

impl<Traits: Port> WaitSet<Traits> {
    pub(crate) const fn new() -> Self {
        Self {
            waiters: klock::CpuLockCell::new(Init::INIT),
        }
    }
}

impl<Traits: Port> Init for WaitSet<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: KernelTraits> WaitSet<Traits> {
    /// Enroll the current activity, clear its ready bit, and call the
    /// scheduler. Returns when the activity is resumed, either by one of
    /// the `resume_*` operations, by its timeout expiring, or by a forced
    /// wake-up. The caller distinguishes these with [`Self::is_timeouted`].
    ///
    /// The caller stores the desired timeout into the current activity's
    /// control block *before* calling this.
    pub(crate) fn suspend(&'static self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
        let state = Traits::state();
        debug_assert_eq!(
            state.isr_nest_count.get(&*lock),
            0,
            "blocking primitive invoked from an interrupt handler"
        );

        let cb = current_activity::<Traits>(&lock);
        let pri = cb.priority();

        self.waiters
            .replace_with(&mut *lock, |w| set_tag(*w, prio_tag(pri)));
        state.set_unready(lock.borrow_mut(), pri);
        #[cfg(any(feature = "restart", feature = "introspect"))]
        cb.waiting.replace(&mut *lock, Some(self));

        sched::reschedule(lock.borrow_mut());

        // Resumed. The enrollment back-pointer is only meaningful while the
        // activity is actually off the processor.
        #[cfg(any(feature = "restart", feature = "introspect"))]
        cb.waiting.replace(&mut *lock, None);
    }

    /// After [`Self::suspend`] returns: report whether the activity was
    /// woken by the tick (or an external forced wake-up) rather than by the
    /// primitive. That is the case iff its ready bit is set while it is
    /// *still* enrolled here; the enrollment is then removed.
    pub(crate) fn is_timeouted(&self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) -> bool {
        let cb = current_activity::<Traits>(&lock);
        let pri = cb.priority();

        let ready = Traits::state().ready_map.get(&*lock);
        let waiters = self.waiters.get(&*lock);
        if ready.get_bit(pri as u32) && waiters.get_bit(pri as u32) {
            self.waiters
                .replace_with(&mut *lock, |w| clear_tag(*w, prio_tag(pri)));
            true
        } else {
            false
        }
    }

    /// Wake every enrolled activity that is not already scheduled by an
    /// expired timeout. Activities whose ready bit is already set stay
    /// enrolled so that their own [`Self::is_timeouted`] check still sees
    /// the timeout outcome. Returns whether anything was woken (and the
    /// scheduler ran).
    pub(crate) fn resume_all(&self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) -> bool {
        let state = Traits::state();
        // An activity has its tag set in the ready map here iff its timeout
        // expired or it was woken by force.
        let timeouted = state.ready_map.get(&*lock);
        let cached = self.waiters.get(&*lock);

        if !(cached & !timeouted).is_zero() {
            state.ready_map.replace_with(&mut *lock, |m| *m | cached);
            self.waiters.replace(&mut *lock, cached & timeouted);
            sched::reschedule(lock.borrow_mut());
            true
        } else {
            false
        }
    }

    /// Wake the most preferred enrolled activity that is not already
    /// scheduled by an expired timeout. Returns whether one was woken.
    pub(crate) fn resume_next_ready(&self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>) -> bool {
        let state = Traits::state();
        let timeouted = state.ready_map.get(&*lock);
        let ready = self.waiters.get(&*lock) & !timeouted;

        if ready.is_zero() {
            return false;
        }

        let tag = highest_prio_tag(ready, Traits::PRIORITY_ORDER);
        state.ready_map.replace_with(&mut *lock, |m| set_tag(*m, tag));
        self.waiters
            .replace_with(&mut *lock, |w| clear_tag(*w, tag));
        sched::reschedule(lock.borrow_mut());
        true
    }
}

#[cfg(test)]
mod tests {
    mod ascending {
        use crate::{klock, wait::WaitSet, KernelCfg2, PriorityOrder};

        mock_kernel!(struct Sys, order: PriorityOrder::Ascending);
        crate::static_kernel! {
            impl Kernel for Sys {
                process_count: 3,
                map: u8,
                idle_stack_words: 16,
                activities: [
                    { priority: 0, entry: crate::mock::never, stack_words: 16 },
                    { priority: 1, entry: crate::mock::never, stack_words: 16 },
                    { priority: 2, entry: crate::mock::never, stack_words: 16 },
                ],
            }
        }

        static WS: WaitSet<Sys> = WaitSet::new();

        #[test]
        fn suspend_resume_and_timeout_classification() {
            let mut lock = klock::lock_cpu::<Sys>();
            unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            let state = Sys::state();

            // Slots 0..=2 are the user activities, slot 3 is idle; slot 0 is
            // running.
            assert_eq!(state.ready_map.get(&*lock), 0b1111);
            assert_eq!(state.current_priority.get(&*lock), 0);

            // The running activity suspends: it leaves the ready map, joins
            // the wait set, and the next-preferred slot takes over.
            WS.suspend(lock.borrow_mut());
            assert_eq!(WS.waiters.get(&*lock), 0b0001);
            assert_eq!(state.ready_map.get(&*lock), 0b1110);
            assert_eq!(state.current_priority.get(&*lock), 1);
            assert_eq!(Sys::switch_log(), [(0, 1)]);

            // The primitive grants the wait: the activity is the only (and
            // thus most preferred) waiter, so it returns to the ready map,
            // leaves the wait set, and preempts.
            assert!(WS.resume_next_ready(lock.borrow_mut()));
            assert_eq!(WS.waiters.get(&*lock), 0);
            assert_eq!(state.ready_map.get(&*lock), 0b1111);
            assert_eq!(state.current_priority.get(&*lock), 0);

            // Woken by the primitive, not by the tick.
            assert!(!WS.is_timeouted(lock.borrow_mut()));

            // Nothing left to wake.
            assert!(!WS.resume_next_ready(lock.borrow_mut()));
            assert!(!WS.resume_all(lock.borrow_mut()));
        }
    }

    mod timeouted_wake {
        use crate::{klock, wait::WaitSet, KernelCfg2, PriorityOrder};

        mock_kernel!(struct Sys, order: PriorityOrder::Ascending);
        crate::static_kernel! {
            impl Kernel for Sys {
                process_count: 2,
                map: u8,
                idle_stack_words: 16,
                activities: [
                    { priority: 0, entry: crate::mock::never, stack_words: 16 },
                    { priority: 1, entry: crate::mock::never, stack_words: 16 },
                ],
            }
        }

        static WS: WaitSet<Sys> = WaitSet::new();

        #[test]
        fn tick_wake_is_reported_and_unenrolls() {
            let mut lock = klock::lock_cpu::<Sys>();
            unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            let state = Sys::state();

            WS.suspend(lock.borrow_mut());
            assert_eq!(state.current_priority.get(&*lock), 1);

            // A tick expires the wait: the activity reappears in the ready
            // map while still enrolled in the wait set.
            state.set_ready(lock.borrow_mut(), 0);
            state.current_priority.replace(&mut *lock, 0);

            assert!(WS.is_timeouted(lock.borrow_mut()));
            assert_eq!(WS.waiters.get(&*lock), 0);

            // The classification is one-shot.
            assert!(!WS.is_timeouted(lock.borrow_mut()));
        }
    }

    mod broadcast {
        use crate::{klock, wait::WaitSet, KernelCfg2, PriorityOrder};

        mock_kernel!(struct Sys, order: PriorityOrder::Descending);
        crate::static_kernel! {
            impl Kernel for Sys {
                process_count: 3,
                map: u8,
                idle_stack_words: 16,
                activities: [
                    { priority: 0, entry: crate::mock::never, stack_words: 16 },
                    { priority: 1, entry: crate::mock::never, stack_words: 16 },
                    { priority: 2, entry: crate::mock::never, stack_words: 16 },
                ],
            }
        }

        static WS: WaitSet<Sys> = WaitSet::new();

        #[test]
        fn resume_all_keeps_timeouted_waiters_enrolled() {
            let mut lock = klock::lock_cpu::<Sys>();
            unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            let state = Sys::state();

            // Descending order: idle is slot 0, labels 0..=2 sit at slots
            // 3..=1. Fake two waiters: slot 1 genuinely suspended, slot 2
            // already woken by an expired timeout (ready and enrolled).
            WS.waiters.replace(&mut *lock, 0b0110);
            state.set_unready(lock.borrow_mut(), 1);
            assert_eq!(state.ready_map.get(&*lock), 0b1101);

            assert!(WS.resume_all(lock.borrow_mut()));

            // Slot 1 was woken and unenrolled; slot 2 stays enrolled so its
            // own `is_timeouted` check still sees the timeout outcome.
            assert_eq!(state.ready_map.get(&*lock), 0b1111);
            assert_eq!(WS.waiters.get(&*lock), 0b0100);

            // With every waiter already ready, a broadcast is a no-op.
            assert!(!WS.resume_all(lock.borrow_mut()));
            assert_eq!(WS.waiters.get(&*lock), 0b0100);
        }
    }

    mod preferred_waiter {
        use crate::{klock, wait::WaitSet, KernelCfg2, PriorityOrder};

        mock_kernel!(struct Sys, order: PriorityOrder::Ascending);
        crate::static_kernel! {
            impl Kernel for Sys {
                process_count: 3,
                map: u8,
                idle_stack_words: 16,
                activities: [
                    { priority: 0, entry: crate::mock::never, stack_words: 16 },
                    { priority: 1, entry: crate::mock::never, stack_words: 16 },
                    { priority: 2, entry: crate::mock::never, stack_words: 16 },
                ],
            }
        }

        static WS: WaitSet<Sys> = WaitSet::new();

        #[test]
        fn resume_next_ready_picks_the_most_preferred() {
            let mut lock = klock::lock_cpu::<Sys>();
            unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            let state = Sys::state();

            // Slots 1 and 2 are suspended on the set; slot 0 keeps running.
            WS.waiters.replace(&mut *lock, 0b0110);
            state.set_unready(lock.borrow_mut(), 1);
            state.set_unready(lock.borrow_mut(), 2);

            assert!(WS.resume_next_ready(lock.borrow_mut()));
            // Ascending order: the lower slot is the more preferred waiter.
            assert_eq!(WS.waiters.get(&*lock), 0b0100);
            assert!(state.ready_map.get(&*lock) & 0b0010 != 0);

            assert!(WS.resume_next_ready(lock.borrow_mut()));
            assert_eq!(WS.waiters.get(&*lock), 0);

            assert!(!WS.resume_next_ready(lock.borrow_mut()));
        }
    }
}
