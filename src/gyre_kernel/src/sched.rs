//! The scheduler: elects the highest-ready priority slot and performs (or
//! defers) the context switch.
use crate::{klock, utils::highest_priority, KernelTraits, UNINIT_PRIORITY};

#[cfg(feature = "deferred_switch")]
use crate::ActivityCb;

/// Thread-context scheduler entry. Returns immediately inside an interrupt
/// handler; the decision is then made by the outermost ISR exit.
pub(crate) fn reschedule<Traits: KernelTraits>(lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    if Traits::state().isr_nest_count.get(&*lock) != 0 {
        return;
    }
    sched::<Traits>(lock)
}

/// Elect the highest-ready priority and switch to it.
fn sched<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let state = Traits::state();
    let cur = state.current_priority.get(&*lock);
    if cur == UNINIT_PRIORITY {
        return;
    }

    let next = highest_priority(state.ready_map.get(&*lock), Traits::PRIORITY_ORDER);
    if next == cur {
        return;
    }

    #[cfg(not(feature = "deferred_switch"))]
    {
        Traits::context_switch_hook();
        let prev_cb = Traits::activity_table()[cur as usize];
        let next_cb = Traits::activity_table()[next as usize];
        state.current_priority.replace(&mut *lock, next);
        // Safety: critical section active. Control returns here when this
        // activity is elected again.
        unsafe { Traits::context_switch(prev_cb, next_cb) };
    }

    #[cfg(feature = "deferred_switch")]
    {
        state.sched_priority.replace(&mut *lock, next);
        // Safety: critical section active
        unsafe { Traits::raise_deferred_switch() };

        // Poll across the trap boundary: reopen the interrupt window one
        // barrier at a time until the trap handler has installed the
        // elected priority. The trap outranks nothing, so it fires as soon
        // as the window opens.
        loop {
            // Safety: we re-enter the critical section right below and the
            // polled cells are only read after that
            unsafe { Traits::leave_cpu_lock() };
            core::hint::spin_loop();
            unsafe { Traits::enter_cpu_lock() };

            if state.current_priority.get(&*lock) == state.sched_priority.get(&*lock) {
                break;
            }
        }
    }
}

/// ISR-side scheduler, invoked on the outermost interrupt exit.
pub(crate) fn sched_isr<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let state = Traits::state();
    let cur = state.current_priority.get(&*lock);
    if cur == UNINIT_PRIORITY {
        return;
    }

    let next = highest_priority(state.ready_map.get(&*lock), Traits::PRIORITY_ORDER);
    if next == cur {
        return;
    }

    #[cfg(not(feature = "deferred_switch"))]
    {
        Traits::context_switch_hook();
        let prev_cb = Traits::activity_table()[cur as usize];
        let next_cb = Traits::activity_table()[next as usize];
        state.current_priority.replace(&mut *lock, next);
        // Safety: critical section active; the interrupted activity's
        // context is stored into `prev_cb` until it is elected again.
        unsafe { Traits::context_switch(prev_cb, next_cb) };
    }

    #[cfg(feature = "deferred_switch")]
    {
        state.sched_priority.replace(&mut *lock, next);
        // The trap fires once the interrupt unwinds; no polling here.
        // Safety: critical section active
        unsafe { Traits::raise_deferred_switch() };
    }
}

/// The deferred-switch trap body: install the elected priority and report
/// which activity contexts the port has to swap.
#[cfg(feature = "deferred_switch")]
pub(crate) fn deferred_switch_inner<Traits: KernelTraits>(
) -> Option<(&'static ActivityCb<Traits>, &'static ActivityCb<Traits>)> {
    let mut lock = klock::lock_cpu::<Traits>();
    let state = Traits::state();
    let cur = state.current_priority.get(&*lock);
    let next = state.sched_priority.get(&*lock);
    if cur == UNINIT_PRIORITY || next == UNINIT_PRIORITY || next == cur {
        return None;
    }

    Traits::context_switch_hook();
    state.current_priority.replace(&mut *lock, next);
    Some((
        Traits::activity_table()[cur as usize],
        Traits::activity_table()[next as usize],
    ))
}
