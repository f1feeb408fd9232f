//! The system tick: ages timeouts and wakes expired sleepers.
use crate::{klock, utils::user_priority_range, KernelTraits};

/// One tick. Runs under the critical section, from the timer ISR (through
/// [`PortToKernel::timer_tick`]).
///
/// Rescheduling is *not* triggered here; it is handled by the outermost
/// ISR-exit path of [`IsrScope`].
///
/// [`PortToKernel::timer_tick`]: crate::PortToKernel::timer_tick
/// [`IsrScope`]: crate::IsrScope
pub(crate) fn system_tick<Traits: KernelTraits>(mut lock: klock::CpuLockTokenRefMut<'_, Traits>) {
    let state = Traits::state();

    #[cfg(all(feature = "system_ticks", not(feature = "system_ticks_atomic")))]
    state
        .tick_count
        .replace_with(&mut *lock, |t| t.wrapping_add(1));

    #[cfg(all(feature = "system_ticks", feature = "system_ticks_atomic"))]
    {
        // Interrupts are masked; a plain load/store pair would do, but the
        // atomic keeps the lock-free read path honest.
        let t = state.tick_count.load(core::sync::atomic::Ordering::Relaxed);
        state
            .tick_count
            .store(t.wrapping_add(1), core::sync::atomic::Ordering::Relaxed);
    }

    // Age every user activity with a pending timeout. The idle slot is the
    // one entry the range leaves out: idle is always ready and never waits.
    for pri in user_priority_range(Traits::PRIORITY_ORDER, Traits::PROCESS_COUNT) {
        let cb = Traits::activity_table()[pri];
        let t = cb.timeout.get(&*lock);
        if t > 0 {
            let t = t - 1;
            cb.timeout.replace(&mut *lock, t);
            if t == 0 {
                state.set_ready(lock.borrow_mut(), cb.priority());
            }
        }
    }
}
