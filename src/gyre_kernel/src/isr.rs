//! Interrupt-service-routine bracket.
use core::marker::PhantomData;

use crate::{klock, sched, KernelTraits};

/// RAII bracket for interrupt handlers that may touch kernel state.
///
/// Construction bumps the kernel's ISR nesting counter; destruction drops it
/// and, on the outermost exit, lets the ISR-side scheduler run. Every ISR
/// that calls a kernel API (directly or through a primitive's `*_isr`
/// method) must hold one of these for its whole duration.
pub struct IsrScope<Traits: KernelTraits> {
    // Neither `Send` nor meaningful to move across handlers.
    _no_send: PhantomData<*mut ()>,
    _traits: PhantomData<Traits>,
}

impl<Traits: KernelTraits> IsrScope<Traits> {
    pub fn new() -> Self {
        let mut lock = klock::lock_cpu::<Traits>();
        Traits::state()
            .isr_nest_count
            .replace_with(&mut *lock, |n| *n + 1);
        Self {
            _no_send: PhantomData,
            _traits: PhantomData,
        }
    }
}

impl<Traits: KernelTraits> Default for IsrScope<Traits> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits> Drop for IsrScope<Traits> {
    fn drop(&mut self) {
        let mut lock = klock::lock_cpu::<Traits>();
        let nest = Traits::state().isr_nest_count.get(&*lock);
        debug_assert!(nest > 0, "ISR nesting counter underflow");
        let nest = nest.saturating_sub(1);
        Traits::state().isr_nest_count.replace(&mut *lock, nest);
        if nest == 0 {
            sched::sched_isr(lock.borrow_mut());
        }
    }
}
