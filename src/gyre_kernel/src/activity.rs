//! Activities
//!
//! An *activity* is a schedulable unit with its own stack and a unique
//! priority slot. Control blocks are statically allocated by
//! [`static_kernel!`] and registered in the priority-indexed activity table;
//! activities never terminate.
//!
//! [`static_kernel!`]: crate::static_kernel
use crate::{
    klock, sched, utils::RawCell, KernelTraits, Port, Priority, StackItem, Timeout,
    UNINIT_PRIORITY,
};

#[cfg(any(feature = "restart", feature = "introspect"))]
use crate::wait::WaitSet;

/// A contiguous range of stack words handed to an activity.
///
/// Regions are carved out of the configuration's single stack pool during
/// boot, so a freshly constructed control block holds an empty one.
#[derive(Clone, Copy, Debug)]
pub struct StackRegion {
    ptr: *mut StackItem,
    len: usize,
}

// Safety: a `StackRegion` is only dereferenced by the port (while the owning
// activity is not executing) and by the slack scanner, which tolerates
// concurrent mutation.
unsafe impl Send for StackRegion {}
unsafe impl Sync for StackRegion {}

impl StackRegion {
    /// Construct a region from raw parts. `len` is in words.
    pub const fn new(ptr: *mut StackItem, len: usize) -> Self {
        Self { ptr, len }
    }

    pub const fn empty() -> Self {
        Self {
            ptr: core::ptr::null_mut(),
            len: 0,
        }
    }

    /// The bottom of the region (the end away from the initial stack
    /// pointer on a descending-stack target).
    pub fn as_mut_ptr(&self) -> *mut StackItem {
        self.ptr
    }

    /// Length in words.
    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn subregion(&self, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= self.len);
        // Safety: stays within the same allocation
        Self {
            ptr: unsafe { self.ptr.add(offset) },
            len,
        }
    }

    /// Fill the whole region with `pattern`.
    ///
    /// # Safety
    ///
    /// The owning activity must not be executing.
    pub unsafe fn fill(&self, pattern: StackItem) {
        for i in 0..self.len {
            // Safety: in bounds; exclusive access per the contract above
            unsafe { self.ptr.add(i).write_volatile(pattern) };
        }
    }

    /// Count the leading words still equal to `pattern`.
    ///
    /// # Safety
    ///
    /// The region must have been filled with `pattern` beforehand. The scan
    /// may race with the owning activity's execution; the result is a lower
    /// bound snapshot.
    pub unsafe fn slack(&self, pattern: StackItem) -> usize {
        let mut n = 0;
        while n < self.len {
            // Safety: in bounds
            if unsafe { self.ptr.add(n).read_volatile() } != pattern {
                break;
            }
            n += 1;
        }
        n
    }
}

/// *Activity control block* - the state data of one activity.
#[repr(C)]
pub struct ActivityCb<Traits: Port> {
    /// Port-specific state. This is guaranteed to be placed at the
    /// beginning of the struct so that assembler code can refer to it
    /// easily.
    pub port_activity_state: Traits::PortActivityState,

    /// The priority slot. Immutable after construction.
    priority: Priority,

    /// The entry function. Activities never return from it.
    entry: fn() -> !,

    /// Requested stack size, in words.
    stack_words: usize,

    /// The stack region, assigned once during boot.
    stack: RawCell<StackRegion>,

    /// Remaining timeout, in ticks. Zero means no timeout is pending; a
    /// nonzero value is decremented by every tick, and the activity is made
    /// ready when it reaches zero.
    pub(crate) timeout: klock::CpuLockCell<Traits, Timeout>,

    /// The wait set this activity is currently enrolled in, if any.
    #[cfg(any(feature = "restart", feature = "introspect"))]
    pub(crate) waiting: klock::CpuLockCell<Traits, Option<&'static WaitSet<Traits>>>,

    #[cfg(feature = "introspect")]
    name: &'static str,

    #[cfg(feature = "suspended_start")]
    start_suspended: bool,
}

impl<Traits: Port> ActivityCb<Traits> {
    /// Construct a control block. Only meant to be called by
    /// [`static_kernel!`].
    ///
    /// [`static_kernel!`]: crate::static_kernel
    #[doc(hidden)]
    #[allow(unused_variables)]
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new(
        priority: Priority,
        entry: fn() -> !,
        stack_words: usize,
        name: &'static str,
        start_suspended: bool,
    ) -> Self {
        Self {
            port_activity_state: Traits::PORT_ACTIVITY_STATE_INIT,
            priority,
            entry,
            stack_words,
            stack: RawCell::new(StackRegion::empty()),
            timeout: klock::CpuLockCell::new(0),
            #[cfg(any(feature = "restart", feature = "introspect"))]
            waiting: klock::CpuLockCell::new(None),
            #[cfg(feature = "introspect")]
            name,
            #[cfg(feature = "suspended_start")]
            start_suspended,
        }
    }

    /// The priority slot this activity occupies.
    pub const fn priority(&self) -> Priority {
        self.priority
    }

    /// The entry function.
    pub fn entry_point(&self) -> fn() -> ! {
        self.entry
    }

    /// Requested stack size, in words.
    pub const fn stack_words(&self) -> usize {
        self.stack_words
    }

    /// The stack region assigned at boot. Empty before boot.
    pub fn stack_region(&self) -> StackRegion {
        // Safety: written once during single-threaded boot, read-only after
        unsafe { *self.stack.get() }
    }

    /// Install the stack region. Only called during boot.
    pub(crate) unsafe fn assign_stack_region(&self, region: StackRegion) {
        // Safety: single-threaded boot phase; see `stack_region`
        unsafe { *self.stack.get() = region };
    }

    pub(crate) fn starts_suspended(&self) -> bool {
        #[cfg(feature = "suspended_start")]
        {
            self.start_suspended
        }
        #[cfg(not(feature = "suspended_start"))]
        {
            false
        }
    }

    /// The symbolic name given at construction.
    #[cfg(feature = "introspect")]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Get the control block of the executing activity.
pub(crate) fn current_activity<Traits: KernelTraits>(
    lock: &klock::CpuLockToken<Traits>,
) -> &'static ActivityCb<Traits> {
    let pri = Traits::state().current_priority.get(lock);
    debug_assert_ne!(pri, UNINIT_PRIORITY);
    Traits::activity_table()[pri as usize]
}

/// Implements [`System::sleep`](crate::System::sleep).
pub(crate) fn sleep<Traits: KernelTraits>(timeout: Timeout) {
    let mut lock = klock::lock_cpu::<Traits>();
    let state = Traits::state();
    debug_assert_eq!(
        state.isr_nest_count.get(&*lock),
        0,
        "`sleep` called from an interrupt handler"
    );

    let cb = current_activity::<Traits>(&lock);
    cb.timeout.replace(&mut *lock, timeout);
    state.set_unready(lock.borrow_mut(), cb.priority());
    sched::reschedule(lock.borrow_mut());
}

/// The idle activity's body: the lowest-precedence loop that runs whenever
/// nothing else is ready.
#[doc(hidden)]
pub fn idle_entry<Traits: KernelTraits>() -> ! {
    loop {
        Traits::idle_hook();
        Traits::target_idle_hook();
    }
}

/// A handle to a statically registered activity.
pub struct ActivityRef<Traits: Port> {
    cb: &'static ActivityCb<Traits>,
}

impl<Traits: Port> Clone for ActivityRef<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<Traits: Port> Copy for ActivityRef<Traits> {}

impl<Traits: KernelTraits> ActivityRef<Traits> {
    pub(crate) fn new(cb: &'static ActivityCb<Traits>) -> Self {
        Self { cb }
    }

    pub fn priority(&self) -> Priority {
        self.cb.priority()
    }

    /// Wake the activity only if it is sleeping with a timeout pending.
    pub fn wake_up(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        if self.cb.timeout.get(&*lock) != 0 {
            self.cb.timeout.replace(&mut *lock, 0);
            Traits::state().set_ready(lock.borrow_mut(), self.cb.priority());
            sched::reschedule(lock.borrow_mut());
        }
    }

    /// Unconditionally move the activity into the ready bitmap. A primitive
    /// the activity is blocked on observes this as a timeout-like exit.
    pub fn force_wake_up(&self) {
        let mut lock = klock::lock_cpu::<Traits>();
        self.cb.timeout.replace(&mut *lock, 0);
        Traits::state().set_ready(lock.borrow_mut(), self.cb.priority());
        sched::reschedule(lock.borrow_mut());
    }

    /// Detach the activity from every scheduling control: clear its ready
    /// bit, leave the wait set it is enrolled in (if any), and cancel its
    /// timeout. The first half of a restart.
    #[cfg(feature = "restart")]
    pub fn reset_controls(&self) {
        use crate::utils::{clear_tag, prio_tag};

        let mut lock = klock::lock_cpu::<Traits>();
        let pri = self.cb.priority();
        Traits::state().set_unready(lock.borrow_mut(), pri);
        if let Some(wait_set) = self.cb.waiting.replace(&mut *lock, None) {
            wait_set
                .waiters
                .replace_with(&mut *lock, |w| clear_tag(*w, prio_tag(pri)));
        }
        self.cb.timeout.replace(&mut *lock, 0);
    }

    /// Restart the activity: reset its controls, re-synthesize its initial
    /// context, and make it runnable again at its entry function.
    ///
    /// # Safety
    ///
    /// Everything on the activity's old stack is abandoned; the caller must
    /// ensure no live references point into it.
    #[cfg(feature = "restart")]
    pub unsafe fn restart(&self) {
        self.reset_controls();
        let mut lock = klock::lock_cpu::<Traits>();
        // Safety: the activity is not runnable after `reset_controls`
        unsafe { Traits::initialize_activity(self.cb) };
        Traits::state().set_ready(lock.borrow_mut(), self.cb.priority());
        sched::reschedule(lock.borrow_mut());
    }

    /// The name given at construction.
    #[cfg(feature = "introspect")]
    pub fn name(&self) -> &'static str {
        self.cb.name()
    }

    /// Stack size in words.
    #[cfg(feature = "introspect")]
    pub fn stack_size(&self) -> usize {
        self.cb.stack_region().len()
    }

    /// The number of leading stack words still holding the fill pattern: a
    /// snapshot lower bound of how much stack was never touched.
    #[cfg(feature = "introspect")]
    pub fn stack_slack(&self) -> usize {
        // Safety: the region was pattern-filled by `initialize_activity`;
        // the scan tolerates concurrent execution of the activity
        unsafe { self.cb.stack_region().slack(Traits::STACK_PATTERN) }
    }

    /// The wait set the activity is currently suspended on, if any.
    #[cfg(feature = "introspect")]
    pub fn waiting_for(&self) -> Option<&'static WaitSet<Traits>> {
        let lock = klock::lock_cpu::<Traits>();
        self.cb.waiting.get(&*lock)
    }
}

#[cfg(test)]
mod tests {
    mod wake_semantics {
        use crate::{klock, KernelCfg2, PriorityOrder, System};

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

        #[test]
        fn wake_up_requires_a_pending_timeout() {
            {
                let mut lock = klock::lock_cpu::<Sys>();
                unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            }
            let state = Sys::state();
            let sleeper = System::<Sys>::activity(1).unwrap();

            // Slot 1 sleeps with a deadline.
            {
                let mut lock = klock::lock_cpu::<Sys>();
                Sys::activity_table()[1].timeout.replace(&mut *lock, 5);
                state.set_unready(lock.borrow_mut(), 1);
            }

            sleeper.wake_up();
            {
                let lock = klock::lock_cpu::<Sys>();
                assert_eq!(Sys::activity_table()[1].timeout.get(&*lock), 0);
                assert!(state.ready_map.get(&*lock) & 0b10 != 0);
            }

            // Slot 1 sleeps forever (zero timeout): `wake_up` must not act,
            // `force_wake_up` must.
            {
                let mut lock = klock::lock_cpu::<Sys>();
                state.set_unready(lock.borrow_mut(), 1);
            }
            sleeper.wake_up();
            {
                let lock = klock::lock_cpu::<Sys>();
                assert!(state.ready_map.get(&*lock) & 0b10 == 0);
            }
            sleeper.force_wake_up();
            {
                let lock = klock::lock_cpu::<Sys>();
                assert!(state.ready_map.get(&*lock) & 0b10 != 0);
            }
        }
    }

    mod sleep_suspends {
        use crate::{klock, KernelCfg2, PriorityOrder, System};

        mock_kernel!(struct Sys, order: PriorityOrder::Ascending);
        crate::static_kernel! {
            impl Kernel for Sys {
                process_count: 1,
                map: u8,
                idle_stack_words: 16,
                activities: [
                    { priority: 0, entry: crate::mock::never, stack_words: 16 },
                ],
            }
        }

        #[test]
        fn sleep_parks_the_caller_until_the_deadline() {
            {
                let mut lock = klock::lock_cpu::<Sys>();
                unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            }
            let state = Sys::state();

            System::<Sys>::sleep(3);

            let lock = klock::lock_cpu::<Sys>();
            // The caller left the ready map with its deadline armed; idle
            // (slot 1) took over.
            assert_eq!(Sys::activity_table()[0].timeout.get(&*lock), 3);
            assert_eq!(state.ready_map.get(&*lock), 0b10);
            assert_eq!(state.current_priority.get(&*lock), 1);
            assert_eq!(Sys::switch_log(), [(0, 1)]);
        }
    }

    #[cfg(feature = "restart")]
    mod reset {
        use crate::{klock, wait::WaitSet, KernelCfg2, PriorityOrder, System};

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
        fn reset_controls_detaches_the_activity_from_everything() {
            {
                let mut lock = klock::lock_cpu::<Sys>();
                unsafe { crate::boot_prepare::<Sys>(lock.borrow_mut()) };
            }
            let state = Sys::state();
            let victim = System::<Sys>::activity(1).unwrap();

            // Slot 1 is suspended on `WS` with a deadline armed.
            {
                let mut lock = klock::lock_cpu::<Sys>();
                let cb = Sys::activity_table()[1];
                WS.waiters.replace(&mut *lock, 0b10);
                cb.timeout.replace(&mut *lock, 9);
                cb.waiting.replace(&mut *lock, Some(&WS));
                state.set_unready(lock.borrow_mut(), 1);
            }

            victim.reset_controls();

            let lock = klock::lock_cpu::<Sys>();
            let cb = Sys::activity_table()[1];
            assert_eq!(WS.waiters.get(&*lock), 0);
            assert_eq!(cb.timeout.get(&*lock), 0);
            assert!(cb.waiting.get(&*lock).is_none());
            assert!(state.ready_map.get(&*lock) & 0b10 == 0);
        }
    }
}
