//! A compact priority-preemptive RTOS kernel for single-processor
//! microcontrollers, scheduled by a process bitmap.
//!
//! The kernel multiplexes up to 31 statically constructed *activities* (plus
//! a mandatory idle activity) over one processor. Each activity owns a
//! unique priority slot; a 8/16/32-bit *process bitmap* records which slots
//! are runnable, and electing the next activity is a single bit-scan. All
//! blocking primitives ([`EventFlag`], [`Mutex`], [`RecursiveMutex`],
//! [`Channel`], [`Message`]) are built on one shared wait-set protocol
//! ([`wait::WaitSet`]) and a per-activity 16-bit timeout aged by the system
//! tick.
//!
//! # Kernel trait types
//!
//! Like its stack layout, the kernel's compile-time plumbing is split across
//! a few traits implemented on a single user-defined *system type*:
//!
//!  - [`KernelCfg1`] and [`KernelCfg2`] are implemented by the
//!    [`static_kernel!`] macro and describe the static configuration (slot
//!    count, bitmap width, the activity table, the kernel state instance).
//!  - [`Port`] is implemented by a port crate (see `gyre_port_std` for the
//!    hosted simulator) and supplies the target interface: critical
//!    sections, context switching, and boot.
//!  - [`KernelHooks`] carries the optional user hooks and is implemented by
//!    the application, usually as an empty `impl`.
//!
//! [`EventFlag`]: crate::event::EventFlag
//! [`Mutex`]: crate::mutex::Mutex
//! [`RecursiveMutex`]: crate::mutex::RecursiveMutex
//! [`Channel`]: crate::channel::Channel
//! [`Message`]: crate::message::Message
#![cfg_attr(not(test), no_std)]

pub mod utils;
#[cfg(test)]
#[macro_use]
mod mock;

pub mod activity;
pub mod cfg;
pub mod channel;
pub mod event;
mod isr;
mod klock;
pub mod message;
pub mod mutex;
mod sched;
mod timer;
pub mod wait;

use core::marker::PhantomData;

pub use crate::{
    activity::{ActivityCb, ActivityRef, StackRegion},
    channel::Channel,
    event::EventFlag,
    isr::IsrScope,
    message::Message,
    mutex::{Mutex, RecursiveMutex},
    utils::{PriorityOrder, ProcMap},
};

use crate::utils::{highest_priority, idle_priority, prio_tag, set_tag, BinUInteger, Init};

/// A priority slot index. Doubles as the index into the activity table and
/// as the bit position in a process bitmap.
pub type Priority = u8;

/// Timeout counter, in system ticks. Zero means "no timeout": a sleeping
/// activity with a zero timeout is only resumed by an explicit wake-up.
pub type Timeout = u16;

/// Monotonic system tick counter. Wraps on overflow.
pub type TickCount = u32;

/// A machine word stored on an activity stack.
pub type StackItem = u32;

/// The hard ceiling on the number of priority slots (user activities plus
/// idle).
pub const MAX_PROCESS_COUNT: usize = 32;

/// Sentinel value of the current priority before [`PortToKernel::boot`]
/// completes.
pub const UNINIT_PRIORITY: Priority = MAX_PROCESS_COUNT as Priority;

/// Static configuration, part 1: the quantities everything else is
/// parameterized over. Implemented by [`static_kernel!`].
///
/// # Safety
///
/// The constants configure the layout of the kernel state; they are only
/// meant to be produced by [`static_kernel!`].
pub unsafe trait KernelCfg1: Sized + 'static {
    /// The number of user activities. `1..=31`.
    const PROCESS_COUNT: usize;

    /// The process-bitmap word. Must be wide enough for
    /// `PROCESS_COUNT + 1` bits.
    type Map: ProcMap;

    /// Whether the system-timer handler body runs with further interrupts
    /// admitted. When `false`, the user tick hook is called with the
    /// critical section already entered.
    const TICK_NESTS_INTERRUPTS: bool = false;
}

/// The target interface consumed by the kernel, implemented by a port on the
/// system type.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and implementing context switches
/// and the critical-section primitive the whole kernel relies on.
///
/// These methods are only meant to be called by the kernel.
pub unsafe trait Port: KernelCfg1 {
    /// Port-specific per-activity state, stored at the head of each
    /// [`ActivityCb`]. For a bare-metal port this is typically the saved
    /// stack pointer cell.
    type PortActivityState: Send + Sync + 'static;

    /// The initial value of [`ActivityCb::port_activity_state`].
    #[allow(clippy::declare_interior_mutable_const)] // it's intentional
    const PORT_ACTIVITY_STATE_INIT: Self::PortActivityState;

    /// Numeric direction of scheduling precedence in the process bitmap.
    const PRIORITY_ORDER: PriorityOrder;

    /// Fill value for stack-slack detection.
    const STACK_PATTERN: StackItem = 0xABBA_ABBA;

    /// Transfer control to the first activity, discarding the current (boot)
    /// context.
    ///
    /// Precondition: critical section active, boot phase.
    unsafe fn start_first_activity(activity: &'static ActivityCb<Self>) -> !;

    /// Scheme 0: store the calling context into `prev` and resume `next`.
    /// Returns when `prev` is elected again.
    ///
    /// Precondition: critical section active. A port that only supports the
    /// deferred-switch scheme can leave the default (panicking) body.
    unsafe fn context_switch(prev: &'static ActivityCb<Self>, next: &'static ActivityCb<Self>) {
        let _ = (prev, next);
        unimplemented!("this port does not implement the direct-switch scheme");
    }

    /// Scheme 1: pend the low-priority context-switch trap. The trap handler
    /// must call [`PortToKernel::deferred_switch`] and install the returned
    /// activity.
    ///
    /// A port that only supports the direct-switch scheme can leave the
    /// default (panicking) body.
    unsafe fn raise_deferred_switch() {
        unimplemented!("this port does not implement the deferred-switch scheme");
    }

    /// Prepare the activity for its first dispatch: synthesize the initial
    /// context so the next resume enters the activity's entry function, and
    /// fill the stack region with [`Self::STACK_PATTERN`] where supported.
    ///
    /// Precondition: critical section active; the activity is not running.
    unsafe fn initialize_activity(activity: &'static ActivityCb<Self>);

    /// Enter the critical section (disable kernel-managed interrupts).
    ///
    /// Precondition: critical section inactive.
    unsafe fn enter_cpu_lock();

    /// Leave the critical section previously entered by `enter_cpu_lock`.
    ///
    /// Precondition: critical section active.
    unsafe fn leave_cpu_lock();

    /// Return whether the critical section is active.
    fn is_cpu_lock_active() -> bool;

    /// Called by the idle activity on every iteration of its loop. A hosted
    /// port uses this to wait for virtual interrupts; a bare-metal port
    /// would execute a wait-for-interrupt instruction here.
    fn target_idle_hook() {}
}

/// Static configuration, part 2: access to the statically allocated kernel
/// objects. Implemented by [`static_kernel!`].
///
/// # Safety
///
/// Only meant to be implemented by [`static_kernel!`]; the kernel trusts the
/// table to be complete and priority-indexed.
pub unsafe trait KernelCfg2: Port {
    /// The kernel state singleton.
    fn state() -> &'static State<Self>;

    /// The activity table, indexed by priority slot. Contains
    /// `PROCESS_COUNT + 1` entries; the idle activity sits at
    /// [`idle_priority`]`(PRIORITY_ORDER, PROCESS_COUNT)`.
    ///
    /// [`idle_priority`]: crate::utils::idle_priority
    fn activity_table() -> &'static [&'static ActivityCb<Self>];

    /// The backing storage for all activity stacks. Carved into per-activity
    /// regions during boot.
    fn stack_pool() -> StackRegion;

    /// Look up the activity installed at `priority`.
    #[inline]
    fn activity_cb(priority: Priority) -> Option<&'static ActivityCb<Self>> {
        Self::activity_table().get(priority as usize).copied()
    }
}

/// User-supplied hooks. All of them default to doing nothing, which
/// compiles to nothing, so an application that doesn't care implements this
/// trait empty.
pub trait KernelHooks {
    /// Called on every system tick, from the timer ISR.
    fn systimer_hook() {}

    /// Called right before every context switch.
    fn context_switch_hook() {}

    /// Called by the idle activity on every iteration of its loop.
    fn idle_hook() {}
}

/// The combined trait bound for a fully configured system type.
pub trait KernelTraits: KernelCfg2 + KernelHooks {}

impl<T: KernelCfg2 + KernelHooks> KernelTraits for T {}

/// The kernel state singleton. One instance per system type, allocated by
/// [`static_kernel!`].
pub struct State<Traits: Port> {
    /// The ready bitmap: bit `p` is set iff the activity at slot `p` is
    /// runnable. The idle activity's bit is permanently set after boot.
    pub(crate) ready_map: klock::CpuLockCell<Traits, Traits::Map>,

    /// The priority slot of the executing activity. [`UNINIT_PRIORITY`]
    /// until [`PortToKernel::boot`] installs the first activity.
    pub(crate) current_priority: klock::CpuLockCell<Traits, Priority>,

    /// The priority elected by the scheduler but not yet installed; consumed
    /// by the deferred-switch trap.
    #[cfg(feature = "deferred_switch")]
    pub(crate) sched_priority: klock::CpuLockCell<Traits, Priority>,

    /// The number of in-progress interrupt handlers. Rescheduling is
    /// suppressed while nonzero.
    pub(crate) isr_nest_count: klock::CpuLockCell<Traits, u32>,

    #[cfg(all(feature = "system_ticks", not(feature = "system_ticks_atomic")))]
    pub(crate) tick_count: klock::CpuLockCell<Traits, TickCount>,

    #[cfg(all(feature = "system_ticks", feature = "system_ticks_atomic"))]
    pub(crate) tick_count: core::sync::atomic::AtomicU32,
}

impl<Traits: Port> Init for State<Traits> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        ready_map: Init::INIT,
        current_priority: klock::CpuLockCell::new(UNINIT_PRIORITY),
        #[cfg(feature = "deferred_switch")]
        sched_priority: klock::CpuLockCell::new(UNINIT_PRIORITY),
        isr_nest_count: Init::INIT,
        #[cfg(all(feature = "system_ticks", not(feature = "system_ticks_atomic")))]
        tick_count: Init::INIT,
        #[cfg(all(feature = "system_ticks", feature = "system_ticks_atomic"))]
        tick_count: core::sync::atomic::AtomicU32::new(0),
    };
}

impl<Traits: KernelTraits> State<Traits> {
    /// Set bit `priority` in the ready bitmap. Does not reschedule; callers
    /// do so deliberately.
    pub(crate) fn set_ready(&self, mut lock: klock::CpuLockTokenRefMut<'_, Traits>, pri: Priority) {
        self.ready_map
            .replace_with(&mut *lock, |m| set_tag(*m, prio_tag(pri)));
    }

    /// Clear bit `priority` in the ready bitmap. Does not reschedule.
    pub(crate) fn set_unready(
        &self,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
        pri: Priority,
    ) {
        self.ready_map
            .replace_with(&mut *lock, |m| utils::clear_tag(*m, prio_tag(pri)));
    }
}

/// Methods the port calls into the kernel with. Implemented automatically
/// for every system type.
pub trait PortToKernel: KernelTraits {
    /// Initialize the kernel and transfer control to the first activity.
    /// Never returns.
    ///
    /// # Safety
    ///
    /// Must be called exactly once, by the port, with the critical section
    /// active.
    unsafe fn boot() -> !;

    /// The system-timer interrupt body: wraps itself in an [`IsrScope`],
    /// runs the user tick hook, and ages the timeouts.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port's timer interrupt, with the
    /// critical section inactive.
    unsafe fn timer_tick();

    /// The deferred-switch trap body: installs the elected priority and
    /// reports which activity contexts to swap. Returns `None` when the
    /// election was already satisfied.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port's context-switch trap, with the
    /// critical section inactive.
    #[cfg(feature = "deferred_switch")]
    unsafe fn deferred_switch() -> Option<(&'static ActivityCb<Self>, &'static ActivityCb<Self>)>;
}

/// The non-diverging part of [`PortToKernel::boot`]: set up stacks, the
/// initial ready bitmap, and the initial current priority. Returns the
/// activity to dispatch first.
pub(crate) unsafe fn boot_prepare<Traits: KernelTraits>(
    mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
) -> &'static ActivityCb<Traits> {
    let state = Traits::state();
    let table = Traits::activity_table();
    debug_assert_eq!(state.current_priority.get(&*lock), UNINIT_PRIORITY);
    debug_assert_eq!(table.len(), Traits::PROCESS_COUNT + 1);

    // Carve the stack pool into per-activity regions, in table order.
    let pool = Traits::stack_pool();
    let mut offset = 0;
    for &cb in table {
        let words = cb.stack_words();
        assert!(offset + words <= pool.len(), "stack pool exhausted");
        // Safety: single-threaded boot phase; regions don't overlap
        unsafe { cb.assign_stack_region(pool.subregion(offset, words)) };
        offset += words;
    }
    debug_assert_eq!(offset, pool.len());

    for &cb in table {
        // Safety: critical section active; no activity is running yet
        unsafe { Traits::initialize_activity(cb) };
    }

    // Every activity that is not configured to start suspended becomes
    // runnable; the idle activity is always runnable.
    let mut map: Traits::Map = Init::INIT;
    for &cb in table {
        if !cb.starts_suspended() {
            map = set_tag(map, prio_tag(cb.priority()));
        }
    }
    debug_assert!(map.get_bit(idle_priority(Traits::PRIORITY_ORDER, Traits::PROCESS_COUNT) as u32));
    state.ready_map.replace(&mut *lock, map);

    let first = highest_priority(map, Traits::PRIORITY_ORDER);
    state.current_priority.replace(&mut *lock, first);

    table[first as usize]
}

impl<Traits: KernelTraits> PortToKernel for Traits {
    unsafe fn boot() -> ! {
        // Safety: the port entered the critical section for us
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        // Safety: boot phase
        let first = unsafe { boot_prepare::<Traits>(lock.borrow_mut()) };

        // The first activity inherits the critical section; the port leaves
        // it when it enters the activity's entry function.
        core::mem::forget(lock);

        // Safety: critical section active, boot phase
        unsafe { Traits::start_first_activity(first) }
    }

    unsafe fn timer_tick() {
        let _isr = IsrScope::<Traits>::new();

        if Traits::TICK_NESTS_INTERRUPTS {
            Traits::systimer_hook();
            let mut lock = klock::lock_cpu::<Traits>();
            timer::system_tick(lock.borrow_mut());
        } else {
            let mut lock = klock::lock_cpu::<Traits>();
            Traits::systimer_hook();
            timer::system_tick(lock.borrow_mut());
        }

        // `_isr` is dropped here; the outermost exit invokes the ISR-side
        // scheduler.
    }

    #[cfg(feature = "deferred_switch")]
    unsafe fn deferred_switch() -> Option<(&'static ActivityCb<Self>, &'static ActivityCb<Self>)> {
        sched::deferred_switch_inner::<Traits>()
    }
}

/// The facade through which applications talk to a configured kernel
/// instance.
pub struct System<Traits>(PhantomData<Traits>);

impl<Traits: KernelTraits> System<Traits> {
    /// Put the current activity to sleep for `timeout` ticks. A zero
    /// timeout sleeps forever: only [`ActivityRef::force_wake_up`] (or
    /// [`ActivityRef::wake_up`] while a timeout is still pending) resumes
    /// the activity.
    pub fn sleep(timeout: Timeout) {
        activity::sleep::<Traits>(timeout)
    }

    /// Whether [`PortToKernel::boot`] has installed the first activity.
    pub fn is_running() -> bool {
        let lock = klock::lock_cpu::<Traits>();
        Traits::state().current_priority.get(&*lock) != UNINIT_PRIORITY
    }

    /// The priority slot of the executing activity.
    pub fn current_priority() -> Priority {
        let lock = klock::lock_cpu::<Traits>();
        Traits::state().current_priority.get(&*lock)
    }

    /// Get a handle to the activity installed at `priority`.
    pub fn activity(priority: Priority) -> Option<ActivityRef<Traits>> {
        Traits::activity_cb(priority).map(ActivityRef::new)
    }

    /// The number of system ticks observed since boot. Wraps on overflow.
    #[cfg(all(feature = "system_ticks", not(feature = "system_ticks_atomic")))]
    pub fn tick_count() -> TickCount {
        let lock = klock::lock_cpu::<Traits>();
        Traits::state().tick_count.get(&*lock)
    }

    /// The number of system ticks observed since boot. Wraps on overflow.
    ///
    /// Read without entering a critical section.
    #[cfg(all(feature = "system_ticks", feature = "system_ticks_atomic"))]
    pub fn tick_count() -> TickCount {
        Traits::state()
            .tick_count
            .load(core::sync::atomic::Ordering::Relaxed)
    }
}
