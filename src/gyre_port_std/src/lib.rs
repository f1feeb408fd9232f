//! Simulation environment for running the `gyre` kernel on a hosted target.
//!
//! The port emulates a uniprocessor with one OS thread per activity and a
//! single *run token*: a kernel-managed thread executes only while it holds
//! the token, and every context switch is a token handoff through a condition
//! variable. The CPU lock is a plain boolean because nothing ever races
//! it: exactly one kernel-managed thread is runnable at any instant.
//!
//! Interrupts are virtual. [`post_tick`] (callable from any external thread,
//! e.g. a `#[test]` body) pends a timer interrupt; pended interrupts are
//! *taken* on the running thread whenever the critical section is left, and
//! in the idle activity's loop, which blocks until an interrupt arrives
//! (the hosted analogue of "interrupts fire when the mask is lifted" and of a
//! wait-for-interrupt instruction, respectively.
//!
//! Limitations, shared with every simulated environment of this kind: an
//! activity that loops forever without entering the kernel never takes a
//! virtual interrupt, and restarting a live activity is not supported.
#![deny(unsafe_op_in_unsafe_fn)]
use gyre_kernel::{ActivityCb, KernelTraits, Port, PortToKernel};
use spin::Mutex as SpinMutex;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread;

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate gyre_kernel as kernel;

/// Implemented on a system type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
pub unsafe trait PortInstance:
    KernelTraits + Port<PortActivityState = ActivityState>
{
    fn port_state() -> &'static State;
}

/// An activity's control-block address, used as its identity.
type Key = usize;

fn key<Traits: Port>(cb: &'static ActivityCb<Traits>) -> Key {
    cb as *const _ as usize
}

/// The life cycle of the thread backing an activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tsm {
    /// No context has been synthesized yet; the kernel has to call
    /// `initialize_activity` before this activity can be dispatched.
    Uninit,
    /// The initial context exists but no thread has been spawned.
    Dormant,
    /// A thread is backing the activity.
    Live,
}

/// The port's per-activity state.
///
/// This field is expected to be accessed under the run-token lock, so a spin
/// mutex is sufficient; runtime performance is not a concern here.
#[derive(Debug)]
pub struct ActivityState {
    tsm: SpinMutex<Tsm>,
}

impl ActivityState {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            tsm: SpinMutex::new(Tsm::Uninit),
        }
    }
}

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding methods of [`Port`].
#[doc(hidden)]
pub struct State {
    inner: Mutex<Inner>,
    cond: Condvar,
}

#[derive(Debug)]
struct Inner {
    /// The simulated interrupt mask.
    cpu_lock: bool,
    /// Pended (not yet taken) timer interrupts.
    pending_ticks: u32,
    /// Pended context-switch trap (deferred-switch scheme).
    deferred_switch_pending: bool,
    /// The activity currently holding the run token.
    running: Option<Key>,
    /// Set once the first activity has been dispatched.
    started: bool,
}

impl Inner {
    fn has_pending_interrupt(&self) -> bool {
        self.deferred_switch_pending || self.pending_ticks > 0
    }
}

#[allow(clippy::missing_safety_doc)]
impl State {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cpu_lock: false,
                pending_ticks: 0,
                deferred_switch_pending: false,
                running: None,
                started: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock_inner(&'static self) -> MutexGuard<'static, Inner> {
        self.inner.lock().unwrap()
    }

    pub unsafe fn enter_cpu_lock<Traits: PortInstance>(&'static self) {
        let mut guard = self.lock_inner();
        assert!(!guard.cpu_lock, "critical section entered twice");
        guard.cpu_lock = true;
    }

    pub unsafe fn leave_cpu_lock<Traits: PortInstance>(&'static self) {
        let mut guard = self.lock_inner();
        assert!(guard.cpu_lock, "critical section left twice");
        guard.cpu_lock = false;
        self.drain_pending::<Traits>(guard);
    }

    pub fn is_cpu_lock_active<Traits: PortInstance>(&'static self) -> bool {
        self.lock_inner().cpu_lock
    }

    pub unsafe fn initialize_activity<Traits: PortInstance>(
        &'static self,
        cb: &'static ActivityCb<Traits>,
    ) {
        log::trace!("initialize_activity {:?}", cb.priority());
        let mut tsm = cb.port_activity_state.tsm.lock();
        match *tsm {
            Tsm::Uninit | Tsm::Dormant => *tsm = Tsm::Dormant,
            // TODO: tear down and respawn the backing thread so that
            // `ActivityRef::restart` works on this port
            Tsm::Live => unimplemented!("restarting a live activity on the hosted port"),
        }
        drop(tsm);

        #[cfg(feature = "introspect")]
        // Safety: the activity is not executing
        unsafe {
            cb.stack_region().fill(Traits::STACK_PATTERN)
        };
    }

    pub unsafe fn start_first_activity<Traits: PortInstance>(
        &'static self,
        cb: &'static ActivityCb<Traits>,
    ) -> ! {
        log::trace!("dispatching the first activity (slot {})", cb.priority());
        let mut guard = self.lock_inner();
        assert!(guard.cpu_lock);
        assert!(!guard.started, "the kernel was started twice");
        guard.started = true;
        drop(self.dispatch::<Traits>(guard, cb));

        // The boot context is discarded.
        loop {
            thread::park();
        }
    }

    pub unsafe fn context_switch<Traits: PortInstance>(
        &'static self,
        prev: &'static ActivityCb<Traits>,
        next: &'static ActivityCb<Traits>,
    ) {
        log::trace!("context_switch {} -> {}", prev.priority(), next.priority());
        let guard = self.lock_inner();
        assert!(guard.cpu_lock, "context switch outside the critical section");
        let guard = self.dispatch::<Traits>(guard, next);
        // Resumed when the token comes back; whoever switched back to us
        // held the critical section, so the kernel still owns it.
        drop(self.wait_for_turn(guard, key(prev)));
    }

    pub fn raise_deferred_switch<Traits: PortInstance>(&'static self) {
        log::trace!("raise_deferred_switch");
        let mut guard = self.lock_inner();
        guard.deferred_switch_pending = true;
        self.cond.notify_all();
    }

    /// The idle loop body: block until an interrupt is pended, then take it.
    pub fn idle_wait<Traits: PortInstance>(&'static self) {
        let mut guard = self.lock_inner();
        debug_assert!(!guard.cpu_lock);
        while !guard.has_pending_interrupt() {
            guard = self.cond.wait(guard).unwrap();
        }
        self.drain_pending::<Traits>(guard);
    }

    /// Hand the run token to `next`, spawning its backing thread on the
    /// first dispatch.
    fn dispatch<Traits: PortInstance>(
        &'static self,
        mut guard: MutexGuard<'static, Inner>,
        next: &'static ActivityCb<Traits>,
    ) -> MutexGuard<'static, Inner> {
        ensure_live::<Traits>(next);
        guard.running = Some(key(next));
        self.cond.notify_all();
        guard
    }

    /// Block until the run token comes back to `me`.
    fn wait_for_turn(
        &'static self,
        mut guard: MutexGuard<'static, Inner>,
        me: Key,
    ) -> MutexGuard<'static, Inner> {
        while guard.running != Some(me) {
            guard = self.cond.wait(guard).unwrap();
        }
        guard
    }

    /// Take pended virtual interrupts on the current thread while the
    /// interrupt window is open. This is where ticks age timeouts, where the
    /// ISR-exit scheduler preempts, and where the deferred-switch trap
    /// fires.
    fn drain_pending<Traits: PortInstance>(
        &'static self,
        mut guard: MutexGuard<'static, Inner>,
    ) {
        loop {
            if guard.cpu_lock {
                break;
            }

            if guard.pending_ticks > 0 {
                guard.pending_ticks -= 1;
                drop(guard);
                log::trace!("taking a timer interrupt");
                // Safety: interrupt context; the critical section is
                // inactive. The call may hand the run token away and only
                // return once it comes back.
                unsafe { <Traits as PortToKernel>::timer_tick() };
                guard = self.lock_inner();
                debug_assert!(!guard.cpu_lock);
                continue;
            }

            #[cfg(feature = "deferred_switch")]
            if guard.deferred_switch_pending {
                guard.deferred_switch_pending = false;
                drop(guard);
                log::trace!("taking the context-switch trap");
                // Safety: trap context; the critical section is inactive
                let swap = unsafe { <Traits as PortToKernel>::deferred_switch() };
                guard = self.lock_inner();
                if let Some((prev, next)) = swap {
                    let inner = self.dispatch::<Traits>(guard, next);
                    guard = self.wait_for_turn(inner, key(prev));
                    // The trap return path leaves interrupts enabled.
                    guard.cpu_lock = false;
                }
                continue;
            }

            break;
        }
    }
}

/// Spawn the backing thread for `cb` if it doesn't have one yet.
fn ensure_live<Traits: PortInstance>(cb: &'static ActivityCb<Traits>) {
    let mut tsm = cb.port_activity_state.tsm.lock();
    match *tsm {
        Tsm::Live => {}
        Tsm::Dormant => {
            *tsm = Tsm::Live;
            log::trace!("spawning a thread for activity slot {}", cb.priority());
            thread::Builder::new()
                .name(format!("activity-{}", cb.priority()))
                .spawn(move || activity_thread::<Traits>(cb))
                .unwrap();
        }
        Tsm::Uninit => panic!("an uninitialized activity was dispatched"),
    }
}

/// The backing thread: wait to be dispatched for the first time, then enter
/// the activity's body. The synthetic first frame of a real port enters the
/// body with interrupts enabled, so the first dispatch clears the CPU lock;
/// interrupts pended across the first dispatch are taken at the activity's
/// first critical-section boundary.
fn activity_thread<Traits: PortInstance>(cb: &'static ActivityCb<Traits>) {
    let state = Traits::port_state();
    let mut guard = state.lock_inner();
    let me = key(cb);
    while guard.running != Some(me) {
        guard = state.cond.wait(guard).unwrap();
    }
    guard.cpu_lock = false;
    drop(guard);

    log::debug!("activity slot {} is now running", cb.priority());
    (cb.entry_point())()
}

/// Boot the kernel on a detached thread and return once the first activity
/// has been dispatched. The calling thread then acts as the external
/// hardware: it can inject ticks with [`post_tick`] and observe shared
/// state.
pub fn boot<Traits: PortInstance>() {
    let _ = env_logger::builder().is_test(true).try_init();

    let state = Traits::port_state();
    assert!(
        !state.lock_inner().started,
        "the kernel was already booted"
    );

    thread::Builder::new()
        .name("boot".into())
        .spawn(|| {
            // Safety: we are the port; the kernel expects the critical
            // section to be active on entry to `boot`
            unsafe {
                Traits::enter_cpu_lock();
                <Traits as PortToKernel>::boot();
            }
        })
        .unwrap();

    let mut guard = state.lock_inner();
    while !guard.started {
        guard = state.cond.wait(guard).unwrap();
    }
}

/// Pend a timer interrupt from an external thread. It is taken the next time
/// the running activity opens the interrupt window (or immediately, if the
/// idle activity is waiting for one).
pub fn post_tick<Traits: PortInstance>() {
    let state = Traits::port_state();
    let mut guard = state.lock_inner();
    guard.pending_ticks += 1;
    state.cond.notify_all();
}

/// Implement [`Port`] (and [`PortInstance`]) on a system type, backed by
/// this port.
///
/// ```ignore
/// gyre_port_std::use_port!(unsafe struct System);
/// impl gyre_kernel::KernelHooks for System {}
/// gyre_kernel::static_kernel! { impl Kernel for System { /* … */ } }
/// ```
#[macro_export]
macro_rules! use_port {
    (unsafe struct $SystemTraits:ident) => {
        struct $SystemTraits;

        mod port_std_impl {
            use super::$SystemTraits;
            use $crate::kernel::{ActivityCb, Port, PriorityOrder};
            use $crate::{ActivityState, PortInstance, State};

            pub(super) static PORT_STATE: State = State::new();

            unsafe impl PortInstance for $SystemTraits {
                #[inline]
                fn port_state() -> &'static State {
                    &PORT_STATE
                }
            }

            // Assume `$SystemTraits: KernelCfg1 + KernelCfg2 + KernelHooks`
            unsafe impl Port for $SystemTraits {
                type PortActivityState = ActivityState;
                #[allow(clippy::declare_interior_mutable_const)]
                const PORT_ACTIVITY_STATE_INIT: ActivityState = ActivityState::new();
                const PRIORITY_ORDER: PriorityOrder = PriorityOrder::Ascending;

                unsafe fn start_first_activity(activity: &'static ActivityCb<Self>) -> ! {
                    unsafe { PORT_STATE.start_first_activity::<Self>(activity) }
                }

                unsafe fn context_switch(
                    prev: &'static ActivityCb<Self>,
                    next: &'static ActivityCb<Self>,
                ) {
                    unsafe { PORT_STATE.context_switch::<Self>(prev, next) }
                }

                unsafe fn raise_deferred_switch() {
                    PORT_STATE.raise_deferred_switch::<Self>()
                }

                unsafe fn initialize_activity(activity: &'static ActivityCb<Self>) {
                    unsafe { PORT_STATE.initialize_activity::<Self>(activity) }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock::<Self>() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock::<Self>() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active::<Self>()
                }

                fn target_idle_hook() {
                    PORT_STATE.idle_wait::<Self>()
                }
            }
        }
    };
}
