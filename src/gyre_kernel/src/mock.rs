//! Test fixtures: a mock port that records scheduling decisions instead of
//! switching real contexts.
//!
//! The mock port's `context_switch` returns immediately, so after a switch
//! the kernel state describes the *elected* activity while the test keeps
//! executing; tests simulate resumption by editing the state cells
//! directly. Because the expansion instantiates fixed-name statics, define
//! at most one mock kernel per module; in practice, one per `#[test]`.

/// An entry function for activities that are never dispatched.
pub(crate) fn never() -> ! {
    unreachable!("mock activities are never dispatched");
}

macro_rules! mock_kernel {
    (struct $Sys:ident, order: $order:expr) => {
        struct $Sys;

        mod __mock_port {
            use std::sync::atomic::{AtomicBool, Ordering};
            use std::sync::Mutex;

            pub(super) static LOCK_ACTIVE: AtomicBool = AtomicBool::new(false);
            pub(super) static SWITCHES: Mutex<Vec<(u8, u8)>> = Mutex::new(Vec::new());

            #[cfg(feature = "deferred_switch")]
            pub(super) static TRAP_PENDING: AtomicBool = AtomicBool::new(false);
            #[cfg(feature = "deferred_switch")]
            pub(super) static IN_TRAP: AtomicBool = AtomicBool::new(false);

            pub(super) fn enter_lock() {
                assert!(
                    !LOCK_ACTIVE.swap(true, Ordering::Relaxed),
                    "critical section entered twice"
                );
            }

            pub(super) fn leave_lock() {
                assert!(
                    LOCK_ACTIVE.swap(false, Ordering::Relaxed),
                    "critical section left twice"
                );
            }
        }

        unsafe impl $crate::Port for $Sys {
            type PortActivityState = ();
            const PORT_ACTIVITY_STATE_INIT: () = ();
            const PRIORITY_ORDER: $crate::PriorityOrder = $order;

            unsafe fn start_first_activity(
                _activity: &'static $crate::ActivityCb<Self>,
            ) -> ! {
                unreachable!("the mock port never dispatches");
            }

            unsafe fn context_switch(
                prev: &'static $crate::ActivityCb<Self>,
                next: &'static $crate::ActivityCb<Self>,
            ) {
                __mock_port::SWITCHES
                    .lock()
                    .unwrap()
                    .push((prev.priority(), next.priority()));
            }

            #[cfg(feature = "deferred_switch")]
            unsafe fn raise_deferred_switch() {
                __mock_port::TRAP_PENDING.store(true, std::sync::atomic::Ordering::Relaxed);
            }

            unsafe fn initialize_activity(activity: &'static $crate::ActivityCb<Self>) {
                #[cfg(feature = "introspect")]
                // Safety: the activity is not running
                unsafe {
                    activity.stack_region().fill(Self::STACK_PATTERN)
                };
                #[cfg(not(feature = "introspect"))]
                let _ = activity;
            }

            unsafe fn enter_cpu_lock() {
                __mock_port::enter_lock();
            }

            unsafe fn leave_cpu_lock() {
                __mock_port::leave_lock();

                // A pended context-switch trap fires as soon as the
                // interrupt window reopens.
                #[cfg(feature = "deferred_switch")]
                {
                    use std::sync::atomic::Ordering;
                    if !__mock_port::IN_TRAP.load(Ordering::Relaxed)
                        && __mock_port::TRAP_PENDING.swap(false, Ordering::Relaxed)
                    {
                        __mock_port::IN_TRAP.store(true, Ordering::Relaxed);
                        // Safety: trap context; the critical section is off
                        if let Some((prev, next)) =
                            unsafe { <$Sys as $crate::PortToKernel>::deferred_switch() }
                        {
                            __mock_port::SWITCHES
                                .lock()
                                .unwrap()
                                .push((prev.priority(), next.priority()));
                        }
                        __mock_port::IN_TRAP.store(false, Ordering::Relaxed);
                    }
                }
            }

            fn is_cpu_lock_active() -> bool {
                __mock_port::LOCK_ACTIVE.load(std::sync::atomic::Ordering::Relaxed)
            }
        }

        impl $crate::KernelHooks for $Sys {}

        impl $Sys {
            /// The context switches observed so far, as `(from, to)` slots.
            #[allow(dead_code)]
            fn switch_log() -> Vec<(u8, u8)> {
                __mock_port::SWITCHES.lock().unwrap().clone()
            }
        }
    };
}
