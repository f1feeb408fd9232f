//! A single periodic activity plus idle: the periodic body toggles an
//! output every 10 ticks, and the tick/hook bookkeeping is checked against
//! the exact number of injected ticks.
mod common;

use common::wait_until;
use gyre_kernel::System;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

gyre_port_std::use_port!(unsafe struct SystemTraits);

static TOGGLES: AtomicUsize = AtomicUsize::new(0);
static SWITCH_HOOKS: AtomicUsize = AtomicUsize::new(0);
static TICK_HOOKS: AtomicUsize = AtomicUsize::new(0);
static WAKE_TIMES: Mutex<Vec<u32>> = Mutex::new(Vec::new());

impl gyre_kernel::KernelHooks for SystemTraits {
    fn systimer_hook() {
        TICK_HOOKS.fetch_add(1, Ordering::SeqCst);
    }

    fn context_switch_hook() {
        SWITCH_HOOKS.fetch_add(1, Ordering::SeqCst);
    }
}

fn periodic() -> ! {
    loop {
        System::<SystemTraits>::sleep(10);
        WAKE_TIMES
            .lock()
            .unwrap()
            .push(System::<SystemTraits>::tick_count());
        TOGGLES.fetch_add(1, Ordering::SeqCst);
    }
}

gyre_kernel::static_kernel! {
    impl Kernel for SystemTraits {
        process_count: 1,
        map: u8,
        idle_stack_words: 64,
        activities: [
            { priority: 0, entry: periodic, stack_words: 256, name: "periodic" },
        ],
    }
}

#[test]
fn periodic_sleep_toggles_once_per_period() {
    gyre_port_std::boot::<SystemTraits>();

    // Drive one 10-tick period at a time, waiting for the toggle before
    // starting the next period so that every tick ages an armed timeout.
    for period in 1..=5 {
        for _ in 0..10 {
            gyre_port_std::post_tick::<SystemTraits>();
        }
        wait_until("the periodic toggle", || {
            TOGGLES.load(Ordering::SeqCst) >= period
        });
    }

    // 50 ticks drive exactly five 10-tick periods.
    assert_eq!(TOGGLES.load(Ordering::SeqCst), 5);
    assert_eq!(TICK_HOOKS.load(Ordering::SeqCst), 50);
    assert_eq!(*WAKE_TIMES.lock().unwrap(), [10, 20, 30, 40, 50]);

    // Every period is a round trip between the periodic activity and idle.
    assert!(SWITCH_HOOKS.load(Ordering::SeqCst) >= 10);
}
