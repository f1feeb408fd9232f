//! The debug-introspection surface: names, stack sizes, and stack slack.
#![cfg(feature = "introspect")]
mod common;

use common::{wait_until, SeqTracker};
use gyre_kernel::{KernelCfg2, System};

gyre_port_std::use_port!(unsafe struct SystemTraits);

static SEQ: SeqTracker = SeqTracker::new();

impl gyre_kernel::KernelHooks for SystemTraits {}

fn worker() -> ! {
    // Deplete some of this activity's (simulated) stack: the port
    // pattern-filled the region at boot, so overwriting the low words is
    // what a deep call chain would look like to the slack scanner.
    let region = SystemTraits::activity_table()[0].stack_region();
    for i in 0..10 {
        unsafe { region.as_mut_ptr().add(i).write_volatile(0xdead_0000 + i as u32) };
    }
    SEQ.expect_and_replace(0, 1);
    loop {
        System::<SystemTraits>::sleep(0);
    }
}

gyre_kernel::static_kernel! {
    impl Kernel for SystemTraits {
        process_count: 2,
        map: u8,
        idle_stack_words: 32,
        activities: [
            { priority: 0, entry: worker, stack_words: 128, name: "worker" },
            { priority: 1, entry: worker_shadow, stack_words: 64 },
        ],
    }
}

fn worker_shadow() -> ! {
    loop {
        System::<SystemTraits>::sleep(0);
    }
}

#[test]
fn names_sizes_and_slack_are_observable() {
    gyre_port_std::boot::<SystemTraits>();
    wait_until("the worker to run", || SEQ.get() == 1);

    let worker = System::<SystemTraits>::activity(0).unwrap();
    let shadow = System::<SystemTraits>::activity(1).unwrap();

    assert_eq!(worker.name(), "worker");
    assert!(shadow.name().contains("worker_shadow"));
    assert_eq!(worker.stack_size(), 128);
    assert_eq!(shadow.stack_size(), 64);

    // The worker scribbled over its first ten words; the untouched shadow
    // still shows its whole region as slack.
    assert_eq!(worker.stack_slack(), 0);
    assert_eq!(shadow.stack_slack(), 64);
}
