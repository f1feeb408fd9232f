//! The simulated counterpart of the classic blinking-LED system: one
//! periodic activity plus idle, with the host process acting as a 1 kHz
//! timer.
//!
//! ```sh
//! cargo run -p gyre_port_std --example blinky
//! ```
use gyre_kernel::System;
use std::sync::atomic::{AtomicUsize, Ordering};

gyre_port_std::use_port!(unsafe struct SystemTraits);

impl gyre_kernel::KernelHooks for SystemTraits {}

static BLINKS: AtomicUsize = AtomicUsize::new(0);

fn blinker() -> ! {
    loop {
        System::<SystemTraits>::sleep(100);
        let n = BLINKS.fetch_add(1, Ordering::SeqCst) + 1;
        println!("blink #{n} at tick {}", System::<SystemTraits>::tick_count());
    }
}

gyre_kernel::static_kernel! {
    impl Kernel for SystemTraits {
        process_count: 1,
        map: u8,
        idle_stack_words: 64,
        activities: [
            { priority: 0, entry: blinker, stack_words: 256, name: "blinker" },
        ],
    }
}

fn main() {
    gyre_port_std::boot::<SystemTraits>();

    for _ in 0..500 {
        gyre_port_std::post_tick::<SystemTraits>();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }

    println!("{} blinks observed", BLINKS.load(Ordering::SeqCst));
}
