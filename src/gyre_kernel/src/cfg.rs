//! Static configuration mechanism for the kernel.
//!
//! [`static_kernel!`] instantiates, for one system type, the activity
//! control-block pool, the priority-indexed activity table, the single
//! stack pool all activity stacks are carved from, and the kernel state
//! singleton, and wires them up by implementing [`KernelCfg1`] and
//! [`KernelCfg2`].
//!
//! [`static_kernel!`]: crate::static_kernel
//! [`KernelCfg1`]: crate::KernelCfg1
//! [`KernelCfg2`]: crate::KernelCfg2
use crate::{activity::ActivityCb, Port, Priority, ProcMap};

/// Compile-time validation of the basic configuration quantities.
pub const fn check_config<M: ProcMap>(process_count: usize) {
    assert!(
        process_count >= 1 && process_count <= 31,
        "the user activity count must be in `1..=31`"
    );
    assert!(
        M::BITS as usize >= process_count + 1,
        "the process-bitmap type is too narrow for this activity count"
    );
}

/// Total stack-pool length, in words.
pub const fn sum(sizes: &[usize]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < sizes.len() {
        total += sizes[i];
        i += 1;
    }
    total
}

/// Compute `perm` such that `perm[slot]` is the pool index of the activity
/// installed at priority slot `slot`. Rejects duplicate or missing
/// priorities at compile time: exactly one activity per slot may exist.
pub const fn table_permutation<const N: usize>(priorities: &[Priority; N]) -> [usize; N] {
    let mut perm = [0usize; N];
    let mut slot = 0;
    while slot < N {
        let mut found = usize::MAX;
        let mut i = 0;
        while i < N {
            if priorities[i] as usize == slot {
                assert!(
                    found == usize::MAX,
                    "two activities were given the same priority"
                );
                found = i;
            }
            i += 1;
        }
        assert!(
            found != usize::MAX,
            "every priority slot must have exactly one activity"
        );
        perm[slot] = found;
        slot += 1;
    }
    perm
}

/// Build the priority-indexed activity table from the control-block pool
/// and the permutation computed by [`table_permutation`].
pub const fn build_table<Traits: Port, const N: usize>(
    pool: &'static [ActivityCb<Traits>; N],
    perm: &[usize; N],
) -> [&'static ActivityCb<Traits>; N] {
    let mut table: [&'static ActivityCb<Traits>; N] = [&pool[0]; N];
    let mut slot = 0;
    while slot < N {
        table[slot] = &pool[perm[slot]];
        slot += 1;
    }
    table
}

/// Define the static configuration of a kernel instance on a system type.
///
/// The system type must also implement [`Port`] (usually through a port
/// crate's `use_port!`) and [`KernelHooks`].
///
/// `priority` is the activity's *label*: `0` is the most preferred user
/// activity, and labels must form `0..process_count`. The macro maps labels
/// onto bitmap slots according to the port's priority order and installs
/// the idle activity in the remaining slot.
///
/// ```ignore
/// gyre_kernel::static_kernel! {
///     impl Kernel for System {
///         process_count: 2,
///         map: u8,
///         idle_stack_words: 64,
///         activities: [
///             { priority: 0, entry: control_loop, stack_words: 256 },
///             { priority: 1, entry: background, stack_words: 256, name: "bg" },
///         ],
///     }
/// }
/// ```
///
/// [`Port`]: crate::Port
/// [`KernelHooks`]: crate::KernelHooks
#[macro_export]
macro_rules! static_kernel {
    (@or () ($default:expr)) => {
        $default
    };
    (@or ($value:expr) ($default:expr)) => {
        $value
    };

    (
        impl Kernel for $Sys:ty {
            process_count: $count:expr,
            map: $Map:ty,
            idle_stack_words: $idle_words:expr,
            activities: [
                $( {
                    priority: $pri:expr,
                    entry: $entry:expr,
                    stack_words: $words:expr
                    $(, name: $name:expr)?
                    $(, start_suspended: $susp:expr)?
                    $(,)?
                } ),+
                $(,)?
            ]
            $(, tick_nests_interrupts: $nests:expr)?
            $(,)?
        }
    ) => {
        const _: () = $crate::cfg::check_config::<$Map>($count);

        #[doc(hidden)]
        mod __gyre_static_kernel {
            use super::*;

            #[allow(clippy::declare_interior_mutable_const)]
            const CB_INIT: [$crate::ActivityCb<$Sys>; { $count + 1 }] = [
                $(
                    $crate::ActivityCb::new(
                        $crate::utils::user_bit_index(
                            <$Sys as $crate::Port>::PRIORITY_ORDER,
                            $count,
                            $pri,
                        ),
                        $entry,
                        $words,
                        $crate::static_kernel!(@or ($($name)?) (stringify!($entry))),
                        $crate::static_kernel!(@or ($($susp)?) (false)),
                    ),
                )+
                $crate::ActivityCb::new(
                    $crate::utils::idle_priority(
                        <$Sys as $crate::Port>::PRIORITY_ORDER,
                        $count,
                    ),
                    $crate::activity::idle_entry::<$Sys>,
                    $idle_words,
                    "idle",
                    false,
                ),
            ];

            const PRIORITIES: [$crate::Priority; { $count + 1 }] = [
                $(
                    $crate::utils::user_bit_index(
                        <$Sys as $crate::Port>::PRIORITY_ORDER,
                        $count,
                        $pri,
                    ),
                )+
                $crate::utils::idle_priority(<$Sys as $crate::Port>::PRIORITY_ORDER, $count),
            ];

            const PERMUTATION: [usize; { $count + 1 }] =
                $crate::cfg::table_permutation(&PRIORITIES);

            const STACK_SIZES: [usize; { $count + 1 }] = [$($words,)+ $idle_words];

            pub(super) const STACK_POOL_WORDS: usize = $crate::cfg::sum(&STACK_SIZES);

            pub(super) static CB_POOL: [$crate::ActivityCb<$Sys>; { $count + 1 }] = CB_INIT;

            pub(super) static TABLE: [&'static $crate::ActivityCb<$Sys>; { $count + 1 }] =
                $crate::cfg::build_table(&CB_POOL, &PERMUTATION);

            pub(super) static STACK_POOL: $crate::utils::RawCell<
                [$crate::StackItem; STACK_POOL_WORDS],
            > = $crate::utils::RawCell::new([0; STACK_POOL_WORDS]);

            pub(super) static STATE: $crate::State<$Sys> =
                <$crate::State<$Sys> as $crate::utils::Init>::INIT;
        }

        // Safety: the quantities match the tables instantiated above
        unsafe impl $crate::KernelCfg1 for $Sys {
            const PROCESS_COUNT: usize = $count;
            type Map = $Map;
            const TICK_NESTS_INTERRUPTS: bool =
                $crate::static_kernel!(@or ($($nests)?) (false));
        }

        // Safety: `TABLE` is complete and priority-indexed by construction
        // (`table_permutation` rejects anything else at compile time)
        unsafe impl $crate::KernelCfg2 for $Sys {
            #[inline(always)]
            fn state() -> &'static $crate::State<Self> {
                &__gyre_static_kernel::STATE
            }

            #[inline(always)]
            fn activity_table() -> &'static [&'static $crate::ActivityCb<Self>] {
                &__gyre_static_kernel::TABLE
            }

            #[inline(always)]
            fn stack_pool() -> $crate::StackRegion {
                $crate::StackRegion::new(
                    __gyre_static_kernel::STACK_POOL.get() as *mut $crate::StackItem,
                    __gyre_static_kernel::STACK_POOL_WORDS,
                )
            }
        }
    };
}
