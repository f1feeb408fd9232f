//! Process-bitmap operations.
//!
//! A process bitmap is a machine word in which bit `p` stands for the
//! activity installed at priority slot `p`. The kernel keeps one global
//! bitmap of runnable activities and one bitmap per blocking primitive for
//! its waiters. Which end of the word takes scheduling precedence depends on
//! the configured [`PriorityOrder`].
use super::BinUInteger;
use crate::Priority;

/// Numeric direction of scheduling precedence within a process bitmap.
///
/// In either order, priority *label* 0 denotes the most preferred user
/// activity; the order only decides how labels are laid out in the bitmap
/// (and therefore which bit-scan instruction finds the winner).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOrder {
    /// User slots occupy bit 0 upward, the idle slot is the topmost used
    /// bit, and the *lowest* set bit wins.
    Ascending,
    /// The idle slot is bit 0, user slots grow upward, and the *highest*
    /// set bit wins.
    Descending,
}

/// Types usable as a process bitmap.
pub trait ProcMap: BinUInteger {}

impl<T: BinUInteger> ProcMap for T {}

/// Return the single-bit tag for the given priority slot.
#[inline]
pub fn prio_tag<M: ProcMap>(priority: Priority) -> M {
    M::from_bit(priority as u32)
}

/// `map | tag`.
#[inline]
pub fn set_tag<M: ProcMap>(map: M, tag: M) -> M {
    map | tag
}

/// `map & !tag`.
#[inline]
pub fn clear_tag<M: ProcMap>(map: M, tag: M) -> M {
    map & !tag
}

/// Find the priority slot with the highest scheduling precedence.
///
/// The result is unspecified for an empty map. The kernel never calls this
/// with one: the idle activity's bit is permanently set in the ready map.
#[inline]
pub fn highest_priority<M: ProcMap>(map: M, order: PriorityOrder) -> Priority {
    debug_assert!(!map.is_zero());
    match order {
        PriorityOrder::Ascending => map.trailing_zeros() as Priority,
        PriorityOrder::Descending => (M::BITS - 1 - map.leading_zeros()) as Priority,
    }
}

/// The tag of the winner of [`highest_priority`].
#[inline]
pub fn highest_prio_tag<M: ProcMap>(map: M, order: PriorityOrder) -> M {
    prio_tag(highest_priority(map, order))
}

/// The priority slot occupied by the idle activity.
pub const fn idle_priority(order: PriorityOrder, process_count: usize) -> Priority {
    match order {
        PriorityOrder::Ascending => process_count as Priority,
        PriorityOrder::Descending => 0,
    }
}

/// Map a user priority label (`0` = most preferred, unique per activity) to
/// its bitmap slot.
pub const fn user_bit_index(order: PriorityOrder, process_count: usize, label: usize) -> Priority {
    assert!(label < process_count, "priority label out of range");
    match order {
        PriorityOrder::Ascending => label as Priority,
        PriorityOrder::Descending => (process_count - label) as Priority,
    }
}

/// The range of priority slots occupied by user activities. The single slot
/// left out of this range is the idle slot.
pub const fn user_priority_range(
    order: PriorityOrder,
    process_count: usize,
) -> core::ops::Range<usize> {
    match order {
        PriorityOrder::Ascending => 0..process_count,
        PriorityOrder::Descending => 1..process_count + 1,
    }
}
