//! Byte channels
//!
//! A bounded FIFO of raw bytes with blocking producers and consumers. The
//! ring is deliberately value-only; it lives in the channel's hot path and
//! must not pay for generics.
use crate::{
    activity::current_activity, klock, utils::Init, wait::WaitSet, KernelTraits, Port,
};

/// Fixed-capacity byte ring. Counter plus first/last indices that wrap on
/// reaching the capacity.
pub(crate) struct ByteRing<const N: usize> {
    buf: [u8; N],
    count: usize,
    first: usize,
    last: usize,
}

impl<const N: usize> ByteRing<N> {
    pub(crate) const fn new() -> Self {
        Self {
            buf: [0; N],
            count: 0,
            first: 0,
            last: 0,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    pub(crate) fn free(&self) -> usize {
        N - self.count
    }

    /// Enqueue one byte. The caller guarantees space.
    pub(crate) fn put(&mut self, byte: u8) {
        debug_assert!(self.count < N);
        self.buf[self.last] = byte;
        self.last += 1;
        self.count += 1;
        if self.last == N {
            self.last = 0;
        }
    }

    /// Dequeue one byte. The caller guarantees data.
    pub(crate) fn get(&mut self) -> u8 {
        debug_assert!(self.count > 0);
        let byte = self.buf[self.first];
        self.count -= 1;
        self.first += 1;
        if self.first == N {
            self.first = 0;
        }
        byte
    }

    /// Bulk enqueue. The caller guarantees space for the whole slice.
    pub(crate) fn write(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.free());
        for &byte in data {
            self.put(byte);
        }
    }

    /// Bulk dequeue. The caller guarantees the whole slice can be filled.
    pub(crate) fn read(&mut self, data: &mut [u8]) {
        debug_assert!(data.len() <= self.count);
        for slot in data {
            *slot = self.get();
        }
    }
}

/// A bounded byte FIFO with producer and consumer wait sets.
///
/// All operations are all-or-nothing: a producer (consumer) suspends until
/// its whole request fits (is available), so no partial transfer is ever
/// committed.
pub struct Channel<Traits: Port, const N: usize> {
    ring: klock::CpuLockCell<Traits, ByteRing<N>>,
    producers: WaitSet<Traits>,
    consumers: WaitSet<Traits>,
}

impl<Traits: Port, const N: usize> Channel<Traits, N> {
    pub const fn new() -> Self {
        assert!(N > 0 && N <= 256, "channel capacity must be 1..=256 bytes");
        Self {
            ring: klock::CpuLockCell::new(ByteRing::new()),
            producers: WaitSet::new(),
            consumers: WaitSet::new(),
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<Traits: Port, const N: usize> Init for Channel<Traits, N> {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self::new();
}

impl<Traits: Port, const N: usize> Default for Channel<Traits, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Traits: KernelTraits, const N: usize> Channel<Traits, N> {
    /// Enqueue one byte, suspending while the channel is full.
    pub fn push(&'static self, byte: u8) {
        let mut lock = klock::lock_cpu::<Traits>();

        while self.ring.read(&*lock).free() == 0 {
            self.suspend_no_deadline(&self.producers, lock.borrow_mut());
        }

        self.ring.write(&mut *lock).put(byte);
        self.consumers.resume_all(lock.borrow_mut());
    }

    /// Dequeue one byte, suspending while the channel is empty.
    pub fn pop(&'static self) -> u8 {
        let mut lock = klock::lock_cpu::<Traits>();

        while self.ring.read(&*lock).count() == 0 {
            self.suspend_no_deadline(&self.consumers, lock.borrow_mut());
        }

        let byte = self.ring.write(&mut *lock).get();
        self.producers.resume_all(lock.borrow_mut());
        byte
    }

    /// Enqueue a whole slice, suspending until it fits at once.
    /// `data.len()` must not exceed the capacity.
    pub fn write(&'static self, data: &[u8]) {
        assert!(data.len() <= N, "bulk write exceeds the channel capacity");
        let mut lock = klock::lock_cpu::<Traits>();

        while self.ring.read(&*lock).free() < data.len() {
            self.suspend_no_deadline(&self.producers, lock.borrow_mut());
        }

        self.ring.write(&mut *lock).write(data);
        self.consumers.resume_all(lock.borrow_mut());
    }

    /// Dequeue a whole slice, suspending until it can be filled at once.
    /// `data.len()` must not exceed the capacity.
    pub fn read(&'static self, data: &mut [u8]) {
        assert!(data.len() <= N, "bulk read exceeds the channel capacity");
        let mut lock = klock::lock_cpu::<Traits>();

        while self.ring.read(&*lock).count() < data.len() {
            self.suspend_no_deadline(&self.consumers, lock.borrow_mut());
        }

        self.ring.write(&mut *lock).read(data);
        self.producers.resume_all(lock.borrow_mut());
    }

    /// The number of buffered bytes.
    pub fn len(&self) -> usize {
        let lock = klock::lock_cpu::<Traits>();
        self.ring.read(&*lock).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel waits carry no deadline; only the primitive's own resume
    /// operations (or a forced wake-up, which simply re-suspends) end them.
    fn suspend_no_deadline(
        &'static self,
        waiters: &'static WaitSet<Traits>,
        mut lock: klock::CpuLockTokenRefMut<'_, Traits>,
    ) {
        let cb = current_activity::<Traits>(&lock);
        debug_assert_eq!(cb.timeout.get(&*lock), 0);
        waiters.suspend(lock.borrow_mut());
        // A tick or forced wake-up re-enters the loop; drop the stale
        // enrollment so the wait set stays consistent.
        let _ = waiters.is_timeouted(lock.borrow_mut());
    }
}
