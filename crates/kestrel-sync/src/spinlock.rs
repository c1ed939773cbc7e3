//! Bounded spinlock
//!
//! A short-hold busy-wait lock. Acquisition is bounded: `try_lock_for`
//! spins at most N times and reports `Acquisition::TimedOut` instead of
//! spinning forever. What a timeout *means* is decided separately by a
//! [`TimeoutPolicy`]; the default [`Deadlock`] policy treats it as a suspected
//! kernel deadlock and panics with a diagnostic.
//!
//! # Safety Invariants
//!
//! 1. **Mutual exclusion**: `data` is only reachable through a live guard
//! 2. **Release ordering**: unlock uses `Release`, lock uses `Acquire`
//! 3. **No recursion**: re-locking from the holder times out, it never
//!    succeeds

use core::cell::UnsafeCell;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Spin iterations before a held lock is considered deadlocked.
pub const DEFAULT_SPIN_LIMIT: u32 = 0x0FFF_FFFF;

/// Diagnostic handed to a [`TimeoutPolicy`] when acquisition gives up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockTimeout {
    /// Name given at construction
    pub name: &'static str,
    /// Iterations spun before giving up
    pub spins: u32,
}

/// What `SpinLock::lock` does when the bounded wait expires.
pub trait TimeoutPolicy {
    /// Never returns: a lock that cannot be taken leaves no safe way forward.
    fn timed_out(timeout: &LockTimeout) -> !;
}

/// Default policy: halt with a deadlock diagnostic.
pub struct Deadlock;

impl TimeoutPolicy for Deadlock {
    fn timed_out(timeout: &LockTimeout) -> ! {
        panic!(
            "suspected deadlock: lock '{}' not acquired after {} spins",
            timeout.name, timeout.spins
        )
    }
}

/// Result of a bounded acquisition attempt.
#[must_use]
pub enum Acquisition<'a, T, P: TimeoutPolicy = Deadlock> {
    /// Lock taken; released when the guard drops
    Acquired(SpinLockGuard<'a, T, P>),
    /// Spin budget exhausted while another holder kept the lock
    TimedOut,
}

impl<'a, T, P: TimeoutPolicy> Acquisition<'a, T, P> {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }

    pub fn into_guard(self) -> Option<SpinLockGuard<'a, T, P>> {
        match self {
            Acquisition::Acquired(guard) => Some(guard),
            Acquisition::TimedOut => None,
        }
    }
}

/// Busy-wait lock with a bounded spin budget.
pub struct SpinLock<T, P: TimeoutPolicy = Deadlock> {
    locked: AtomicBool,
    name: &'static str,
    spin_limit: u32,
    _policy: PhantomData<fn() -> P>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`; a guard exists for at
// most one holder at a time, so sharing the lock only requires `T: Send`.
unsafe impl<T: Send, P: TimeoutPolicy> Sync for SpinLock<T, P> {}
unsafe impl<T: Send, P: TimeoutPolicy> Send for SpinLock<T, P> {}

impl<T, P: TimeoutPolicy> SpinLock<T, P> {
    pub const fn new(data: T) -> Self {
        Self::named("anonymous", data)
    }

    /// Create a lock whose name appears in timeout diagnostics.
    pub const fn named(name: &'static str, data: T) -> Self {
        Self::with_spin_limit(name, DEFAULT_SPIN_LIMIT, data)
    }

    pub const fn with_spin_limit(name: &'static str, spin_limit: u32, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            spin_limit,
            _policy: PhantomData,
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    /// Single acquisition attempt, no spinning.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, P>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SpinLockGuard { lock: self })
    }

    /// Spin at most `spins` iterations waiting for the holder to release.
    pub fn try_lock_for(&self, spins: u32) -> Acquisition<'_, T, P> {
        let mut remaining = spins;
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Acquisition::Acquired(SpinLockGuard { lock: self });
            }
            // Test-and-test-and-set: spin on a plain load to keep the line shared
            while self.locked.load(Ordering::Relaxed) {
                if remaining == 0 {
                    return Acquisition::TimedOut;
                }
                remaining -= 1;
                core::hint::spin_loop();
            }
        }
    }

    /// Acquire within the configured spin limit, or hand off to the policy.
    pub fn lock(&self) -> SpinLockGuard<'_, T, P> {
        match self.try_lock_for(self.spin_limit) {
            Acquisition::Acquired(guard) => guard,
            Acquisition::TimedOut => P::timed_out(&LockTimeout {
                name: self.name,
                spins: self.spin_limit,
            }),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Exclusive borrow proves no guard exists.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default, P: TimeoutPolicy> Default for SpinLock<T, P> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T, P: TimeoutPolicy> fmt::Debug for SpinLock<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// RAII guard; the lock is released on drop.
pub struct SpinLockGuard<'a, T, P: TimeoutPolicy = Deadlock> {
    lock: &'a SpinLock<T, P>,
}

impl<T, P: TimeoutPolicy> Deref for SpinLockGuard<'_, T, P> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard's existence means `locked` is held by us.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, P: TimeoutPolicy> DerefMut for SpinLockGuard<'_, T, P> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` rules out aliasing guards.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, P: TimeoutPolicy> Drop for SpinLockGuard<'_, T, P> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    struct Reporting;

    impl TimeoutPolicy for Reporting {
        fn timed_out(timeout: &LockTimeout) -> ! {
            panic!("reporting policy: {} after {}", timeout.name, timeout.spins)
        }
    }

    #[test]
    fn test_lock_and_release() {
        let lock: SpinLock<u32> = SpinLock::new(1);
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 2);
    }

    #[test]
    fn test_try_lock_for_times_out_while_held() {
        let lock: SpinLock<u32> = SpinLock::named("held", 0);
        let _guard = lock.lock();

        let attempt = lock.try_lock_for(100);
        assert!(!attempt.is_acquired());
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn test_try_lock_for_acquires_when_free() {
        let lock: SpinLock<u32> = SpinLock::new(7);
        let guard = lock.try_lock_for(0).into_guard();
        assert_eq!(guard.map(|g| *g), Some(7));
    }

    #[test]
    #[should_panic(expected = "suspected deadlock: lock 'recursive'")]
    fn test_recursive_lock_is_fatal() {
        let lock: SpinLock<u32> = SpinLock::with_spin_limit("recursive", 64, 0);
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    #[should_panic(expected = "reporting policy: custom after 8")]
    fn test_custom_timeout_policy() {
        let lock: SpinLock<u32, Reporting> = SpinLock::with_spin_limit("custom", 8, 0);
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    fn test_get_mut_and_into_inner() {
        let mut lock: SpinLock<Vec<u32>> = SpinLock::new(Vec::new());
        lock.get_mut().push(3);
        assert_eq!(lock.into_inner(), [3]);
    }

    #[test]
    fn test_parallel_increments_are_serialized() {
        let lock: Arc<SpinLock<u64>> = Arc::new(SpinLock::named("counter", 0));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                thread::spawn(move || {
                    for _ in 0..10_000 {
                        *lock.lock() += 1;
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}
