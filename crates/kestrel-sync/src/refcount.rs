//! Counted-ownership primitive
//!
//! Every new owner calls `acquire`, every departing owner calls `release`.
//! Exactly one `release` observes [`Release::Last`] and is responsible for
//! tearing the resource down. The counter never wraps: acquiring a released
//! object or releasing past zero is a kernel bug and panics.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// Outcome of dropping one owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Release {
    /// Other owners remain
    Remaining(usize),
    /// This was the final owner; the caller destroys the resource
    Last,
}

/// Atomic owner count.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub const fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Register one more owner. Returns the new count.
    pub fn acquire(&self) -> usize {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        if prev == 0 {
            panic!("refcount: acquire on a released object");
        }
        prev + 1
    }

    /// Drop one owner.
    pub fn release(&self) -> Release {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        match prev {
            0 => panic!("refcount: release below zero"),
            1 => {
                // Synchronize with every earlier release before teardown
                fence(Ordering::Acquire);
                Release::Last
            }
            n => Release::Remaining(n - 1),
        }
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new(1)
    }
}

// ============================================================================
// Kani Proofs
// ============================================================================

#[cfg(kani)]
mod proofs {
    use super::*;

    #[kani::proof]
    #[kani::unwind(5)]
    fn acquire_release_balances() {
        let initial: usize = kani::any();
        kani::assume(initial > 0 && initial < 4);
        let rc = RefCount::new(initial);
        rc.acquire();
        assert!(rc.release() == Release::Remaining(initial));
    }
}

// ============================================================================
// Tests
// ============================================================================
