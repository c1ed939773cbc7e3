//! Kestrel Sync Primitives - Consolidated Unsafe Code TCB
//!
//! Every `unsafe` block the kernel needs for shared mutable state lives in
//! this crate. `kestrel-core` and `kestrel-kernel` are `#![forbid(unsafe_code)]`
//! and reach shared state only through the wrappers defined here.
//!
//! # Module Organization
//!
//! - `spinlock` - Bounded busy-wait lock returning `Acquired` or `TimedOut`,
//!   with the fatal "suspected deadlock" behavior layered on as a policy
//! - `refcount` - Counted-ownership primitive with explicit acquire/release
//! - `loom_tests` - Concurrency tests using loom (with `loom` feature)
//!
//! # Verification
//!
//! 1. **Loom tests** (`cargo test --features loom`): interleaving exploration
//! 2. **Kani proofs** (`cargo kani`): refcount arithmetic
//! 3. **Unit tests**: single- and multi-threaded host tests

#![no_std]

#[cfg(test)]
extern crate std;

pub mod refcount;
pub mod spinlock;


pub use refcount::{RefCount, Release};
pub use spinlock::{
    Acquisition, Deadlock, LockTimeout, SpinLock, SpinLockGuard, TimeoutPolicy,
    DEFAULT_SPIN_LIMIT,
};
