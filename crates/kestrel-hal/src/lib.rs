//! Hardware Abstraction Layer trait for Kestrel
//!
//! The kernel runtime reaches the platform only through [`HAL`]: time,
//! entropy, debug output, inter-processor interrupts and the final halt.
//! Boot, interrupt controllers and device enumeration sit behind an
//! implementation of this trait and are invisible to the kernel.
//!
//! # Platform Implementations
//!
//! - **Bare metal**: local APIC / GIC for IPIs, serial port for debug output
//! - **Host tests**: [`TestHal`], a manual clock that records IPIs and output

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use kestrel_sync::SpinLock;

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Multi-core coordination (core count, inter-processor interrupts)
/// - Time measurement
/// - Entropy (random numbers)
/// - Debug output and fatal halt
pub trait HAL: Send + Sync + 'static {
    // === Cores ===

    /// Number of logical cores brought up at boot
    fn core_count(&self) -> u32;

    /// Deliver an inter-processor interrupt
    ///
    /// # Arguments
    /// * `target_core` - Logical core index
    /// * `vector` - Interrupt vector to raise on the target
    ///
    /// # Returns
    /// * `Ok(())` - Interrupt posted
    /// * `Err(HalError::NoSuchCore)` - Target core was never brought up
    fn send_ipi(&self, target_core: u32, vector: u8) -> Result<(), HalError>;

    // === Time & Entropy ===

    /// Get current time in nanoseconds (monotonic)
    fn now_nanos(&self) -> u64;

    /// Fill buffer with random bytes
    ///
    /// # Returns
    /// * `Ok(())` - Buffer filled successfully
    /// * `Err(HalError::NotSupported)` - Entropy source not available
    fn random_bytes(&self, buf: &mut [u8]) -> Result<(), HalError>;

    // === Debug ===

    /// Write a debug message to the platform's console/log
    fn debug_write(&self, msg: &str);

    /// Stop every core after printing a diagnostic
    ///
    /// Called for conditions the kernel cannot recover from: lock timeouts,
    /// corrupted allocator metadata, illegal state transitions.
    fn halt(&self, reason: &str) -> !;
}

/// HAL errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Operation not supported on this platform
    NotSupported,
    /// Core index out of range
    NoSuchCore,
    /// Invalid argument
    InvalidArgument,
    /// I/O error
    IoError,
}

/// A minimal test HAL for unit testing
///
/// Time only moves when a test calls [`TestHal::advance`]. Every IPI and
/// debug line is recorded so tests can assert on them.
pub struct TestHal {
    cores: u32,
    time: AtomicU64,
    ipis: SpinLock<Vec<(u32, u8)>>,
    debug_log: SpinLock<Vec<String>>,
}

impl TestHal {
    pub fn new(cores: u32) -> Self {
        Self {
            cores,
            time: AtomicU64::new(0),
            ipis: SpinLock::named("test-hal-ipis", Vec::new()),
            debug_log: SpinLock::named("test-hal-log", Vec::new()),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, nanos: u64) -> u64 {
        self.time.fetch_add(nanos, Ordering::SeqCst) + nanos
    }

    pub fn set_time(&self, nanos: u64) {
        self.time.store(nanos, Ordering::SeqCst);
    }

    /// Drain recorded `(core, vector)` pairs
    pub fn take_ipis(&self) -> Vec<(u32, u8)> {
        core::mem::take(&mut *self.ipis.lock())
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.debug_log.lock().clone()
    }
}

impl Default for TestHal {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HAL for TestHal {
    fn core_count(&self) -> u32 {
        self.cores
    }

    fn send_ipi(&self, target_core: u32, vector: u8) -> Result<(), HalError> {
        if target_core >= self.cores {
            return Err(HalError::NoSuchCore);
        }
        self.ipis.lock().push((target_core, vector));
        Ok(())
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buf: &mut [u8]) -> Result<(), HalError> {
        for byte in buf.iter_mut() {
            *byte = 0x42;
        }
        Ok(())
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.lock().push(String::from(msg));
    }

    fn halt(&self, reason: &str) -> ! {
        panic!("halt: {}", reason)
    }
}
