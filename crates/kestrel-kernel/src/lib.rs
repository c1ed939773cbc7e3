//! Kestrel Kernel - runtime wrapper around `kestrel-core`
//!
//! `kestrel-core` holds every kernel data structure but never touches
//! hardware. This crate puts a [`HAL`](kestrel_hal::HAL) underneath it and a
//! syscall boundary on top:
//!
//! - [`Kernel::syscall`] decodes raw register values, dispatches, and is the
//!   only place a [`KernelError`](kestrel_core::KernelError) becomes a
//!   negative errno
//! - every request and response is recorded in the
//!   [`SysLog`](kestrel_axiom::SysLog)
//! - IPIs queued by the scheduler are delivered through the HAL
//! - memory exhaustion goes through a pluggable [`OomPolicy`]
//! - statically linked modules are tracked by the [`ModuleRegistry`]
//!
//! # Module Organization
//!
//! - `syscall` - Syscall numbers, `Errno`, decoding
//! - `kernel` - `Kernel<H>`: syscall entry, handlers, scheduling points
//! - `config` - `KernelConfig` (JSON)
//! - `oom` - Out-of-memory policies
//! - `module` - Module registry

#![no_std]
#![forbid(unsafe_code)]
extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod config;
pub mod kernel;
pub mod module;
pub mod oom;
pub mod syscall;

pub use config::{ConfigError, KernelConfig};
pub use kernel::{CoreAction, FaultOutcome, Kernel, KernelStats, FAULT_EXIT_CODE};
pub use module::{ModuleDescriptor, ModuleError, ModuleRegistry};
pub use oom::{FailAllocation, KillRequester, OomAction, OomContext, OomPolicy};
pub use syscall::{numbers, Errno, Syscall, SyscallOutcome, ToErrno};

pub use kestrel_hal::{HalError, HAL};
